//! Label selector matching used to associate Services with Pods and Deployments.

use std::collections::BTreeMap;

/// Two selectors are equal: same size and every entry matches.
pub fn selectors_match(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
}

/// `labels` satisfies `selector` when every selector entry is present with the same value.
/// An empty selector matches nothing, so selector-less Services never claim every Pod.
pub fn labels_match_selectors(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selectors_match_requires_identical_maps() {
        assert!(selectors_match(&m(&[("a", "1"), ("b", "2")]), &m(&[("a", "1"), ("b", "2")])));
        assert!(!selectors_match(&m(&[("a", "1")]), &m(&[("a", "1"), ("b", "2")])));
        assert!(!selectors_match(&m(&[("a", "1"), ("b", "3")]), &m(&[("a", "1"), ("b", "2")])));
    }

    #[test]
    fn labels_match_is_subset_and_empty_selector_matches_nothing() {
        assert!(labels_match_selectors(&m(&[("a", "1"), ("b", "2")]), &m(&[("a", "1")])));
        assert!(!labels_match_selectors(&m(&[("a", "1")]), &m(&[])));
        assert!(!labels_match_selectors(&m(&[("a", "1")]), &m(&[("a", "2")])));
        assert!(!labels_match_selectors(&m(&[]), &m(&[("a", "1")])));
    }
}
