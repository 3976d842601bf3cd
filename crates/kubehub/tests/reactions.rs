use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_aggregate::{AggregateError, FluxKind, TopologyAggregator, TopologySource};
use beacon_core::{Envelope, EnvelopeSink, EventTag, WatchKey};
use beacon_kubehub::reactions::{broadcast_and_refresh, AggregateBroadcast, LiveView, ObjectBroadcast, Recompute};
use beacon_kubehub::{negotiate, resolve_kinds, Change, Reaction, SetupError, VersionProbe};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::ApiResource;
use serde_json::json;

#[derive(Default)]
struct CollectSink(Mutex<Vec<Envelope>>);

impl CollectSink {
    fn take(&self) -> Vec<Envelope> { std::mem::take(&mut *self.0.lock().unwrap()) }
}

impl EnvelopeSink for CollectSink {
    fn publish(&self, envelope: Envelope) { self.0.lock().unwrap().push(envelope); }
}

#[tokio::test]
async fn object_changes_become_tagged_envelopes_without_managed_fields() {
    let sink = Arc::new(CollectSink::default());
    let reaction = ObjectBroadcast::<Pod>::new(sink.clone());
    let pod: Pod = serde_json::from_value(json!({
        "metadata": { "name": "web-0", "namespace": "default", "managedFields": [{ "manager": "kubelet" }] },
        "spec": { "containers": [{ "name": "web", "image": "nginx" }] }
    }))
    .unwrap();
    let pod = Arc::new(pod);

    reaction.react(Change::Created(Arc::clone(&pod))).await.unwrap();
    reaction.react(Change::Updated(pod)).await.unwrap();
    reaction.react(Change::Deleted(WatchKey::namespaced("default", "web-0"))).await.unwrap();

    let out = sink.take();
    let tags: Vec<_> = out.iter().map(|e| e.tag).collect();
    assert_eq!(tags, vec![EventTag::PodCreated, EventTag::PodUpdated, EventTag::PodDeleted]);
    assert_eq!(out[0].payload["metadata"]["name"], "web-0");
    assert_eq!(out[0].payload["kind"], "Pod");
    assert!(out[0].payload["metadata"].get("managedFields").is_none());
    assert_eq!(out[2].payload, json!("default/web-0"));
}

/// Yields `values` in turn, then repeats the last one.
struct Scripted {
    values: Vec<u32>,
    calls: AtomicU32,
    fail: bool,
}

#[async_trait]
impl Recompute for Scripted {
    type Output = Vec<u32>;
    const TAG: EventTag = EventTag::FluxStateReceived;
    async fn recompute(&self) -> Result<Vec<u32>, AggregateError> {
        if self.fail {
            return Err(AggregateError::List { kind: "GitRepository".into(), source: anyhow::anyhow!("forbidden") });
        }
        let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(vec![self.values[i.min(self.values.len() - 1)]])
    }
}

#[tokio::test]
async fn aggregate_broadcast_skips_unchanged_views() {
    let sink = Arc::new(CollectSink::default());
    let agg = Arc::new(Scripted { values: vec![1, 1, 2], calls: AtomicU32::new(0), fail: false });
    let view = Arc::new(LiveView::new(agg));
    let reaction = AggregateBroadcast::new(Arc::clone(&view), sink.clone());
    let key = WatchKey::namespaced("default", "web");
    for _ in 0..3 {
        Reaction::<Service>::react(&reaction, Change::Deleted(key.clone())).await.unwrap();
    }
    let out = sink.take();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|e| e.tag == EventTag::FluxStateReceived));
    assert_eq!(out[0].payload, json!([1]));
    assert_eq!(out[1].payload, json!([2]));
    assert_eq!(view.current().as_deref(), Some(&vec![2]));
}

#[tokio::test]
async fn aggregate_failure_is_returned_for_retry() {
    let sink = Arc::new(CollectSink::default());
    let agg = Arc::new(Scripted { values: vec![], calls: AtomicU32::new(0), fail: true });
    let reaction = AggregateBroadcast::new(Arc::new(LiveView::new(agg)), sink.clone());
    let err = Reaction::<Service>::react(&reaction, Change::Deleted(WatchKey::cluster("x"))).await.unwrap_err();
    assert!(format!("{err:#}").contains("forbidden"));
    assert!(sink.take().is_empty());
}

/// Each pass pops the next `(delay, value)`: it reads the value first, then takes
/// `delay` to finish, like a slow list.
struct Paced(Mutex<VecDeque<(u64, u32)>>);

#[async_trait]
impl Recompute for Paced {
    type Output = u32;
    const TAG: EventTag = EventTag::FluxStateReceived;
    async fn recompute(&self) -> Result<u32, AggregateError> {
        let (delay, value) = self.0.lock().unwrap().pop_front().unwrap();
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(value)
    }
}

#[tokio::test(start_paused = true)]
async fn overlapping_recomputes_publish_the_newest_view_last() {
    let sink = Arc::new(CollectSink::default());
    let view = Arc::new(LiveView::new(Arc::new(Paced(Mutex::new(VecDeque::from([(100, 1), (0, 2)]))))));
    let reaction = AggregateBroadcast::new(Arc::clone(&view), sink.clone());
    let key = WatchKey::namespaced("flux-system", "podinfo");
    let (a, b) = tokio::join!(
        Reaction::<Service>::react(&reaction, Change::Deleted(key.clone())),
        Reaction::<Service>::react(&reaction, Change::Deleted(key.clone())),
    );
    a.unwrap();
    b.unwrap();
    let payloads: Vec<_> = sink.take().into_iter().map(|e| e.payload).collect();
    assert_eq!(payloads, vec![json!(1), json!(2)]);
    assert_eq!(view.current().as_deref(), Some(&2));
}

/// Topology source backed by in-memory lists the test can edit.
#[derive(Default)]
struct Listed {
    services: Mutex<Vec<Service>>,
    pods: Mutex<Vec<Pod>>,
}

#[async_trait]
impl TopologySource for Listed {
    async fn services(&self) -> anyhow::Result<Vec<Service>> { Ok(self.services.lock().unwrap().clone()) }
    async fn pods(&self) -> anyhow::Result<Vec<Pod>> { Ok(self.pods.lock().unwrap().clone()) }
    async fn deployments(&self) -> anyhow::Result<Vec<Deployment>> { Ok(Vec::new()) }
    async fn ingresses(&self) -> anyhow::Result<Vec<Ingress>> { Ok(Vec::new()) }
}

#[tokio::test]
async fn pod_change_refreshes_service_topology() {
    let source = Arc::new(Listed::default());
    source.services.lock().unwrap().push(
        serde_json::from_value(json!({ "metadata": { "name": "web", "namespace": "default" }, "spec": { "selector": { "app": "web" } } }))
            .unwrap(),
    );
    let topology = Arc::new(LiveView::new(Arc::new(TopologyAggregator::new(source.clone()))));
    let collect = Arc::new(CollectSink::default());
    let sink: Arc<dyn EnvelopeSink> = collect.clone();
    topology.refresh(&*sink).await.unwrap();
    assert_eq!(collect.take().len(), 1);

    let pod: Pod =
        serde_json::from_value(json!({ "metadata": { "name": "web-0", "namespace": "default", "labels": { "app": "web" } } })).unwrap();
    source.pods.lock().unwrap().push(pod.clone());
    let reaction = broadcast_and_refresh::<Pod, _>(&sink, &topology);
    reaction.react(Change::Created(Arc::new(pod))).await.unwrap();

    let out = collect.take();
    let tags: Vec<_> = out.iter().map(|e| e.tag).collect();
    assert_eq!(tags, vec![EventTag::PodCreated, EventTag::ServicesReceived]);
    assert_eq!(out[1].payload[0]["pods"][0]["metadata"]["name"], "web-0");
    assert_eq!(topology.current().unwrap().services[0].pods.len(), 1);
}

/// Serves a fixed set of apiVersions and records every probe.
struct FakeProbe {
    served: Vec<&'static str>,
    probed: Mutex<Vec<String>>,
}

#[async_trait]
impl VersionProbe for FakeProbe {
    async fn probe(&self, resource: &ApiResource) -> anyhow::Result<()> {
        self.probed.lock().unwrap().push(format!("{}/{}", resource.plural, resource.version));
        if self.served.contains(&resource.api_version.as_str()) {
            Ok(())
        } else {
            anyhow::bail!("the server could not find the requested resource")
        }
    }
}

#[tokio::test]
async fn negotiation_walks_candidates_in_order() {
    let probe = FakeProbe { served: vec!["helm.toolkit.fluxcd.io/v2beta1"], probed: Mutex::default() };
    let ar = negotiate(&probe, FluxKind::HelmRelease).await.unwrap();
    assert_eq!(ar.version, "v2beta1");
    assert_eq!(*probe.probed.lock().unwrap(), vec!["helmreleases/v2", "helmreleases/v2beta2", "helmreleases/v2beta1"]);
}

#[tokio::test]
async fn missing_optional_kinds_are_skipped_but_required_ones_fail() {
    let probe = FakeProbe {
        served: vec!["source.toolkit.fluxcd.io/v1", "kustomize.toolkit.fluxcd.io/v1"],
        probed: Mutex::default(),
    };
    let kinds = resolve_kinds(&probe, &FluxKind::ALL).await.unwrap();
    let resolved: Vec<_> = kinds.iter().map(|(k, _)| *k).collect();
    assert!(resolved.contains(&FluxKind::GitRepository));
    assert!(resolved.contains(&FluxKind::Kustomization));
    assert!(!resolved.contains(&FluxKind::HelmRelease));
    assert!(!resolved.contains(&FluxKind::Terraform));

    let probe = FakeProbe { served: vec!["kustomize.toolkit.fluxcd.io/v1"], probed: Mutex::default() };
    let err = resolve_kinds(&probe, &FluxKind::ALL).await.unwrap_err();
    assert!(matches!(err, SetupError::MissingKind { kind: FluxKind::GitRepository, .. }));
}
