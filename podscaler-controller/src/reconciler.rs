use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, Resource},
    runtime::controller::Action,
    Client,
};
use kube_client;
use kube_core;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::podscaler_types::{effective_count, PodScaler, DEFAULT_REQUEUE_SECONDS};

pub const POD_NAME_PREFIX: &str = "scaled-pod-";
pub const POD_CONTAINER_NAME: &str = "nginx";
pub const POD_IMAGE: &str = "nginx:latest";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get PodScaler: {0}")]
    PodScalerGetFailed(#[source] kube::Error),
    #[error("Failed to list pods: {0}")]
    PodListFailed(#[source] kube::Error),
    #[error("Failed to create pod: {0}")]
    PodCreationFailed(#[source] kube::Error),
    #[error("Failed to delete pod: {0}")]
    PodDeletionFailed(#[source] kube::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

// Data we want access to in error/reconcile calls
pub struct Data {
    pub client: Client,
    pub requeue_after: Duration,
}

impl Data {
    pub fn new(client: Client) -> Self {
        Data {
            client,
            requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
        }
    }
}

/// Kubernetes label selector string for an exact match on every pair.
fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// The fixed pod template: generated name, owner's namespace and selector
/// as labels, single nginx container, owned by the PodScaler so that pod
/// events trigger reconciliation and deleting the PodScaler cascades.
fn scaled_pod(ps: &PodScaler) -> Result<Pod, Error> {
    let oref = ps
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(POD_NAME_PREFIX.to_string()),
            namespace: ps.metadata.namespace.clone(),
            labels: Some(ps.spec.selector.clone()),
            owner_references: Some(vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: POD_CONTAINER_NAME.to_string(),
                image: Some(POD_IMAGE.to_string()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    })
}

/// Controller triggers this whenever the PodScaler or one of its pods changed
pub async fn reconcile(ps_from_cache: Arc<PodScaler>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let ps_name = ps_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let ps_ns = ps_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    info!("Reconciling PodScaler {}/{}", ps_ns, ps_name);

    let ps_api = Api::<PodScaler>::namespaced(client.clone(), ps_ns);

    // Get the PodScaler by a quorum read instead of trusting the cached
    // object. A PodScaler that is already gone ends the reconcile; its pods
    // are garbage-collected through their owner references.
    let ps = match ps_api.get(ps_name).await {
        Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
            if reason.as_str() == "NotFound" =>
        {
            info!("PodScaler {}/{} not found, end reconcile", ps_ns, ps_name);
            return Ok(Action::await_change());
        }
        Err(e) => {
            error!("Unable to fetch PodScaler {}/{}: {}", ps_ns, ps_name, e);
            return Err(Error::PodScalerGetFailed(e));
        }
        Ok(ps) => ps,
    };

    let pod_api = Api::<Pod>::namespaced(client.clone(), ps_ns);
    let lp = ListParams::default().labels(&label_selector(&ps.spec.selector));
    let pods = match pod_api.list(&lp).await {
        Err(e) => {
            error!("Unable to list pods for PodScaler {}/{}: {}", ps_ns, ps_name, e);
            return Err(Error::PodListFailed(e));
        }
        Ok(pods) => pods,
    };

    let observed = pods.items.len();
    let desired = effective_count(&ps.spec) as usize;

    if observed < desired {
        let pod = scaled_pod(&ps)?;
        let pp = PostParams::default();
        for _ in observed..desired {
            info!("Create pod for PodScaler {}/{}", ps_ns, ps_name);
            if let Err(e) = pod_api.create(&pp, &pod).await {
                error!("Unable to create pod for PodScaler {}/{}: {}", ps_ns, ps_name, e);
                return Err(Error::PodCreationFailed(e));
            }
        }
    } else if observed > desired {
        // Oldest pods go first; name breaks timestamp ties so that the
        // deletion order is stable across passes.
        let mut candidates = pods.items;
        candidates.sort_by(|a, b| {
            let ka = (
                a.metadata.creation_timestamp.as_ref().map(|t| t.0),
                a.metadata.name.as_ref(),
            );
            let kb = (
                b.metadata.creation_timestamp.as_ref().map(|t| t.0),
                b.metadata.name.as_ref(),
            );
            ka.cmp(&kb)
        });
        let dp = DeleteParams::default();
        for pod in candidates.iter().take(observed - desired) {
            let pod_name = pod
                .metadata
                .name
                .as_ref()
                .ok_or(Error::MissingObjectKey(".metadata.name"))?;
            info!("Delete pod {} for PodScaler {}/{}", pod_name, ps_ns, ps_name);
            match pod_api.delete(pod_name, &dp).await {
                Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
                    if reason.as_str() == "NotFound" =>
                {
                    // Someone else already deleted it; that is the outcome
                    // we wanted.
                    info!("Pod {} already gone", pod_name);
                }
                Err(e) => {
                    error!("Unable to delete pod {}: {}", pod_name, e);
                    return Err(Error::PodDeletionFailed(e));
                }
                Ok(_) => {}
            }
        }
    }

    info!(
        "Reconciliation complete for PodScaler {}/{}: observed {}, desired {}",
        ps_ns, ps_name, observed, desired
    );
    Ok(Action::requeue(ctx.requeue_after))
}

/// The controller triggers this on reconcile errors
pub fn error_policy(_object: Arc<PodScaler>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podscaler_types::PodScalerSpec;
    use http::{Method, Request, Response};
    use hyper::Body;
    use serde_json::json;
    use tower_test::mock::{self, Handle, SendResponse};

    type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

    fn test_scaler(count: i32) -> PodScaler {
        let mut ps = PodScaler::new(
            "test",
            PodScalerSpec {
                count,
                selector: BTreeMap::from([("app".to_string(), "x".to_string())]),
            },
        );
        ps.metadata.namespace = Some("default".to_string());
        ps.metadata.uid = Some("c14f4d1e-0001-4a2b-9f00-000000000000".to_string());
        ps
    }

    fn test_data(client: Client) -> Arc<Data> {
        Arc::new(Data::new(client))
    }

    fn json_response(status: u16, body: serde_json::Value) -> Response<Body> {
        Response::builder()
            .status(status)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn status_not_found(name: &str) -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{} not found", name),
            "reason": "NotFound",
            "code": 404
        })
    }

    fn status_internal_error() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "boom",
            "reason": "InternalError",
            "code": 500
        })
    }

    fn status_success() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success"
        })
    }

    fn pod_json(name: &str, created: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "creationTimestamp": created,
                "labels": { "app": "x" }
            },
            "spec": {
                "containers": [ { "name": "nginx", "image": "nginx:latest" } ]
            }
        })
    }

    fn pod_list_json(pods: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": { "resourceVersion": "1" },
            "items": pods
        })
    }

    async fn expect_request(
        handle: &mut ApiServerHandle,
    ) -> (Request<Body>, SendResponse<Response<Body>>) {
        handle.next_request().await.expect("API server called")
    }

    async fn serve_get_scaler(handle: &mut ApiServerHandle, ps: &PodScaler) {
        let (request, send) = expect_request(handle).await;
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.uri().path(),
            "/apis/scaling.example.com/v1/namespaces/default/podscalers/test"
        );
        send.send_response(json_response(200, serde_json::to_value(ps).unwrap()));
    }

    async fn serve_list_pods(handle: &mut ApiServerHandle, pods: Vec<serde_json::Value>) {
        let (request, send) = expect_request(handle).await;
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
        let query = request.uri().query().unwrap_or("");
        assert!(query.contains("labelSelector"), "query was {}", query);
        assert!(query.contains("app"), "query was {}", query);
        send.send_response(json_response(200, pod_list_json(pods)));
    }

    #[tokio::test]
    async fn scale_up_creates_exactly_the_missing_pods() {
        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ps = Arc::new(test_scaler(3));
        let data = test_data(client);

        let scaler = ps.clone();
        let api_server = tokio::spawn(async move {
            serve_get_scaler(&mut handle, &scaler).await;
            serve_list_pods(&mut handle, vec![]).await;
            for _ in 0..3 {
                let (request, send) = expect_request(&mut handle).await;
                assert_eq!(request.method(), Method::POST);
                assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
                let bytes = hyper::body::to_bytes(request.into_body()).await.unwrap();
                let pod: Pod = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(pod.metadata.generate_name.as_deref(), Some(POD_NAME_PREFIX));
                assert_eq!(
                    pod.metadata.labels.as_ref().unwrap().get("app").map(String::as_str),
                    Some("x")
                );
                let orefs = pod.metadata.owner_references.as_ref().unwrap();
                assert_eq!(orefs[0].name, "test");
                assert_eq!(orefs[0].kind, "PodScaler");
                send.send_response(json_response(
                    201,
                    pod_json("scaled-pod-abcde", "2024-01-01T00:00:00Z"),
                ));
            }
        });

        reconcile(ps, data).await.expect("reconcile succeeds");
        api_server.await.unwrap();
    }

    #[tokio::test]
    async fn scale_down_deletes_oldest_pods_first() {
        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ps = Arc::new(test_scaler(2));
        let data = test_data(client);

        let scaler = ps.clone();
        let api_server = tokio::spawn(async move {
            serve_get_scaler(&mut handle, &scaler).await;
            // Listed out of creation order on purpose.
            serve_list_pods(
                &mut handle,
                vec![
                    pod_json("pod-e", "2024-01-05T00:00:00Z"),
                    pod_json("pod-a", "2024-01-01T00:00:00Z"),
                    pod_json("pod-c", "2024-01-03T00:00:00Z"),
                    pod_json("pod-b", "2024-01-02T00:00:00Z"),
                    pod_json("pod-d", "2024-01-04T00:00:00Z"),
                ],
            )
            .await;
            for expected in ["pod-a", "pod-b", "pod-c"] {
                let (request, send) = expect_request(&mut handle).await;
                assert_eq!(request.method(), Method::DELETE);
                assert_eq!(
                    request.uri().path(),
                    format!("/api/v1/namespaces/default/pods/{}", expected)
                );
                if expected == "pod-b" {
                    // Already gone; the pass keeps deleting the rest.
                    send.send_response(json_response(404, status_not_found(expected)));
                } else {
                    send.send_response(json_response(200, status_success()));
                }
            }
        });

        reconcile(ps, data).await.expect("reconcile succeeds");
        api_server.await.unwrap();
    }

    #[tokio::test]
    async fn matching_counts_issue_no_writes() {
        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ps = Arc::new(test_scaler(2));
        let data = test_data(client);

        let scaler = ps.clone();
        let api_server = tokio::spawn(async move {
            serve_get_scaler(&mut handle, &scaler).await;
            serve_list_pods(
                &mut handle,
                vec![
                    pod_json("pod-a", "2024-01-01T00:00:00Z"),
                    pod_json("pod-b", "2024-01-02T00:00:00Z"),
                ],
            )
            .await;
            // Any further request is a test failure.
            assert!(handle.next_request().await.is_none());
        });

        reconcile(ps, data).await.expect("reconcile succeeds");
        api_server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_pod_scaler_ends_reconcile_without_error() {
        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ps = Arc::new(test_scaler(3));
        let data = test_data(client);

        let api_server = tokio::spawn(async move {
            let (request, send) = expect_request(&mut handle).await;
            assert_eq!(request.method(), Method::GET);
            send.send_response(json_response(404, status_not_found("test")));
            assert!(handle.next_request().await.is_none());
        });

        reconcile(ps, data).await.expect("not-found is not an error");
        api_server.await.unwrap();
    }

    #[tokio::test]
    async fn pod_list_failure_is_retryable() {
        let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ps = Arc::new(test_scaler(3));
        let data = test_data(client);

        let scaler = ps.clone();
        let api_server = tokio::spawn(async move {
            serve_get_scaler(&mut handle, &scaler).await;
            let (_request, send) = expect_request(&mut handle).await;
            send.send_response(json_response(500, status_internal_error()));
        });

        let err = reconcile(ps, data).await.expect_err("list failure surfaces");
        assert!(matches!(err, Error::PodListFailed(_)));
        api_server.await.unwrap();
    }

    #[test]
    fn label_selector_joins_sorted_pairs() {
        let selector = BTreeMap::from([
            ("tier".to_string(), "frontend".to_string()),
            ("app".to_string(), "web".to_string()),
        ]);
        assert_eq!(label_selector(&selector), "app=web,tier=frontend");
    }

    #[test]
    fn scaled_pod_uses_the_fixed_template() {
        let ps = test_scaler(3);
        let pod = scaled_pod(&ps).unwrap();
        assert_eq!(pod.metadata.generate_name.as_deref(), Some(POD_NAME_PREFIX));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(pod.metadata.labels, Some(ps.spec.selector.clone()));
        let containers = &pod.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, POD_CONTAINER_NAME);
        assert_eq!(containers[0].image.as_deref(), Some(POD_IMAGE));
    }

    #[test]
    fn scaled_pod_requires_an_owner_uid() {
        let mut ps = test_scaler(3);
        ps.metadata.uid = None;
        assert!(matches!(
            scaled_pod(&ps),
            Err(Error::MissingObjectKey(".metadata.uid"))
        ));
    }
}
