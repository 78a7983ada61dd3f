#![allow(unused_variables)]
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams},
    discovery::Discovery,
    Client,
};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::*;

use crate::common::*;

pub fn pod_scaler() -> String {
    "
    apiVersion: scaling.example.com/v1
    kind: PodScaler
    metadata:
      name: web-scaler
      namespace: default
    spec:
      count: 3
      selector:
        app: web
    "
    .to_string()
}

pub fn pod_scaler_zero_count() -> String {
    "
    apiVersion: scaling.example.com/v1
    kind: PodScaler
    metadata:
      name: defaulted-scaler
      namespace: default
    spec:
      count: 0
      selector:
        app: defaulted
    "
    .to_string()
}

pub fn pod_scaler_empty_selector() -> String {
    "
    apiVersion: scaling.example.com/v1
    kind: PodScaler
    metadata:
      name: broken-scaler
      namespace: default
    spec:
      count: 3
      selector: {}
    "
    .to_string()
}

async fn check_crd_registered(client: Client) -> Result<(), Error> {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client);
    match crd_api.get("podscalers.scaling.example.com").await {
        Err(e) => {
            error!("No CRD found, create one before run the e2e test.");
            Err(Error::CRDGetFailed(e))
        }
        Ok(crd) => {
            info!("CRD found, continue to run the e2e test.");
            Ok(())
        }
    }
}

pub async fn wait_for_scaled_pods(
    client: Client,
    label_key: &str,
    label_value: &str,
    expected: usize,
    scaling_down: bool,
) -> Result<(), Error> {
    let timeout = Duration::from_secs(360);
    let start = Instant::now();
    let pod_api: Api<Pod> = Api::default_namespaced(client);
    let lp = ListParams::default().labels(&format!("{}={}", label_key, label_value));
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            error!("Time out waiting for {} pods", expected);
            return Err(Error::Timeout);
        }

        let pods = match pod_api.list(&lp).await {
            Err(e) => {
                info!("List pods failed with error {}.", e);
                continue;
            }
            Ok(pods) => pods,
        };
        if pods.items.len() == expected {
            info!("We have {} pods now.", expected);
            for pod in pods.items.iter() {
                let labeled = pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(label_key))
                    .map(|v| v == label_value)
                    .unwrap_or(false);
                if !labeled {
                    info!("Labels are incorrect; should have {}:{}.", label_key, label_value);
                    return Err(Error::PodScalerFailed);
                }
            }
            return Ok(());
        }
        if scaling_down && pods.items.len() > expected {
            info!(
                "Pod number is {} which is larger than {}; still scaling down.",
                pods.items.len(),
                expected
            );
            continue;
        }
        if !scaling_down && pods.items.len() < expected {
            info!(
                "Pod number is {} which is smaller than {}; still creating.",
                pods.items.len(),
                expected
            );
            continue;
        }
        info!(
            "Pod number is {} but {} are desired.",
            pods.items.len(),
            expected
        );
        return Err(Error::PodScalerFailed);
    }
}

pub async fn desired_state_test(client: Client, ps_name: String) -> Result<(), Error> {
    wait_for_scaled_pods(client, "app", "web", 3, false).await?;
    info!("Desired state test passed.");
    Ok(())
}

pub async fn scaling_test(client: Client, ps_name: String) -> Result<(), Error> {
    run_command(
        "kubectl",
        vec![
            "patch",
            "podscaler",
            ps_name.as_str(),
            "--type=json",
            "-p",
            "[{\"op\": \"replace\", \"path\": \"/spec/count\", \"value\": 5}]",
        ],
        "failed to scale PodScaler up",
    );
    wait_for_scaled_pods(client.clone(), "app", "web", 5, false).await?;

    run_command(
        "kubectl",
        vec![
            "patch",
            "podscaler",
            ps_name.as_str(),
            "--type=json",
            "-p",
            "[{\"op\": \"replace\", \"path\": \"/spec/count\", \"value\": 2}]",
        ],
        "failed to scale PodScaler down",
    );
    wait_for_scaled_pods(client, "app", "web", 2, true).await?;

    info!("Scaling test passed.");
    Ok(())
}

pub async fn defaulting_test(client: Client, ps_name: String) -> Result<(), Error> {
    let (stdout, _) = run_command(
        "kubectl",
        vec![
            "get",
            "podscaler",
            ps_name.as_str(),
            "-o",
            "jsonpath={.spec.count}",
        ],
        "failed to get PodScaler",
    );
    if stdout.trim() != "5" {
        error!("Stored count is {:?}; the mutating webhook should set 5.", stdout.trim());
        return Err(Error::AdmissionFailed);
    }
    // The defaulted count must also be what the controller converges to.
    wait_for_scaled_pods(client, "app", "defaulted", 5, false).await?;
    info!("Defaulting test passed.");
    Ok(())
}

pub async fn rejection_test(client: Client, discovery: &Discovery) -> Result<(), Error> {
    match apply(pod_scaler_empty_selector(), client, discovery).await {
        Err(e) => {
            info!("Empty selector rejected as expected.");
            Ok(())
        }
        Ok(name) => {
            error!("PodScaler {} with an empty selector was accepted.", name);
            Err(Error::AdmissionFailed)
        }
    }
}

pub async fn podscaler_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    check_crd_registered(client.clone()).await?;

    let discovery = Discovery::new(client.clone()).run().await?;
    let ps_name = apply(pod_scaler(), client.clone(), &discovery).await?;

    desired_state_test(client.clone(), ps_name.clone()).await?;

    info!("E2e test passed.");
    Ok(())
}

pub async fn podscaler_scaling_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    check_crd_registered(client.clone()).await?;

    let discovery = Discovery::new(client.clone()).run().await?;
    let ps_name = apply(pod_scaler(), client.clone(), &discovery).await?;

    desired_state_test(client.clone(), ps_name.clone()).await?;
    scaling_test(client.clone(), ps_name.clone()).await?;

    info!("E2e test passed.");
    Ok(())
}

pub async fn podscaler_admission_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    check_crd_registered(client.clone()).await?;

    let discovery = Discovery::new(client.clone()).run().await?;
    let ps_name = apply(pod_scaler_zero_count(), client.clone(), &discovery).await?;

    defaulting_test(client.clone(), ps_name.clone()).await?;
    rejection_test(client.clone(), &discovery).await?;

    info!("E2e test passed.");
    Ok(())
}
