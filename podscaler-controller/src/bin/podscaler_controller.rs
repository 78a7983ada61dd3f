use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::controller::Controller,
    Client, CustomResourceExt,
};
use std::{env, sync::Arc};
use tracing::*;

use podscaler_controller::podscaler_types::PodScaler;
use podscaler_controller::reconciler::{error_policy, reconcile, Data};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&PodScaler::crd())?);
    } else if cmd == String::from("run") {
        info!("running podscaler-controller");
        let client = Client::try_default().await?;
        let scalers = Api::<PodScaler>::all(client.clone());
        let pods = Api::<Pod>::all(client.clone());

        // Watch owned pods too, so a pod deleted out from under us triggers
        // a reconcile instead of waiting for the periodic requeue.
        Controller::new(scalers, ListParams::default())
            .owns(pods, ListParams::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(Data::new(client)))
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
