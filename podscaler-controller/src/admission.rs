use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject, ResourceExt,
};
use std::convert::Infallible;
use thiserror::Error;
use tracing::*;
use warp::{reply, Reply};

use crate::podscaler_types::{PodScaler, DEFAULT_COUNT};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid PodScaler spec: {0}")]
    InvalidSpec(&'static str),
    #[error("expected a PodScaler object but got kind {0}")]
    TypeMismatch(String),
    #[error("failed to decode PodScaler: {0}")]
    DecodeFailed(#[source] serde_json::Error),
}

/// Raises a non-positive count to DEFAULT_COUNT. The selector is never
/// defaulted. Applied on create and update, before validation.
pub fn default_pod_scaler(ps: &mut PodScaler) {
    if ps.spec.count < 1 {
        ps.spec.count = DEFAULT_COUNT;
    }
}

/// Rejects specs that defaulting did not (or could not) repair. Runs after
/// defaulting in the admission chain, so a failure here means the client
/// bypassed defaulting or sent something defaulting leaves alone.
pub fn validate_pod_scaler(ps: &PodScaler) -> Result<(), AdmissionError> {
    if ps.spec.count < 1 {
        return Err(AdmissionError::InvalidSpec("count must be greater than 0"));
    }
    if ps.spec.selector.is_empty() {
        return Err(AdmissionError::InvalidSpec("selector must be specified"));
    }
    Ok(())
}

fn parse_pod_scaler(obj: &DynamicObject) -> Result<PodScaler, AdmissionError> {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_else(|| "unknown".to_string());
    if kind != "PodScaler" {
        return Err(AdmissionError::TypeMismatch(kind));
    }
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(AdmissionError::DecodeFailed)
}

/// The JSON patch that applies defaulting to an incoming object. Diffed
/// against the raw object rather than a typed round-trip of it, so the
/// patch adds the field when the client omitted it.
fn defaulting_patch(obj: &DynamicObject) -> Result<json_patch::Patch, AdmissionError> {
    let ps = parse_pod_scaler(obj)?;
    let mut defaulted = ps.clone();
    default_pod_scaler(&mut defaulted);
    if defaulted.spec.count != ps.spec.count {
        info!(
            "Defaulting PodScaler {}: count {} -> {}",
            obj.name_any(),
            ps.spec.count,
            defaulted.spec.count
        );
    }

    let orig = serde_json::to_value(obj).map_err(AdmissionError::DecodeFailed)?;
    let mut mutated = orig.clone();
    mutated["spec"]["count"] = serde_json::Value::from(defaulted.spec.count);
    Ok(json_patch::diff(&orig, &mutated))
}

/// Mutating admission: answer with a JSON patch that applies defaulting to
/// the incoming object. Requests without an object (deletes) pass through.
pub fn mutate(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    let obj = match &req.object {
        Some(obj) => obj,
        None => return res,
    };

    match defaulting_patch(obj) {
        Ok(patch) => match res.with_patch(patch) {
            Ok(res) => res,
            Err(err) => AdmissionResponse::invalid(err.to_string()),
        },
        Err(err) => {
            warn!("denied: {:?} on {} ({})", req.operation, obj.name_any(), err);
            res.deny(err.to_string())
        }
    }
}

/// Validating admission: deny invalid specs on create and update. Delete
/// requests carry no object and are always allowed.
pub fn validate(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    if let Some(obj) = &req.object {
        let name = obj.name_any();
        match parse_pod_scaler(obj).and_then(|ps| validate_pod_scaler(&ps)) {
            Ok(()) => {
                info!("accepted: {:?} on resource {}", req.operation, name);
                res
            }
            Err(err) => {
                warn!("denied: {:?} on {} ({})", req.operation, name, err);
                res.deny(err.to_string())
            }
        }
    } else {
        res
    }
}

pub async fn mutate_handler(
    body: AdmissionReview<DynamicObject>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(
                &AdmissionResponse::invalid(err.to_string()).into_review(),
            ));
        }
    };
    Ok(reply::json(&mutate(&req).into_review()))
}

pub async fn validate_handler(
    body: AdmissionReview<DynamicObject>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(
                &AdmissionResponse::invalid(err.to_string()).into_review(),
            ));
        }
    };
    Ok(reply::json(&validate(&req).into_review()))
}
