use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count substituted at admission time when the user supplies one below 1,
/// and the reconciler's fallback for the same condition. Both paths must
/// read this constant so they cannot drift apart.
pub const DEFAULT_COUNT: i32 = 5;

/// Interval between periodic re-checks of a PodScaler. Periodic requeueing
/// keeps the controller converging even if a watch event is missed.
pub const DEFAULT_REQUEUE_SECONDS: u64 = 15;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "scaling.example.com", version = "v1", kind = "PodScaler")]
#[kube(shortname = "ps", namespaced)]
#[kube(status = "PodScalerStatus")]
pub struct PodScalerSpec {
    /// Number of pods to keep running. An omitted count deserializes to 0
    /// and is raised to DEFAULT_COUNT by the mutating webhook.
    #[serde(default)]
    pub count: i32,
    /// Pods carrying all of these labels count toward the target; created
    /// pods are labeled with exactly this set.
    pub selector: BTreeMap<String, String>,
}

/// No observed state is reported yet.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PodScalerStatus {}

/// The target count for a spec, with the fallback for a non-positive value.
/// Admission defaulting makes the fallback unreachable in practice.
pub fn effective_count(spec: &PodScalerSpec) -> i32 {
    if spec.count < 1 {
        DEFAULT_COUNT
    } else {
        spec.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(count: i32) -> PodScalerSpec {
        PodScalerSpec {
            count,
            selector: BTreeMap::from([("app".to_string(), "x".to_string())]),
        }
    }

    #[test]
    fn effective_count_falls_back_for_non_positive_values() {
        assert_eq!(effective_count(&spec(0)), DEFAULT_COUNT);
        assert_eq!(effective_count(&spec(-3)), DEFAULT_COUNT);
    }

    #[test]
    fn effective_count_keeps_valid_values() {
        assert_eq!(effective_count(&spec(1)), 1);
        assert_eq!(effective_count(&spec(7)), 7);
    }

    #[test]
    fn omitted_count_deserializes_to_zero() {
        let spec: PodScalerSpec =
            serde_json::from_value(serde_json::json!({ "selector": { "app": "x" } })).unwrap();
        assert_eq!(spec.count, 0);
    }
}
