//! Kubernetes objects backing a workload.

use crate::workload::{WorkloadSpec, LABEL_TESTBED_ID};
use serde_json::{json, Value};

/// Container name inside the pod.
pub const CONTAINER_NAME: &str = "testbed";

/// A `batch/v1` Job running the agent once, without retries.
pub fn job(spec: &WorkloadSpec, namespace: &str) -> Value {
    let labels = spec.labels();
    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": spec.image,
                        "command": spec.command,
                        "env": env,
                        "ports": [
                            { "name": "publish", "containerPort": spec.ports.publish },
                            { "name": "subscribe", "containerPort": spec.ports.subscribe },
                            { "name": "http", "containerPort": spec.ports.http },
                        ],
                    }],
                },
            },
        },
    })
}

/// A `v1` Service selecting the job's pod. `LoadBalancer` when clients sit
/// outside the cluster, `ClusterIP` otherwise.
pub fn service(spec: &WorkloadSpec, namespace: &str, in_cluster: bool) -> Value {
    let service_type = if in_cluster { "ClusterIP" } else { "LoadBalancer" };
    let labels = spec.labels();
    let selector = labels.get(LABEL_TESTBED_ID).cloned().unwrap_or_default();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": spec.name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "type": service_type,
            "selector": { LABEL_TESTBED_ID: selector },
            "ports": [
                { "name": "publish", "port": spec.ports.publish, "targetPort": spec.ports.publish },
                { "name": "subscribe", "port": spec.ports.subscribe, "targetPort": spec.ports.subscribe },
                { "name": "http", "port": spec.ports.http, "targetPort": spec.ports.http },
            ],
        },
    })
}

/// Delete options removing dependents before the owner.
pub fn foreground_delete() -> Value {
    json!({
        "kind": "DeleteOptions",
        "apiVersion": "v1",
        "propagationPolicy": "Foreground",
        "gracePeriodSeconds": 0,
    })
}
