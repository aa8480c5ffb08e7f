//! Translation between typed cluster specs and Kubernetes JSON manifests.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use super::error::{ClusterError, ClusterResult};
use super::{
    ContainerSpec, ContainerStatus, CronJobSpec, JobSpec, NamedPort, PodStatus,
    ResourceRequirements, ServiceSpec, StatefulSetInfo, StatefulSetSpec, VolumeMount,
};

fn metadata(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": labels,
    })
}

fn resources(res: &ResourceRequirements) -> Value {
    json!({
        "requests": { "cpu": res.cpu_request, "memory": res.memory_request },
        "limits": { "cpu": res.cpu_limit, "memory": res.memory_limit },
    })
}

fn container(spec: &ContainerSpec) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), json!(spec.name));
    obj.insert("image".into(), json!(spec.image));
    if !spec.command.is_empty() {
        obj.insert("command".into(), json!(spec.command));
    }
    if !spec.env.is_empty() {
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        obj.insert("env".into(), Value::Array(env));
    }
    if !spec.ports.is_empty() {
        let ports: Vec<Value> = spec
            .ports
            .iter()
            .map(|p| json!({ "name": p.name, "containerPort": p.port, "protocol": "TCP" }))
            .collect();
        obj.insert("ports".into(), Value::Array(ports));
    }
    obj.insert("resources".into(), resources(&spec.resources));
    if !spec.volume_mounts.is_empty() {
        let mounts: Vec<Value> = spec
            .volume_mounts
            .iter()
            .map(|m| json!({ "name": m.name, "mountPath": m.mount_path }))
            .collect();
        obj.insert("volumeMounts".into(), Value::Array(mounts));
    }
    Value::Object(obj)
}

pub fn service(spec: &ServiceSpec, namespace: &str) -> Value {
    let ports: Vec<Value> = spec
        .ports
        .iter()
        .map(|p| json!({ "name": p.name, "port": p.port, "protocol": "TCP" }))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(&spec.name, namespace, &spec.labels),
        "spec": {
            "clusterIP": "None",
            "selector": spec.selector,
            "ports": ports,
        },
    })
}

pub fn stateful_set(spec: &StatefulSetSpec, namespace: &str) -> Value {
    let containers: Vec<Value> = spec.containers.iter().map(container).collect();
    let mut sts_spec = json!({
        "serviceName": spec.service_name,
        "replicas": 1,
        "selector": { "matchLabels": spec.labels },
        "template": {
            "metadata": { "labels": spec.labels },
            "spec": { "containers": containers },
        },
    });

    if let Some(claim) = &spec.volume_claim {
        let mut claim_spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": claim.storage } },
        });
        if let Some(class) = &claim.storage_class {
            claim_spec["storageClassName"] = json!(class);
        }
        sts_spec["volumeClaimTemplates"] = json!([{
            "metadata": { "name": claim.name },
            "spec": claim_spec,
        }]);
        // Retain claims when the stateful set is deleted or scaled down.
        sts_spec["persistentVolumeClaimRetentionPolicy"] = json!({
            "whenDeleted": "Retain",
            "whenScaled": "Retain",
        });
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": metadata(&spec.name, namespace, &spec.labels),
        "spec": sts_spec,
    })
}

fn job_spec(spec: &JobSpec) -> Value {
    let containers: Vec<Value> = spec.containers.iter().map(container).collect();
    json!({
        "backoffLimit": spec.backoff_limit,
        "ttlSecondsAfterFinished": spec.ttl_seconds_after_finished,
        "template": {
            "metadata": { "labels": spec.labels },
            "spec": {
                "restartPolicy": "Never",
                "containers": containers,
            },
        },
    })
}

pub fn job(spec: &JobSpec, namespace: &str) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata(&spec.name, namespace, &spec.labels),
        "spec": job_spec(spec),
    })
}

pub fn cron_job(spec: &CronJobSpec, namespace: &str) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": metadata(&spec.name, namespace, &spec.labels),
        "spec": {
            "schedule": spec.schedule,
            "concurrencyPolicy": spec.concurrency_policy,
            "jobTemplate": { "spec": job_spec(&spec.job) },
        },
    })
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn labels_at(value: &Value, pointer: &str) -> BTreeMap<String, String> {
    value
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_resources(value: Option<&Value>) -> ResourceRequirements {
    let get = |section: &str, key: &str| {
        value
            .and_then(|v| v.get(section))
            .and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ResourceRequirements {
        cpu_request: get("requests", "cpu"),
        cpu_limit: get("limits", "cpu"),
        memory_request: get("requests", "memory"),
        memory_limit: get("limits", "memory"),
    }
}

fn parse_container(value: &Value) -> ContainerSpec {
    let env = value
        .get("env")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| {
                    let name = e.get("name")?.as_str()?;
                    let val = e.get("value").and_then(Value::as_str).unwrap_or_default();
                    Some((name.to_string(), val.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    let command = value
        .get("command")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let ports = value
        .get("ports")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|p| {
                    let port = p.get("containerPort")?.as_u64()?;
                    let name = p.get("name").and_then(Value::as_str).unwrap_or_default();
                    Some(NamedPort::new(name, u16::try_from(port).ok()?))
                })
                .collect()
        })
        .unwrap_or_default();
    let volume_mounts = value
        .get("volumeMounts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| {
                    Some(VolumeMount {
                        name: m.get("name")?.as_str()?.to_string(),
                        mount_path: m.get("mountPath")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerSpec {
        name: str_at(value, "/name").unwrap_or_default().to_string(),
        image: str_at(value, "/image").unwrap_or_default().to_string(),
        command,
        env,
        ports,
        resources: parse_resources(value.get("resources")),
        volume_mounts,
    }
}

pub fn parse_stateful_set(value: &Value) -> ClusterResult<StatefulSetInfo> {
    let name = str_at(value, "/metadata/name")
        .ok_or_else(|| ClusterError::ParseError("stateful set without metadata.name".into()))?;

    let images = value
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(parse_container)
                .map(|c| (c.name, c.image))
                .collect()
        })
        .unwrap_or_default();

    let int_at = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0)
    };

    Ok(StatefulSetInfo {
        name: name.to_string(),
        labels: labels_at(value, "/metadata/labels"),
        replicas: int_at("/spec/replicas"),
        ready_replicas: int_at("/status/readyReplicas"),
        images,
    })
}

pub fn parse_stateful_set_list(value: &Value) -> ClusterResult<Vec<StatefulSetInfo>> {
    let items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ClusterError::ParseError("list without items".into()))?;
    items.iter().map(parse_stateful_set).collect()
}

pub fn parse_pod(value: &Value) -> ClusterResult<PodStatus> {
    let name = str_at(value, "/metadata/name")
        .ok_or_else(|| ClusterError::ParseError("pod without metadata.name".into()))?;

    let spec_containers: Vec<ContainerSpec> = value
        .pointer("/spec/containers")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_container).collect())
        .unwrap_or_default();

    let statuses = value
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let containers = spec_containers
        .into_iter()
        .map(|c| {
            let status = statuses
                .iter()
                .find(|s| s.get("name").and_then(Value::as_str) == Some(c.name.as_str()));
            ContainerStatus {
                restart_count: status
                    .and_then(|s| s.get("restartCount"))
                    .and_then(Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(0),
                waiting_reason: status
                    .and_then(|s| s.pointer("/state/waiting/reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                name: c.name,
                image: c.image,
                resources: c.resources,
            }
        })
        .collect();

    Ok(PodStatus {
        name: name.to_string(),
        phase: str_at(value, "/status/phase")
            .unwrap_or("Unknown")
            .to_string(),
        pod_ip: str_at(value, "/status/podIP")
            .filter(|ip| !ip.is_empty())
            .map(str::to_string),
        terminating: value.pointer("/metadata/deletionTimestamp").is_some(),
        containers,
    })
}

fn parse_job_spec(name: &str, value: &Value) -> JobSpec {
    let int_at = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0)
    };
    JobSpec {
        name: name.to_string(),
        labels: labels_at(value, "/template/metadata/labels"),
        containers: value
            .pointer("/template/spec/containers")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_container).collect())
            .unwrap_or_default(),
        backoff_limit: int_at("/backoffLimit"),
        ttl_seconds_after_finished: int_at("/ttlSecondsAfterFinished"),
    }
}

pub fn parse_cron_job(value: &Value) -> ClusterResult<CronJobSpec> {
    let name = str_at(value, "/metadata/name")
        .ok_or_else(|| ClusterError::ParseError("cron job without metadata.name".into()))?;
    let job = value
        .pointer("/spec/jobTemplate/spec")
        .map(|spec| parse_job_spec(name, spec))
        .unwrap_or_default();

    Ok(CronJobSpec {
        name: name.to_string(),
        labels: labels_at(value, "/metadata/labels"),
        schedule: str_at(value, "/spec/schedule").unwrap_or_default().to_string(),
        concurrency_policy: str_at(value, "/spec/concurrencyPolicy")
            .unwrap_or("Allow")
            .to_string(),
        job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::VolumeClaim;

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "sandbox".to_string()),
            ("user-id".to_string(), "7".to_string()),
        ])
    }

    #[test]
    fn stateful_set_manifest_has_single_replica_and_claim_template() {
        let spec = StatefulSetSpec {
            name: "sandbox-7-42".to_string(),
            labels: labels(),
            service_name: "sandbox-7-42".to_string(),
            containers: vec![ContainerSpec {
                name: "agent".to_string(),
                image: "registry/agent:1".to_string(),
                env: BTreeMap::from([("USER_ID".to_string(), "7".to_string())]),
                ..Default::default()
            }],
            volume_claim: Some(VolumeClaim {
                name: "workspace".to_string(),
                storage: "10Gi".to_string(),
                storage_class: None,
            }),
        };

        let manifest = stateful_set(&spec, "agents");
        assert_eq!(manifest["spec"]["replicas"], 1);
        assert_eq!(manifest["metadata"]["namespace"], "agents");
        assert_eq!(
            manifest["spec"]["volumeClaimTemplates"][0]["metadata"]["name"],
            "workspace"
        );
        assert_eq!(
            manifest["spec"]["persistentVolumeClaimRetentionPolicy"]["whenDeleted"],
            "Retain"
        );
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["env"][0]["name"],
            "USER_ID"
        );
    }

    #[test]
    fn parses_pod_with_waiting_container() {
        let pod = json!({
            "metadata": { "name": "sandbox-7-42-0", "deletionTimestamp": "2026-01-01T00:00:00Z" },
            "spec": { "containers": [{
                "name": "agent",
                "image": "registry/agent:1",
                "resources": { "requests": { "cpu": "2", "memory": "4Gi" },
                               "limits": { "cpu": "2", "memory": "4Gi" } }
            }]},
            "status": {
                "phase": "Pending",
                "podIP": "",
                "containerStatuses": [{
                    "name": "agent",
                    "restartCount": 3,
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        });

        let parsed = parse_pod(&pod).unwrap();
        assert_eq!(parsed.phase, "Pending");
        assert!(parsed.pod_ip.is_none());
        assert!(parsed.terminating);
        assert_eq!(parsed.containers[0].restart_count, 3);
        assert_eq!(
            parsed.containers[0].waiting_reason.as_deref(),
            Some("CrashLoopBackOff")
        );
        assert_eq!(parsed.containers[0].resources.memory_limit, "4Gi");
    }

    #[test]
    fn cron_job_manifest_parses_back() {
        let spec = CronJobSpec {
            name: "maintenance".to_string(),
            labels: BTreeMap::from([("app".to_string(), "maintenance".to_string())]),
            schedule: "*/10 * * * *".to_string(),
            concurrency_policy: "Forbid".to_string(),
            job: JobSpec {
                name: "maintenance".to_string(),
                labels: BTreeMap::from([("app".to_string(), "maintenance".to_string())]),
                containers: vec![ContainerSpec {
                    name: "maintenance".to_string(),
                    image: "registry/sandboxd:1".to_string(),
                    command: vec!["/app/sandboxd".to_string()],
                    ..Default::default()
                }],
                backoff_limit: 3,
                ttl_seconds_after_finished: 300,
            },
        };

        let parsed = parse_cron_job(&cron_job(&spec, "agents")).unwrap();
        assert_eq!(parsed.schedule, "*/10 * * * *");
        assert_eq!(parsed.concurrency_policy, "Forbid");
        assert_eq!(parsed.job.backoff_limit, 3);
        assert_eq!(parsed.job.containers[0].image, "registry/sandboxd:1");
    }
}
