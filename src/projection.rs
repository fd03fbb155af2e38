use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use serde::de::DeserializeOwned;

/// The workload controller kinds whose images are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    CronJob,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::Deployment,
        ControllerKind::StatefulSet,
        ControllerKind::DaemonSet,
        ControllerKind::CronJob,
    ];

    /// Lowercase form used both in metric names and as the identifying
    /// label name on the per-kind gauge families.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ControllerKind::Deployment => "deployment",
            ControllerKind::StatefulSet => "statefulset",
            ControllerKind::DaemonSet => "daemonset",
            ControllerKind::CronJob => "cronjob",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::Deployment => "Deployment",
            ControllerKind::StatefulSet => "StatefulSet",
            ControllerKind::DaemonSet => "DaemonSet",
            ControllerKind::CronJob => "CronJob",
        };
        f.write_str(name)
    }
}

impl FromStr for ControllerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Ok(ControllerKind::Deployment),
            "statefulset" => Ok(ControllerKind::StatefulSet),
            "daemonset" => Ok(ControllerKind::DaemonSet),
            "cronjob" => Ok(ControllerKind::CronJob),
            _ => Err(()),
        }
    }
}

/// Identity of a projection within the indexes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionKey {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

/// Compact, deep-copied view of one workload controller: everything the
/// tracker needs after the raw orchestrator object is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerProjection {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub kind: ControllerKind,
    pub resource_version: String,
    /// Container name to image reference, one entry per container spec.
    pub containers: BTreeMap<String, String>,
    /// Pod-level pull secret references as "namespace/name" keys.
    pub pull_secret_refs: Vec<String>,
    pub service_account_name: String,
    /// Whether the controller is actually running workloads right now.
    pub enabled: bool,
}

impl ControllerProjection {
    pub fn key(&self) -> ProjectionKey {
        ProjectionKey {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Distinct images referenced by this controller's containers.
    pub fn images(&self) -> BTreeSet<&str> {
        self.containers.values().map(String::as_str).collect()
    }
}

/// The heterogeneous event payload flowing out of the watch streams. The
/// `Projected` variant lets an already-normalized record pass through the
/// projection untouched, so the same entry point serves both raw ingest and
/// re-normalization.
#[derive(Debug, Clone)]
pub enum WorkloadObject {
    Deployment(Box<Deployment>),
    StatefulSet(Box<StatefulSet>),
    DaemonSet(Box<DaemonSet>),
    CronJob(Box<CronJob>),
    Projected(Box<ControllerProjection>),
}

/// Normalizes a workload object into its projection. Returns `None` for
/// malformed objects missing their pod template.
pub fn project(object: &WorkloadObject) -> Option<ControllerProjection> {
    match object {
        WorkloadObject::Deployment(d) => {
            let spec = d.spec.as_ref()?;
            build(
                ControllerKind::Deployment,
                &d.metadata,
                spec.template.spec.as_ref()?,
                spec.replicas.unwrap_or(0) > 0,
            )
        }
        WorkloadObject::StatefulSet(s) => {
            let spec = s.spec.as_ref()?;
            build(
                ControllerKind::StatefulSet,
                &s.metadata,
                spec.template.spec.as_ref()?,
                spec.replicas.unwrap_or(0) > 0,
            )
        }
        WorkloadObject::DaemonSet(d) => {
            let spec = d.spec.as_ref()?;
            let scheduled = d
                .status
                .as_ref()
                .map(|status| status.current_number_scheduled)
                .unwrap_or(0);
            build(
                ControllerKind::DaemonSet,
                &d.metadata,
                spec.template.spec.as_ref()?,
                scheduled > 0,
            )
        }
        WorkloadObject::CronJob(c) => {
            let spec = c.spec.as_ref()?;
            let pod_spec = spec.job_template.spec.as_ref()?.template.spec.as_ref()?;
            build(
                ControllerKind::CronJob,
                &c.metadata,
                pod_spec,
                !spec.suspend.unwrap_or(false),
            )
        }
        WorkloadObject::Projected(projection) => Some((**projection).clone()),
    }
}

fn build(
    kind: ControllerKind,
    metadata: &ObjectMeta,
    pod_spec: &PodSpec,
    enabled: bool,
) -> Option<ControllerProjection> {
    let namespace = metadata.namespace.clone().unwrap_or_default();

    let containers = pod_spec
        .containers
        .iter()
        .filter_map(|container| {
            container
                .image
                .as_ref()
                .map(|image| (container.name.clone(), image.clone()))
        })
        .collect();

    let pull_secret_refs = pod_spec
        .image_pull_secrets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|reference| reference.name.as_deref())
        .map(|name| format!("{}/{}", namespace, name))
        .collect();

    Some(ControllerProjection {
        uid: metadata.uid.clone().unwrap_or_default(),
        name: metadata.name.clone().unwrap_or_default(),
        resource_version: metadata.resource_version.clone().unwrap_or_default(),
        kind,
        containers,
        pull_secret_refs,
        service_account_name: pod_spec
            .service_account_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "default".to_string()),
        enabled,
        namespace,
    })
}

/// Watched workload kinds. The blanket bounds are what `kube`'s watcher and
/// `Api::all` need; each impl only supplies the wrapping into
/// [`WorkloadObject`].
pub trait Workload:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: ControllerKind;

    fn into_workload(self) -> WorkloadObject;
}

impl Workload for Deployment {
    const KIND: ControllerKind = ControllerKind::Deployment;

    fn into_workload(self) -> WorkloadObject {
        WorkloadObject::Deployment(Box::new(self))
    }
}

impl Workload for StatefulSet {
    const KIND: ControllerKind = ControllerKind::StatefulSet;

    fn into_workload(self) -> WorkloadObject {
        WorkloadObject::StatefulSet(Box::new(self))
    }
}

impl Workload for DaemonSet {
    const KIND: ControllerKind = ControllerKind::DaemonSet;

    fn into_workload(self) -> WorkloadObject {
        WorkloadObject::DaemonSet(Box::new(self))
    }
}

impl Workload for CronJob {
    const KIND: ControllerKind = ControllerKind::CronJob;

    fn into_workload(self) -> WorkloadObject {
        WorkloadObject::CronJob(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::batch::v1::{CronJobSpec, JobSpec, JobTemplateSpec};
    use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodTemplateSpec};

    fn pod_spec(images: &[(&str, &str)]) -> PodSpec {
        PodSpec {
            containers: images
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn deployment(namespace: &str, name: &str, replicas: i32, images: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    spec: Some(pod_spec(images)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_projection() {
        let object = deployment("app", "web", 2, &[("main", "test_0")]).into_workload();
        let projection = project(&object).unwrap();

        assert_eq!(projection.kind, ControllerKind::Deployment);
        assert_eq!(projection.namespace, "app");
        assert_eq!(projection.name, "web");
        assert!(projection.enabled);
        assert_eq!(projection.containers["main"], "test_0");
        assert_eq!(projection.service_account_name, "default");
    }

    #[test]
    fn test_scaled_down_deployment_is_disabled() {
        let object = deployment("app", "web", 0, &[("main", "test_0")]).into_workload();
        assert!(!project(&object).unwrap().enabled);
    }

    #[test]
    fn test_projection_is_idempotent() {
        let object = deployment("app", "web", 1, &[("main", "test_0")]).into_workload();
        let projection = project(&object).unwrap();

        let again = project(&WorkloadObject::Projected(Box::new(projection.clone()))).unwrap();
        assert_eq!(again, projection);
    }

    #[test]
    fn test_pull_secret_refs_are_namespace_qualified() {
        let mut spec = pod_spec(&[("main", "private/app:1")]);
        spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: Some("regcred".to_string()),
        }]);
        spec.service_account_name = Some("builder".to_string());

        let mut object = deployment("app", "web", 1, &[]);
        object.spec.as_mut().unwrap().template.spec = Some(spec);

        let projection = project(&object.into_workload()).unwrap();
        assert_eq!(projection.pull_secret_refs, vec!["app/regcred".to_string()]);
        assert_eq!(projection.service_account_name, "builder");
    }

    #[test]
    fn test_suspended_cron_job_is_disabled() {
        let cron_job = CronJob {
            metadata: ObjectMeta {
                namespace: Some("jobs".to_string()),
                name: Some("backup".to_string()),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                suspend: Some(true),
                job_template: JobTemplateSpec {
                    spec: Some(JobSpec {
                        template: PodTemplateSpec {
                            spec: Some(pod_spec(&[("runner", "backup:v3")])),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
        .into_workload();

        let projection = project(&cron_job).unwrap();
        assert_eq!(projection.kind, ControllerKind::CronJob);
        assert!(!projection.enabled);
        assert_eq!(projection.containers["runner"], "backup:v3");
    }
}
