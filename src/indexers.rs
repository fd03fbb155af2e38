use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};

use crate::config::ForceCheckKinds;
use crate::keychain::{parse_pull_secret, DockerConfig, SecretKeychain};
use crate::projection::{ControllerProjection, ProjectionKey};
use crate::store::ContainerUsage;

/// Builds the "namespace/name" key used across the secondary indexes.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Default)]
struct Inner {
    /// Current projection per controller identity.
    workloads: HashMap<ProjectionKey, ControllerProjection>,
    /// Image reference to the controllers whose containers use it.
    by_image: HashMap<String, BTreeSet<ProjectionKey>>,
    /// Namespaces carrying the configured label key. Unused when no label
    /// filter is configured.
    labeled_namespaces: HashSet<String>,
    /// "namespace/name" to the service account's own pull secret refs.
    service_accounts: HashMap<String, Vec<String>>,
    /// "namespace/name" to the parsed docker config of a pull secret.
    secrets: HashMap<String, DockerConfig>,
}

/// In-memory indexes over the watched cluster state, answering the two
/// queries the tracker needs: which containers use an image, and which
/// credentials apply to it.
pub struct ControllerIndexers {
    inner: RwLock<Inner>,
    namespace_label: Option<String>,
    force_check: ForceCheckKinds,
}

impl ControllerIndexers {
    pub fn new(namespace_label: Option<String>, force_check: ForceCheckKinds) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            namespace_label,
            force_check,
        }
    }

    /// Returns false when the stored projection is already identical (same
    /// resource version and content), letting callers skip the reconcile a
    /// periodic re-list would otherwise repeat.
    pub fn upsert_workload(&self, projection: ControllerProjection) -> bool {
        let key = projection.key();
        let mut inner = self.lock_write();

        if inner.workloads.get(&key) == Some(&projection) {
            return false;
        }

        if let Some(previous) = inner.workloads.remove(&key) {
            detach_images(&mut inner, &previous, &key);
        }
        for image in projection.images() {
            inner
                .by_image
                .entry(image.to_string())
                .or_default()
                .insert(key.clone());
        }
        inner.workloads.insert(key, projection);
        true
    }

    pub fn remove_workload(&self, key: &ProjectionKey) {
        let mut inner = self.lock_write();
        if let Some(previous) = inner.workloads.remove(key) {
            detach_images(&mut inner, &previous, key);
        }
    }

    pub fn upsert_namespace(&self, namespace: &Namespace) {
        let Some(label) = self.namespace_label.as_deref() else {
            return;
        };
        let Some(name) = namespace.metadata.name.clone() else {
            return;
        };

        let labeled = namespace
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(label));

        let mut inner = self.lock_write();
        if labeled {
            inner.labeled_namespaces.insert(name);
        } else {
            inner.labeled_namespaces.remove(&name);
        }
    }

    pub fn remove_namespace(&self, name: &str) {
        self.lock_write().labeled_namespaces.remove(name);
    }

    pub fn upsert_service_account(&self, service_account: &ServiceAccount) {
        let namespace = service_account.metadata.namespace.as_deref().unwrap_or_default();
        let Some(name) = service_account.metadata.name.as_deref() else {
            return;
        };

        let refs = service_account
            .image_pull_secrets
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|reference| reference.name.as_deref())
            .map(|secret| object_key(namespace, secret))
            .collect();

        self.lock_write()
            .service_accounts
            .insert(object_key(namespace, name), refs);
    }

    pub fn remove_service_account(&self, key: &str) {
        self.lock_write().service_accounts.remove(key);
    }

    pub fn upsert_secret(&self, secret: &Secret) {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let Some(name) = secret.metadata.name.as_deref() else {
            return;
        };
        let key = object_key(namespace, name);

        let mut inner = self.lock_write();
        match parse_pull_secret(secret) {
            Some(config) => {
                inner.secrets.insert(key, config);
            }
            None => {
                inner.secrets.remove(&key);
            }
        }
    }

    pub fn remove_secret(&self, key: &str) {
        self.lock_write().secrets.remove(key);
    }

    /// The effective container usages of `image`: containers of live,
    /// enabled (or force-checked) controllers in namespaces passing the
    /// optional label filter.
    pub fn container_infos_for_image(&self, image: &str) -> Vec<ContainerUsage> {
        let inner = self.lock_read();
        let Some(keys) = inner.by_image.get(image) else {
            return Vec::new();
        };

        let mut usages = Vec::new();
        for key in keys {
            let Some(projection) = inner.workloads.get(key) else {
                continue;
            };
            if !projection.enabled && !self.force_check.contains(projection.kind) {
                continue;
            }
            if !self.namespace_passes(&inner, &projection.namespace) {
                continue;
            }

            for (container, container_image) in &projection.containers {
                if container_image == image {
                    usages.push(ContainerUsage {
                        namespace: projection.namespace.clone(),
                        kind: projection.kind,
                        controller_name: projection.name.clone(),
                        container: container.clone(),
                    });
                }
            }
        }

        usages.sort();
        usages
    }

    /// Pull secret keys applying to `image`, across every controller that
    /// references it. Pod-level refs take precedence; only when a controller
    /// has none is its service account consulted, mirroring the admission
    /// rule kubelet applies.
    pub fn pull_secret_refs_for_image(&self, image: &str) -> BTreeSet<String> {
        let inner = self.lock_read();
        let Some(keys) = inner.by_image.get(image) else {
            return BTreeSet::new();
        };

        let mut refs = BTreeSet::new();
        for key in keys {
            let Some(projection) = inner.workloads.get(key) else {
                continue;
            };

            if !projection.pull_secret_refs.is_empty() {
                refs.extend(projection.pull_secret_refs.iter().cloned());
                continue;
            }

            let sa_key = object_key(&projection.namespace, &projection.service_account_name);
            if let Some(sa_refs) = inner.service_accounts.get(&sa_key) {
                refs.extend(sa_refs.iter().cloned());
            }
        }

        refs
    }

    /// Assembles the pull-secret keychain for `image`, dereferencing each
    /// harvested key through the secret index and skipping missing entries.
    /// `None` when no secret applies, leaving the anonymous fallback.
    pub fn keychain_for_image(&self, image: &str) -> Option<SecretKeychain> {
        let refs = self.pull_secret_refs_for_image(image);

        let inner = self.lock_read();
        let configs: Vec<DockerConfig> = refs
            .iter()
            .filter_map(|reference| inner.secrets.get(reference).cloned())
            .collect();

        if configs.is_empty() {
            None
        } else {
            Some(SecretKeychain::new(configs))
        }
    }

    fn namespace_passes(&self, inner: &Inner, namespace: &str) -> bool {
        match &self.namespace_label {
            Some(_) => inner.labeled_namespaces.contains(namespace),
            None => true,
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("indexer lock poisoned")
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("indexer lock poisoned")
    }
}

fn detach_images(inner: &mut Inner, previous: &ControllerProjection, key: &ProjectionKey) {
    for image in previous.images() {
        if let Some(keys) = inner.by_image.get_mut(image) {
            keys.remove(key);
            if keys.is_empty() {
                inner.by_image.remove(image);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ControllerKind;
    use k8s_openapi::api::core::v1::LocalObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn projection(
        kind: ControllerKind,
        namespace: &str,
        name: &str,
        image: &str,
        enabled: bool,
    ) -> ControllerProjection {
        ControllerProjection {
            uid: format!("{}-{}", namespace, name),
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            resource_version: "1".to_string(),
            containers: BTreeMap::from([("main".to_string(), image.to_string())]),
            pull_secret_refs: Vec::new(),
            service_account_name: "default".to_string(),
            enabled,
        }
    }

    fn service_account(namespace: &str, name: &str, secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            image_pull_secrets: Some(
                secrets
                    .iter()
                    .map(|secret| LocalObjectReference {
                        name: Some(secret.to_string()),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_infos_cover_all_kinds() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "shared:1",
            true,
        ));
        indexers.upsert_workload(projection(
            ControllerKind::StatefulSet,
            "db",
            "postgres",
            "shared:1",
            true,
        ));
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "other",
            "unrelated:1",
            true,
        ));

        let usages = indexers.container_infos_for_image("shared:1");
        assert_eq!(usages.len(), 2);
        assert!(usages.iter().any(|u| u.kind == ControllerKind::StatefulSet));
    }

    #[test]
    fn test_disabled_controllers_are_skipped_unless_forced() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "img:1",
            false,
        ));
        assert!(indexers.container_infos_for_image("img:1").is_empty());

        let forced = ControllerIndexers::new(
            None,
            ForceCheckKinds::parse("deployment,statefulset").unwrap(),
        );
        forced.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "img:1",
            false,
        ));
        assert_eq!(forced.container_infos_for_image("img:1").len(), 1);
    }

    #[test]
    fn test_namespace_label_filter() {
        let indexers =
            ControllerIndexers::new(Some("monitored".to_string()), ForceCheckKinds::default());
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "img:1",
            true,
        ));
        assert!(indexers.container_infos_for_image("img:1").is_empty());

        indexers.upsert_namespace(&Namespace {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                labels: Some(BTreeMap::from([(
                    "monitored".to_string(),
                    "yes".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(indexers.container_infos_for_image("img:1").len(), 1);

        // Dropping the label drops the namespace from scope again.
        indexers.upsert_namespace(&Namespace {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(indexers.container_infos_for_image("img:1").is_empty());
    }

    #[test]
    fn test_pod_level_refs_shadow_service_account_refs() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        indexers.upsert_service_account(&service_account("app", "default", &["sa-secret"]));

        let mut with_pod_refs =
            projection(ControllerKind::Deployment, "app", "web", "img:1", true);
        with_pod_refs.pull_secret_refs = vec!["app/pod-secret".to_string()];
        indexers.upsert_workload(with_pod_refs);

        let refs = indexers.pull_secret_refs_for_image("img:1");
        assert!(refs.contains("app/pod-secret"));
        assert!(!refs.contains("app/sa-secret"));
    }

    #[test]
    fn test_service_account_refs_used_when_pod_refs_absent() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        indexers.upsert_service_account(&service_account("app", "default", &["sa-secret"]));
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "img:1",
            true,
        ));

        let refs = indexers.pull_secret_refs_for_image("img:1");
        assert_eq!(refs.len(), 1);
        assert!(refs.contains("app/sa-secret"));

        // A missing service account simply contributes nothing.
        let bare = ControllerIndexers::new(None, ForceCheckKinds::default());
        bare.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "img:1",
            true,
        ));
        assert!(bare.pull_secret_refs_for_image("img:1").is_empty());
    }

    #[test]
    fn test_unchanged_upsert_is_reported_as_noop() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        let web = projection(ControllerKind::Deployment, "app", "web", "img:1", true);

        assert!(indexers.upsert_workload(web.clone()));
        assert!(!indexers.upsert_workload(web.clone()));

        let mut bumped = web;
        bumped.resource_version = "2".to_string();
        assert!(indexers.upsert_workload(bumped));
    }

    #[test]
    fn test_workload_update_detaches_old_images() {
        let indexers = ControllerIndexers::new(None, ForceCheckKinds::default());
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "old:1",
            true,
        ));
        indexers.upsert_workload(projection(
            ControllerKind::Deployment,
            "app",
            "web",
            "new:1",
            true,
        ));

        assert!(indexers.container_infos_for_image("old:1").is_empty());
        assert_eq!(indexers.container_infos_for_image("new:1").len(), 1);

        indexers.remove_workload(&ProjectionKey {
            kind: ControllerKind::Deployment,
            namespace: "app".to_string(),
            name: "web".to_string(),
        });
        assert!(indexers.container_infos_for_image("new:1").is_empty());
    }
}
