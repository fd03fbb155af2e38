use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::checker::Checker;
use crate::indexers::{object_key, ControllerIndexers};
use crate::projection::{project, Workload};
use crate::store::ImageStore;

/// Number of watch streams the exporter runs: the four workload kinds plus
/// namespaces, service accounts and secrets.
pub const WATCHER_COUNT: usize = 7;

/// Tracks how many watch streams still owe their initial listing. The
/// readiness endpoint waits on this before reporting healthy.
pub struct Readiness {
    pending: AtomicUsize,
    notify: Notify,
}

impl Readiness {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(count),
            notify: Notify::new(),
        })
    }

    fn mark_ready(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Resolves once every watcher has completed its initial sync.
    pub async fn synced(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Shared dependencies of every watch pump.
#[derive(Clone)]
pub struct WatcherContext {
    pub indexers: Arc<ControllerIndexers>,
    pub store: Arc<ImageStore>,
    pub checker: Arc<Checker>,
    pub readiness: Arc<Readiness>,
    pub token: CancellationToken,
}

/// Drives one watch stream until cancellation, dispatching events to
/// `handle`. The initial-sync marker is intercepted here so every pump
/// reports readiness the same way; stream errors are logged and the watcher
/// resumes on the next event.
async fn pump<K, F>(
    api: Api<K>,
    ctx: &WatcherContext,
    resource: &'static str,
    mut handle: F,
) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    F: FnMut(watcher::Event<K>),
{
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    let mut synced = false;

    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => break,
            event = stream.try_next() => match event {
                Ok(Some(watcher::Event::InitDone)) => {
                    if !synced {
                        synced = true;
                        ctx.readiness.mark_ready();
                    }
                }
                Ok(Some(event)) => handle(event),
                Ok(None) => break,
                Err(err) => {
                    error!(resource, error = %err, "Watcher stream error");
                }
            }
        }
    }

    Ok(())
}

/// Watch pump for one workload kind: events are projected, indexed, and the
/// projection's images reconciled into the store.
pub async fn run_workload_watcher<K: Workload>(client: Client, ctx: WatcherContext) -> Result<()> {
    let api: Api<K> = Api::all(client);
    pump(api, &ctx, K::KIND.metric_label(), |event| match event {
        watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
            if let Some(projection) = project(&object.into_workload()) {
                if ctx.indexers.upsert_workload(projection.clone()) {
                    ctx.checker.reconcile_workload(&ctx.store, &projection);
                }
            }
        }
        watcher::Event::Delete(object) => {
            // The projection is detached before reconciling, so re-derived
            // usage sets no longer contain this controller.
            if let Some(projection) = project(&object.into_workload()) {
                ctx.indexers.remove_workload(&projection.key());
                ctx.checker.reconcile_workload(&ctx.store, &projection);
            }
        }
        _ => {}
    })
    .await
}

pub async fn run_namespace_watcher(client: Client, ctx: WatcherContext) -> Result<()> {
    let api: Api<Namespace> = Api::all(client);
    pump(api, &ctx, "namespace", |event| match event {
        watcher::Event::Apply(namespace) | watcher::Event::InitApply(namespace) => {
            ctx.indexers.upsert_namespace(&namespace);
        }
        watcher::Event::Delete(namespace) => {
            if let Some(name) = namespace.metadata.name.as_deref() {
                ctx.indexers.remove_namespace(name);
            }
        }
        _ => {}
    })
    .await
}

pub async fn run_service_account_watcher(client: Client, ctx: WatcherContext) -> Result<()> {
    let api: Api<ServiceAccount> = Api::all(client);
    pump(api, &ctx, "serviceaccount", |event| match event {
        watcher::Event::Apply(account) | watcher::Event::InitApply(account) => {
            ctx.indexers.upsert_service_account(&account);
        }
        watcher::Event::Delete(account) => {
            if let Some(name) = account.metadata.name.as_deref() {
                let namespace = account.metadata.namespace.as_deref().unwrap_or_default();
                ctx.indexers.remove_service_account(&object_key(namespace, name));
            }
        }
        _ => {}
    })
    .await
}

pub async fn run_secret_watcher(client: Client, ctx: WatcherContext) -> Result<()> {
    let api: Api<Secret> = Api::all(client);
    pump(api, &ctx, "secret", |event| match event {
        watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
            ctx.indexers.upsert_secret(&secret);
        }
        watcher::Event::Delete(secret) => {
            if let Some(name) = secret.metadata.name.as_deref() {
                let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
                ctx.indexers.remove_secret(&object_key(namespace, name));
            }
        }
        _ => {}
    })
    .await
}

/// Spawns every watch stream onto `set`.
pub fn spawn_watchers(set: &mut JoinSet<Result<()>>, client: &Client, ctx: &WatcherContext) {
    set.spawn(run_workload_watcher::<Deployment>(client.clone(), ctx.clone()));
    set.spawn(run_workload_watcher::<StatefulSet>(client.clone(), ctx.clone()));
    set.spawn(run_workload_watcher::<DaemonSet>(client.clone(), ctx.clone()));
    set.spawn(run_workload_watcher::<CronJob>(client.clone(), ctx.clone()));
    set.spawn(run_namespace_watcher(client.clone(), ctx.clone()));
    set.spawn(run_service_account_watcher(client.clone(), ctx.clone()));
    set.spawn(run_secret_watcher(client.clone(), ctx.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_readiness_resolves_after_all_watchers_sync() {
        let readiness = Readiness::new(2);

        readiness.mark_ready();
        let pending = tokio::time::timeout(Duration::from_millis(20), readiness.synced()).await;
        assert!(pending.is_err());

        readiness.mark_ready();
        tokio::time::timeout(Duration::from_secs(1), readiness.synced())
            .await
            .expect("readiness should resolve once all watchers synced");
    }

    #[tokio::test]
    async fn test_readiness_is_immediate_when_zero_pending() {
        let readiness = Readiness::new(0);
        tokio::time::timeout(Duration::from_secs(1), readiness.synced())
            .await
            .expect("zero pending watchers means immediately synced");
    }
}
