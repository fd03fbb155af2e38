use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::Parser;
use kube::Client;
use prometheus::Registry;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod checker;
mod config;
mod image_reference;
mod indexers;
mod keychain;
mod logging;
mod metrics;
mod oci_registry;
mod projection;
mod providers;
mod secret_string;
mod store;
mod watchers;
mod webserver;

use checker::{Checker, CHECK_BATCH_SIZE, FAILED_CHECK_BATCH_SIZE};
use config::Config;
use indexers::ControllerIndexers;
use metrics::ExporterMetrics;
use store::ImageStore;
use watchers::{Readiness, WatcherContext, WATCHER_COUNT};
use webserver::{AppState, Health};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let registry = Registry::new();
    let exporter_metrics =
        ExporterMetrics::register(&registry).context("Failed to register metrics")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logging::LogCounterLayer::new(
            exporter_metrics.log_statements.clone(),
        ))
        .init();

    info!(
        "Starting k8s-image-availability-exporter {}",
        env!("CARGO_PKG_VERSION")
    );

    let image_filter = config.image_filter()?;
    let bind_addr = config.bind_addr()?;
    let http_client = oci_registry::create_http_client(
        &config.ca_paths,
        config.skip_registry_cert_verification,
    )?;
    let registry_client = oci_registry::RegistryClient::new(http_client, config.allow_plain_http);

    let kube_client = create_client().await?;

    let indexers = Arc::new(ControllerIndexers::new(
        config.namespace_label.clone(),
        config.force_check_disabled_controllers.clone(),
    ));
    let store = Arc::new(ImageStore::new(CHECK_BATCH_SIZE, FAILED_CHECK_BATCH_SIZE));
    let checker = Arc::new(Checker::new(
        indexers.clone(),
        registry_client,
        providers::default_providers(),
        image_filter,
        config.mirror_map(),
        config.default_registry.clone(),
    ));

    let token = CancellationToken::new();
    let readiness = Readiness::new(WATCHER_COUNT);
    let ctx = WatcherContext {
        indexers: indexers.clone(),
        store: store.clone(),
        checker: checker.clone(),
        readiness: readiness.clone(),
        token: token.clone(),
    };

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    watchers::spawn_watchers(&mut tasks, &kube_client, &ctx);

    let health = Health::default();
    let app = webserver::create_app(AppState {
        registry: registry.clone(),
        store: store.clone(),
        health: health.clone(),
    });
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Serving /metrics and /healthz on {}", bind_addr);
    {
        let token = token.clone();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .map_err(anyhow::Error::from)
        });
    }

    {
        let store = store.clone();
        let indexers = indexers.clone();
        let token = token.clone();
        tasks.spawn(async move {
            store
                .run_gc(move |image| indexers.container_infos_for_image(image), token)
                .await;
            Ok(())
        });
    }

    info!("Waiting for cache sync");
    tokio::select! {
        _ = readiness.synced() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal during cache sync");
            token.cancel();
            while tasks.join_next().await.is_some() {}
            return Ok(());
        }
    }
    info!("Caches populated successfully");
    health.set(true);

    let result = run_tick_loop(&config, &store, &checker, &exporter_metrics, &mut tasks).await;

    health.set(false);
    token.cancel();
    while tasks.join_next().await.is_some() {}
    result
}

async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default()
        .await
        .context("Couldn't get Kubernetes client configuration")?;
    let version = client
        .apiserver_version()
        .await
        .context("Failed to query Kubernetes API server version")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        version.major, version.minor
    );
    Ok(client)
}

/// Drives the store on the configured interval until a shutdown signal
/// arrives or a background task dies. The in-progress tick always finishes
/// before the loop exits.
async fn run_tick_loop(
    config: &Config,
    store: &ImageStore,
    checker: &Arc<Checker>,
    exporter_metrics: &ExporterMetrics,
    tasks: &mut JoinSet<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(config.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            joined = tasks.join_next() => {
                match joined {
                    Some(Ok(Ok(()))) => bail!("a background task exited unexpectedly"),
                    Some(Ok(Err(err))) => return Err(err.context("background task failed")),
                    Some(Err(err)) => return Err(anyhow::Error::from(err).context("background task panicked")),
                    None => bail!("all background tasks exited"),
                }
            }
            _ = interval.tick() => {
                store.tick(checker.as_ref()).await;
                exporter_metrics.completed_rechecks.inc();
            }
        }
    }
}
