//! trustsync - root certificate distribution controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trustsync::artifact::ConfigMapWriter;
use trustsync::bundle::BundleWatcher;
use trustsync::bundle_source::{
    load_bundle_file, load_secret_bundle, run_file_bundle_source, run_secret_bundle_source,
};
use trustsync::controller::{Context, NamespaceController};
use trustsync::informer::Informer;
use trustsync::policy::{load_policy, run_policy_configmap_source, PolicyWatcher, SelectionPolicy};
use trustsync::queue::QueueConfig;
use trustsync::reserved::ReservedNamespaces;
use trustsync::retry::{retry_with_backoff, RetryConfig};
use trustsync::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use trustsync::{
    CA_ROOT_CERT_CONFIGMAP, CA_ROOT_CERT_KEY, DEFAULT_BUNDLE_FILE,
    DEFAULT_BUNDLE_POLL_INTERVAL_SECS, DEFAULT_BUNDLE_SECRET, DEFAULT_BUNDLE_SECRET_KEY,
    DEFAULT_POLICY_CONFIGMAP, DEFAULT_SYSTEM_NAMESPACE,
};

/// Where the trust bundle comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BundleSourceKind {
    /// PEM file on disk, polled
    File,
    /// Kubernetes Secret, watched
    Secret,
}

/// trustsync - keeps istio-ca-root-cert current in selected namespaces
#[derive(Parser, Debug)]
#[command(name = "trustsync", version, about, long_about = None)]
struct Cli {
    /// Namespace holding the policy ConfigMap and CA Secret
    #[arg(long, env = "TRUSTSYNC_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Name of the ConfigMap holding the namespace selection policy
    ///
    /// When the ConfigMap is absent every non-reserved namespace is selected.
    #[arg(long, env = "TRUSTSYNC_POLICY_CONFIGMAP", default_value = DEFAULT_POLICY_CONFIGMAP)]
    policy_configmap: String,

    /// Trust bundle source
    #[arg(long, env = "TRUSTSYNC_BUNDLE_SOURCE", value_enum, default_value = "file")]
    bundle_source: BundleSourceKind,

    /// Path of the root certificate file (file source)
    #[arg(long, env = "TRUSTSYNC_BUNDLE_FILE", default_value = DEFAULT_BUNDLE_FILE)]
    bundle_file: PathBuf,

    /// Poll interval for the root certificate file in seconds
    #[arg(long, env = "TRUSTSYNC_BUNDLE_POLL_INTERVAL_SECS", default_value_t = DEFAULT_BUNDLE_POLL_INTERVAL_SECS)]
    bundle_poll_interval_secs: u64,

    /// Name of the CA Secret (secret source)
    #[arg(long, env = "TRUSTSYNC_BUNDLE_SECRET", default_value = DEFAULT_BUNDLE_SECRET)]
    bundle_secret: String,

    /// Key in the CA Secret holding the root certificate
    #[arg(long, env = "TRUSTSYNC_BUNDLE_SECRET_KEY", default_value = DEFAULT_BUNDLE_SECRET_KEY)]
    bundle_secret_key: String,

    /// Concurrent reconcile workers
    #[arg(long, env = "TRUSTSYNC_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Namespaces to exclude in addition to the built-in system namespaces
    #[arg(long, env = "TRUSTSYNC_EXTRA_RESERVED_NAMESPACES", value_delimiter = ',')]
    extra_reserved_namespaces: Vec<String>,

    /// Attempts to read the initial trust bundle before giving up
    #[arg(long, env = "TRUSTSYNC_STARTUP_ATTEMPTS", default_value_t = 5)]
    startup_attempts: u32,

    /// Log output format
    #[arg(long, env = "TRUSTSYNC_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    if let Err(e) = run(cli).await {
        error!(error = ?e, "trustsync exited with error");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let fallback = SelectionPolicy::select_all();
    let initial_policy = load_policy(&client, &cli.namespace, &cli.policy_configmap, &fallback)
        .await
        .context("failed to load selection policy")?;
    let policy = Arc::new(PolicyWatcher::new(initial_policy));

    let startup_retry = RetryConfig::with_max_attempts(cli.startup_attempts);
    let initial_bundle = match cli.bundle_source {
        BundleSourceKind::File => {
            retry_with_backoff(&startup_retry, "load bundle file", || {
                load_bundle_file(&cli.bundle_file)
            })
            .await
        }
        BundleSourceKind::Secret => {
            retry_with_backoff(&startup_retry, "load bundle secret", || {
                load_secret_bundle(
                    &client,
                    &cli.namespace,
                    &cli.bundle_secret,
                    &cli.bundle_secret_key,
                )
            })
            .await
        }
    }
    .context("failed to load initial trust bundle")?;
    let bundle = Arc::new(BundleWatcher::new(initial_bundle));

    let namespaces = Informer::<Namespace>::new("namespaces");
    let artifacts = Informer::<ConfigMap>::new("artifacts");

    let writer = Arc::new(ConfigMapWriter::new(
        client.clone(),
        artifacts.store(),
        CA_ROOT_CERT_KEY,
    ));
    let ctx = Context::builder(namespaces.store(), artifacts.store(), bundle.clone(), writer)
        .reserved(ReservedNamespaces::with_extra(
            cli.extra_reserved_namespaces.clone(),
        ))
        .queue_config(QueueConfig {
            workers: cli.workers,
            ..Default::default()
        })
        .build();
    let controller = NamespaceController::new(ctx, &policy);

    let mut tasks = Vec::new();

    let ns_stream = watcher::watcher(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff();
    tasks.push(tokio::spawn({
        let controller = controller.clone();
        namespaces.run(
            ns_stream,
            move |event| controller.on_namespace_event(event),
            cancel.clone(),
        )
    }));

    let artifact_stream = watcher::watcher(
        Api::<ConfigMap>::all(client.clone()),
        watcher::Config::default().fields(&format!("metadata.name={}", CA_ROOT_CERT_CONFIGMAP)),
    )
    .default_backoff();
    tasks.push(tokio::spawn({
        let controller = controller.clone();
        artifacts.run(
            artifact_stream,
            move |event| controller.on_artifact_event(event),
            cancel.clone(),
        )
    }));

    tasks.push(tokio::spawn(run_policy_configmap_source(
        client.clone(),
        cli.namespace.clone(),
        cli.policy_configmap.clone(),
        fallback,
        policy.clone(),
        cancel.clone(),
    )));

    match cli.bundle_source {
        BundleSourceKind::File => tasks.push(tokio::spawn(run_file_bundle_source(
            cli.bundle_file.clone(),
            Duration::from_secs(cli.bundle_poll_interval_secs.max(1)),
            bundle.clone(),
            cancel.clone(),
        ))),
        BundleSourceKind::Secret => tasks.push(tokio::spawn(run_secret_bundle_source(
            client.clone(),
            cli.namespace.clone(),
            cli.bundle_secret.clone(),
            cli.bundle_secret_key.clone(),
            bundle.clone(),
            cancel.clone(),
        ))),
    }

    info!(
        namespace = %cli.namespace,
        policy = %cli.policy_configmap,
        source = ?cli.bundle_source,
        workers = cli.workers,
        "trustsync started"
    );

    let result = controller.run(cancel.clone()).await;

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    result.context("namespace controller failed")?;
    info!("trustsync stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
