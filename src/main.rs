//! NSX Operator - SecurityPolicy synchronization with the NSX backend

use std::fmt::Debug;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::{FutureExt, StreamExt};
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nsx_operator::backend::client::NsxClient;
use nsx_operator::backend::{PolicyBackend, SecurityPolicyService};
use nsx_operator::config::{OperatorConfig, PolicySchema};
use nsx_operator::controller::{
    error_policy, reconcile, reconcile_vanished, schema_label, Context, KubeNamespaceClassifier,
    KubePolicyApi, PolicyApi, FIELD_MANAGER,
};
use nsx_operator::crd::{LegacySecurityPolicy, ResourceKey, SecurityPolicy};
use nsx_operator::gc::GarbageCollector;
use nsx_operator::restore::{restore_all, Restorable, SecurityPolicyRestorer};

/// NSX Operator - keeps SecurityPolicy resources in sync with NSX
#[derive(Parser, Debug)]
#[command(name = "nsx-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches SecurityPolicy resources of the configured schema, reconciles
    /// them against the backend and collects orphaned backend objects on a
    /// fixed interval.
    Controller,

    /// Run one garbage collection and restore pass, then exit
    ///
    /// Use after the backend was restored from a backup.
    Restore,
}

/// Everything the controller and the one-shot restore share
struct Operator {
    ctx: Arc<Context>,
    gc: Arc<GarbageCollector>,
}

impl Operator {
    async fn start(client: Client, config: &OperatorConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(NsxClient::new(config)?);
        let service = Arc::new(SecurityPolicyService::new(transport, config));
        service.initialize().await?;

        let api: Arc<dyn PolicyApi> = Arc::new(KubePolicyApi::new(client.clone(), config.schema));
        let backend: Arc<dyn PolicyBackend> = service;
        let namespaces = Arc::new(KubeNamespaceClassifier::new(client, config));

        Ok(Self {
            ctx: Arc::new(Context::new(api.clone(), backend.clone(), namespaces)),
            gc: Arc::new(GarbageCollector::new(api, backend)),
        })
    }

    async fn restore(&self) -> nsx_operator::Result<()> {
        let kinds: Vec<Arc<dyn Restorable>> = vec![Arc::new(SecurityPolicyRestorer::new(
            self.ctx.clone(),
            self.gc.clone(),
        ))];
        restore_all(&kinds).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [SecurityPolicy::crd(), LegacySecurityPolicy::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Restore) => run_restore(cli.config).await,
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Install or update both SecurityPolicy CRDs so they match this build
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        (SecurityPolicy::crd_name(), SecurityPolicy::crd()),
        (LegacySecurityPolicy::crd_name(), LegacySecurityPolicy::crd()),
    ] {
        tracing::info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

async fn run_restore(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let operator = Operator::start(client, &config).await?;
    operator.restore().await?;
    tracing::info!("restore complete");
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    let operator = Operator::start(client.clone(), &config).await?;

    if config.restore_on_start {
        if let Err(e) = operator.restore().await {
            tracing::warn!(error = %e, "restore on start failed, continuing");
        }
    }

    let stop_gc = CancellationToken::new();
    let gc_task = {
        let gc = operator.gc.clone();
        let interval = config.gc_interval();
        let stop = stop_gc.clone();
        tokio::spawn(async move { gc.run(interval, stop).await })
    };

    let workers = config.workers();
    tracing::info!(
        schema = schema_label(config.schema),
        workers,
        cluster = %config.cluster,
        "starting SecurityPolicy controller"
    );

    let ctx = operator.ctx.clone();
    let controller = match config.schema {
        PolicySchema::Legacy => {
            run_policy_controller(Api::<LegacySecurityPolicy>::all(client), ctx.clone(), workers)
                .boxed_local()
        }
        PolicySchema::Vpc => {
            run_policy_controller(Api::<SecurityPolicy>::all(client), ctx.clone(), workers)
                .boxed_local()
        }
    };

    tokio::select! {
        _ = controller => {
            tracing::info!("SecurityPolicy controller completed");
        }
        _ = ctx.fatal.cancelled() => {
            tracing::error!("fatal backend error, exiting");
            stop_gc.cancel();
            std::process::exit(1);
        }
    }

    stop_gc.cancel();
    if let Err(e) = gc_task.await {
        tracing::warn!(error = %e, "garbage collector task ended abnormally");
    }
    tracing::info!("NSX operator shutting down");
    Ok(())
}

/// Drive the controller for one SecurityPolicy schema until shutdown
async fn run_policy_controller<K>(api: Api<K>, ctx: Arc<Context>, workers: usize)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let concurrency = u16::try_from(workers).unwrap_or(u16::MAX);
    Controller::new(api, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((obj, action)) => {
                        tracing::debug!(policy = %obj, ?action, "reconciliation completed");
                    }
                    // Deleted before the queue got to it: clean up by name
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        let namespace = obj.namespace.clone().unwrap_or_default();
                        let key = ResourceKey::new(namespace, obj.name.clone());
                        if let Err(e) = reconcile_vanished(&key, &ctx).await {
                            tracing::warn!(policy = %key, error = %e, "delete by name failed");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "reconciliation error");
                    }
                }
            }
        })
        .await;
}
