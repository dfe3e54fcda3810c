//! fluentd-sidecar-injector: SidecarInjector controller and admission webhook

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sidecar_injector_common::crd::SidecarInjector;
use sidecar_injector_common::kube_utils::create_client;
use sidecar_injector_common::leader_election::{
    KubeLeaseClient, LeaderElectionError, LeaderElector, DEFAULT_LEASE_NAME,
};
use sidecar_injector_common::retry::{retry_with_backoff, RetryConfig};
use sidecar_injector_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use sidecar_injector_common::{CONTROLLER_NAME, WEBHOOK_CONTAINER_PORT};
use sidecar_injector_controller::{run_controller, ReconcilerConfig, DEFAULT_WORKERS};
use sidecar_injector_webhook::server::{self, WebhookServerConfig};
use sidecar_injector_webhook::InjectorDefaults;

/// Injects fluentd or fluent-bit sidecars into annotated pods
#[derive(Parser, Debug)]
#[command(name = "fluentd-sidecar-injector", version, about, long_about = None)]
struct Cli {
    /// Print the SidecarInjector CRD and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Json, env = "SIDECAR_INJECTOR_LOG_FORMAT")]
    log_format: LogFormatArg,

    /// Path to a kubeconfig; in-cluster config otherwise
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile SidecarInjector resources into webhook handlers
    Controller(ControllerArgs),
    /// Serve the mutating admission webhook
    Webhook(WebhookArgs),
    /// Write a self-signed key and certificate for local testing
    Certificate(CertificateArgs),
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Let cert-manager issue the webhook certificate
    #[arg(long, env = "USE_CERT_MANAGER")]
    use_cert_manager: bool,

    /// Namespace for handler Deployments, Services and Secrets
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pod_namespace: String,

    /// Image of the webhook handler
    #[arg(long, env = "WEBHOOK_CONTAINER_IMAGE")]
    webhook_image: String,

    /// Lease used for leader election
    #[arg(long, default_value = DEFAULT_LEASE_NAME)]
    lease_name: String,

    /// Leader election identity; random when unset
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
}

#[derive(clap::Args, Debug)]
struct WebhookArgs {
    /// PEM certificate served by the webhook
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// PEM private key for the certificate
    #[arg(long)]
    tls_key_file: PathBuf,

    /// Listen port
    #[arg(long, default_value_t = WEBHOOK_CONTAINER_PORT)]
    port: u16,
}

#[derive(clap::Args, Debug)]
struct CertificateArgs {
    /// DNS name the certificate is issued for
    #[arg(long, default_value = "test-svc.test-ns.svc")]
    dns_name: String,

    /// Directory receiving server.key and server.crt
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SidecarInjector::crd())
            .context("failed to serialize SidecarInjector CRD")?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        default_filter: None,
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => {
            run_controller_command(cli.kubeconfig.as_deref(), args).await
        }
        Some(Commands::Webhook(args)) => run_webhook_command(args).await,
        Some(Commands::Certificate(args)) => write_certificate(&args),
        None => anyhow::bail!("no command given; see --help"),
    }
}

/// Cancelled on SIGTERM or ctrl-c
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "cannot listen for SIGTERM, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Server-side apply the CRD so its schema tracks the binary
async fn ensure_crd_installed(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();
    let crd = SidecarInjector::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    info!(crd = %name, "installing SidecarInjector CRD");
    crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    Ok(())
}

async fn run_controller_command(
    kubeconfig: Option<&Path>,
    args: ControllerArgs,
) -> anyhow::Result<()> {
    let client = create_client(kubeconfig)
        .await
        .context("failed to create Kubernetes client")?;
    let shutdown = shutdown_token();

    retry_with_backoff(&RetryConfig::default(), "install_crd", || {
        ensure_crd_installed(&client)
    })
    .await
    .context("failed to install SidecarInjector CRD")?;

    let identity = args
        .identity
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let elector = Arc::new(LeaderElector::new(
        Arc::new(KubeLeaseClient::new(client.clone(), &args.pod_namespace)),
        &args.lease_name,
        &identity,
    ));

    let config = ReconcilerConfig {
        namespace: args.pod_namespace,
        webhook_image: args.webhook_image,
        use_cert_manager: args.use_cert_manager,
        instance: Some(identity),
    };
    let workers = args.workers;

    let result = elector
        .run_exclusive(shutdown, move |work| {
            run_controller(client, config, workers, work)
        })
        .await;

    match result {
        Ok(()) => Ok(()),
        Err(e @ LeaderElectionError::LeadershipLost(_)) => {
            error!(error = %e, "exiting so a standby can take over");
            Err(e.into())
        }
        Err(e) => Err(anyhow::Error::new(e).context("leader election failed")),
    }
}

async fn run_webhook_command(args: WebhookArgs) -> anyhow::Result<()> {
    let defaults = InjectorDefaults::from_env();
    let config = WebhookServerConfig {
        addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)),
        cert_file: args.tls_cert_file,
        key_file: args.tls_key_file,
    };

    server::serve(config, defaults, shutdown_token())
        .await
        .context("webhook server failed")
}

fn write_certificate(args: &CertificateArgs) -> anyhow::Result<()> {
    let issued = sidecar_injector_pki::issue(&args.dns_name)
        .with_context(|| format!("failed to issue certificate for {}", args.dns_name))?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let key_path = args.out_dir.join("server.key");
    let cert_path = args.out_dir.join("server.crt");
    std::fs::write(&key_path, issued.key_pem)
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    std::fs::write(&cert_path, issued.cert_pem)
        .with_context(|| format!("failed to write {}", cert_path.display()))?;

    info!(dns_name = %args.dns_name, out_dir = %args.out_dir.display(), "wrote server.key and server.crt");
    Ok(())
}
