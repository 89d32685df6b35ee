//! certloop operator - keeps a serving TLS certificate Secret valid and current

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use certloop_common::telemetry::{init_telemetry, TelemetryConfig};
use certloop_operator::authority::generate_ca_secret;
use certloop_operator::config::OperatorArgs;
use certloop_operator::controller::Context;
use certloop_operator::controller_runner::{bootstrap_reserved_record, build_tls_controller};
use certloop_operator::store::RecordId;

/// certloop - keeps a serving TLS certificate Secret valid and current
#[derive(Parser, Debug)]
#[command(name = "certloop-operator", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    operator: OperatorArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Ensures the reserved serving certificate Secret exists, then watches
    /// every Secret labelled `certloop.dev/tls=true` in the operator
    /// namespace and keeps its certificate valid.
    Controller,

    /// Print a CA Secret manifest with a freshly generated authority and exit
    GenerateCa {
        /// Common name of the generated CA certificate
        #[arg(long, default_value = "certloop CA")]
        common_name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk to the API server without a TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateCa { common_name }) => generate_ca(cli.operator, &common_name),
        Some(Commands::Controller) | None => run_controller(cli.operator).await,
    }
}

fn generate_ca(args: OperatorArgs, common_name: &str) -> anyhow::Result<()> {
    let id = RecordId::new(args.namespace, args.ca_secret);
    let secret = generate_ca_secret(&id, common_name)?;
    let manifest = serde_yaml::to_string(&secret)
        .map_err(|e| anyhow::anyhow!("Failed to serialize CA Secret: {}", e))?;
    println!("{manifest}");
    Ok(())
}

async fn run_controller(args: OperatorArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::from_env()?)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = args.resolve(std::env::var("HOSTNAME").ok())?;
    tracing::info!(
        namespace = %config.namespace,
        tls_secret = %config.tls_secret,
        dns_name = %config.dns_name,
        lifetime_hours = config.certificate_lifetime.as_secs() / 3600,
        pod = config.identity.as_ref().map(|i| i.pod_name.as_str()).unwrap_or("<none>"),
        "Starting certloop operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::builder(client.clone(), config).build());

    bootstrap_reserved_record(&ctx).await;
    build_tls_controller(client, ctx).await;

    tracing::info!("certloop operator shutting down");
    Ok(())
}
