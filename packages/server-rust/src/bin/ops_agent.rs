//! `ops-agent`: registers a demo service with a relay over QUIC and serves it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ops_server::service::{CallContext, Registry, ServiceDescriptor, ServiceMetadata};
use ops_server::tunnel::{BearerAuthenticator, QuicTransport, TlsConfig, TunnelConfig};
use ops_server::{StartError, StartOptions, TunnelError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::ToSchema;

#[derive(Parser, Debug)]
#[command(name = "ops-agent")]
#[command(about = "Serve a demo service through a relay")]
struct Args {
    /// Relay address (host:port or https://host:port)
    #[arg(long, env = "OPS_RELAY_ADDR")]
    addr: String,

    /// Namespace to register under
    #[arg(long, env = "OPS_NAMESPACE", default_value = "demo")]
    namespace: String,

    /// Bearer token sent with the registration
    #[arg(long, env = "OPS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// TLS server name, when it differs from the relay host
    #[arg(long)]
    server_name: Option<String>,

    /// PEM file with the relay's CA certificates
    #[arg(long, env = "OPS_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default)]
struct Greeter;

#[derive(Debug, Deserialize, ToSchema)]
struct GreetInput {
    name: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct Greeting {
    message: String,
}

impl Greeter {
    async fn greet(self: Arc<Self>, ctx: CallContext, input: GreetInput) -> Result<Greeting> {
        info!(request_id = ?ctx.request_id(), name = %input.name, "greeting");
        Ok(Greeting {
            message: format!("hello {}", input.name),
        })
    }

    async fn health(self: Arc<Self>, _ctx: CallContext) -> Result<String> {
        Ok("ok".to_string())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut registry = Registry::new();
    registry.register(
        ServiceDescriptor::new(Greeter)
            .metadata(
                ServiceMetadata::new("greeter")
                    .display_name("Greeter")
                    .description("Demo service")
                    .operation("Greet", "Returns a greeting for a name")
                    .operation("Health", "Reports liveness"),
            )
            .operation("Greet", Greeter::greet)
            .operation("Health", Greeter::health),
    );

    let mut tunnel = TunnelConfig::new(args.namespace).with_tls(TlsConfig {
        server_name: args.server_name,
        ca_cert_path: args.ca_cert,
        ..TlsConfig::default()
    });
    if let Some(token) = args.token {
        tunnel = tunnel.with_authenticator(BearerAuthenticator::new(token));
    }
    let tunnel = tunnel.on_connection_ready(|response| {
        info!(code = %response.code, "connection ready");
    });

    let cancellation = CancellationToken::new();
    let on_signal = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        on_signal.cancel();
    });

    info!(addr = %args.addr, "starting agent");
    match registry
        .start(
            QuicTransport::new(),
            &cancellation,
            StartOptions::new(args.addr, tunnel),
        )
        .await
    {
        Ok(()) => info!("relay closed the connection"),
        Err(StartError::Tunnel(TunnelError::Cancelled)) => info!("stopped"),
        Err(err) => {
            warn!(error = %err, "agent stopped");
            return Err(err.into());
        }
    }
    Ok(())
}
