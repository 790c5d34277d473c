mod light;
mod providers;

use anyhow::Context;
use clap::Parser;
use hearth_config::Settings;
use hearth_device::{Device, Providers, RegistrationData};
use hearth_provider::{
    AxumHttpServer, FileConfigStore, ReqwestHttpClient, TokioTaskRunner,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Demo light daemon built on the hearth library.
#[derive(Parser, Debug)]
#[command(name = "hearthd", version, about)]
struct Args {
    /// Directory for persisted settings.
    #[arg(long, default_value = "/var/lib/hearthd")]
    config_dir: PathBuf,

    /// Address for the local HTTP endpoint.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Device name shown during discovery.
    #[arg(long, default_value = "Hearth Light")]
    name: String,

    /// Five-character model manifest id.
    #[arg(long, default_value = "AHLT1")]
    model_id: String,

    /// Static pairing code. Enables embedded-code pairing when set.
    #[arg(long)]
    embedded_code: Option<String>,

    /// Allow anonymous access and plaintext pairing. Development only.
    #[arg(long)]
    disable_security: bool,

    /// Registration ticket; when given, the device registers on startup.
    #[arg(long)]
    ticket: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    info!(listen = %args.listen, "starting hearthd");

    let name = args.name.clone();
    let model_id = args.model_id.clone();
    let embedded_code = args.embedded_code.clone();
    let disable_security = args.disable_security;
    let config_store = Arc::new(FileConfigStore::with_defaults(
        args.config_dir.clone(),
        move |settings: &mut Settings| {
            settings.name = name.clone();
            settings.model_id = model_id.clone();
            settings.firmware_version = env!("CARGO_PKG_VERSION").to_string();
            settings.oem_name = "Hearth".to_string();
            settings.model_name = "Demo Light".to_string();
            settings.disable_security = disable_security;
            if let Some(code) = &embedded_code {
                settings.embedded_code = code.clone();
                settings
                    .pairing_modes
                    .insert(hearth_config::PairingType::EmbeddedCode);
            }
        },
    ));

    let http_server = Arc::new(
        AxumHttpServer::bind(args.listen)
            .await
            .context("binding local endpoint")?,
    );

    let device = Device::create(Providers {
        task_runner: Arc::new(TokioTaskRunner::new()),
        http_client: Arc::new(ReqwestHttpClient::new()),
        config_store: Some(config_store),
        network: Some(Arc::new(providers::StaticNetwork)),
        http_server: Some(http_server),
        dns_sd: Some(Arc::new(providers::LoggingDnsSd::new())),
        wifi: None,
    })
    .context("creating device")?;

    light::install(&device)?;

    device
        .on_pairing_changed(
            |start| {
                info!(
                    session = %start.session_id,
                    mode = %start.mode,
                    code = %start.code,
                    "pairing started, enter this code on the client"
                );
            },
            |session| info!(session = %session, "pairing session closed"),
        )
        .into_iter()
        .for_each(|sub| sub.detach());

    device
        .on_gcd_state_changed(|state| info!(%state, "cloud state"))
        .detach();

    if let Some(ticket) = &args.ticket {
        info!(ticket, "registering with the cloud");
        device
            .register(RegistrationData::with_ticket(ticket))
            .await
            .context("registration failed")?;
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown")?;
    info!("shutting down");
    Ok(())
}
