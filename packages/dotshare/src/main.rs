use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dot_driver::{CoreConfig, DeviceInfo, DriverCore, Geometry, VirtualDriver};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use dotshare::config::{AuthFileConfig, AuthMethodConfig};
use dotshare::{
    Authenticator, DotshareConfig, FileConfig, KeyAuth, ListenAddr, NoAuth, Server, bind_all,
    load_config,
};

#[derive(Parser)]
#[command(name = "dotshare")]
#[command(about = "Share one braille display between many clients")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "dotshare.toml")]
    config: PathBuf,

    /// Listen address (tcp:HOST:PORT or unix:PATH); repeat for several.
    /// Replaces the configured list.
    #[arg(short, long)]
    listen: Vec<String>,

    /// Display width in cells
    #[arg(long)]
    columns: Option<u32>,

    /// Display height in rows
    #[arg(long)]
    rows: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "dotshare=debug,dot_driver=debug,info"
    } else {
        "dotshare=info,dot_driver=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(columns) = cli.columns {
        file_config.display.columns = columns;
    }
    if let Some(rows) = cli.rows {
        file_config.display.rows = rows;
    }
    let mut config = DotshareConfig::from_file(&file_config)?;
    if !cli.listen.is_empty() {
        config.listen = cli
            .listen
            .iter()
            .map(|s| s.parse::<ListenAddr>())
            .collect::<Result<_, _>>()?;
    }

    info!("Starting dotshare");
    let authenticator = build_authenticator(&config.auth)?;

    let device = &config.display;
    let geometry = Geometry::new(device.columns, device.rows);
    let (driver, _display) = VirtualDriver::new(&device.driver_name, &device.model, geometry);
    info!(
        driver = %device.driver_name,
        columns = geometry.columns,
        rows = geometry.rows,
        "Using virtual display"
    );

    let (gateway, inbox) = dot_driver::gateway(32);
    let server = Server::new(
        config.server.clone(),
        gateway.clone(),
        authenticator,
        DeviceInfo {
            driver_name: device.driver_name.clone(),
            model: device.model.clone(),
            geometry,
            ..Default::default()
        },
    );
    let core = DriverCore::spawn(
        Box::new(driver),
        inbox,
        server.clone(),
        CoreConfig {
            poll_interval: config.poll_interval,
            ..Default::default()
        },
    )
    .context("Failed to start driver core")?;

    let listeners = match bind_all(server.clone(), &config.listen).await {
        Ok(listeners) => listeners,
        Err(e) => {
            gateway.shutdown().await;
            let _ = tokio::task::spawn_blocking(move || core.join()).await;
            return Err(e).context("Failed to start listeners");
        }
    };
    info!("Listening on {}", listeners.local_addrs().join(", "));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for ctrl-c: {}", e);
    }

    server.shutdown();
    listeners.wait().await;
    gateway.shutdown().await;
    tokio::task::spawn_blocking(move || core.join())
        .await
        .context("Driver core join failed")?;

    let snapshot = server.metrics().snapshot();
    info!(
        uptime_secs = snapshot.uptime_secs,
        connections = snapshot.connections.total,
        refused = snapshot.connections.refused,
        packets_in = snapshot.packets.received,
        packets_out = snapshot.packets.sent,
        oversized = snapshot.packets.oversized,
        "Server stopped"
    );
    Ok(())
}

fn build_authenticator(auth: &AuthFileConfig) -> Result<Arc<dyn Authenticator>> {
    match auth.method {
        AuthMethodConfig::None => {
            warn!("Authentication disabled; any local client may connect");
            Ok(Arc::new(NoAuth))
        }
        AuthMethodConfig::Keyfile => {
            let Some(path) = &auth.key_file else {
                bail!("auth.method = \"keyfile\" needs auth.key_file");
            };
            let auth = KeyAuth::from_file(path)?;
            info!(path = %path.display(), "Key file authentication enabled");
            Ok(Arc::new(auth))
        }
    }
}
