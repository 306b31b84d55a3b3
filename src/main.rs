//! bgh-sync - command line front end for the sync engine

use bgh_smart_sync::{
    client::{fields, EndpointId, EndpointValues},
    logging::{init_logging, LogConfig},
    thermostat::{TargetState, Thermostat},
    DeviceStatus, Result, ServerConfig, SolidmationHttpClient, SyncEngine, SyncError,
};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// BGH Smart sync CLI
#[derive(Parser, Debug)]
#[command(name = "bgh-sync")]
#[command(about = "Inspect and control BGH Smart / Solidmation air conditioners")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ~/.bgh-smart/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Account email
    #[arg(long, global = true, env = "BGH_EMAIL")]
    email: Option<String>,

    /// Account password
    #[arg(long, global = true, env = "BGH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every device in the account
    List,
    /// Show one device
    Status {
        endpoint: i64,
        /// Bypass the freshness window
        #[arg(long)]
        force: bool,
    },
    /// Change mode, setpoint or fan speed
    Set {
        endpoint: i64,
        /// off, heat, cool or auto
        #[arg(long)]
        mode: Option<TargetState>,
        /// Target temperature in °C
        #[arg(long)]
        temp: Option<f64>,
        /// Raw vendor fan mode
        #[arg(long)]
        fan: Option<f64>,
    },
    /// Poll a device and print its state as JSON lines
    Watch {
        endpoint: i64,
        /// Seconds between polls
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())?;
        if let Some(email) = &self.email {
            config.solidmation.email = email.clone();
        }
        if let Some(password) = &self.password {
            config.solidmation.password = password.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(2);
        }
    };

    let mut log_config = LogConfig::from(&config.logging);
    if cli.debug {
        log_config = log_config.debug();
    }
    let _guard = match init_logging(log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ Failed to initialize logging: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli.command, config).await {
        error!("{e}");
        eprintln!("❌ {}", e.sanitize().message);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: ServerConfig) -> Result<()> {
    let gateway = Arc::new(SolidmationHttpClient::new(&config.solidmation)?);
    let engine = SyncEngine::new(gateway, config.engine.clone());
    let devices = engine.discover(&config.solidmation.homes).await?;
    info!("Loaded {devices} devices");

    match command {
        Command::List => {
            for device in engine.list_devices() {
                println!(
                    "{}\t{}\t{}\t{}",
                    device.endpoint_id,
                    device.home_id,
                    device.description,
                    if device.is_online { "online" } else { "offline" }
                );
            }
        }
        Command::Status { endpoint, force } => {
            let status = engine.get_status(EndpointId(endpoint), force).await?;
            print_json(&status)?;
        }
        Command::Set {
            endpoint,
            mode,
            temp,
            fan,
        } => {
            let device = ready_device(&engine, endpoint).await?;
            let thermostat = Thermostat::new(engine.clone(), &device);
            if let Some(mode) = mode {
                thermostat.set_target_state(mode)?;
            }
            if let Some(temp) = temp {
                thermostat.set_target_temperature(temp)?;
            }
            if let Some(fan) = fan {
                engine.queue_patch(device.endpoint_id, EndpointValues::new().with(fields::FAN_MODE, fan));
            }
            for event in engine.flush_pending().await {
                print_json(&event)?;
            }
        }
        Command::Watch { endpoint, interval } => {
            let interrupted = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            };
            watch(
                &engine,
                EndpointId(endpoint),
                Duration::from_secs(interval.max(1)),
                interrupted,
                print_json::<DeviceStatus>,
            )
            .await?;
        }
    }
    Ok(())
}

/// Poll a device every `period` until `shutdown` resolves, then flush
///
/// A failed poll is logged and retried on the next tick.
async fn watch<F>(
    engine: &SyncEngine,
    endpoint: EndpointId,
    period: Duration,
    shutdown: F,
    mut emit: impl FnMut(&DeviceStatus) -> Result<()>,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.get_status(endpoint, false).await {
                    Ok(status) => emit(&status)?,
                    Err(e) => warn!("Status of endpoint {endpoint} unavailable: {e}"),
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted, flushing pending commands");
                engine.flush_pending().await;
                return Ok(());
            }
        }
    }
}

async fn ready_device(engine: &SyncEngine, endpoint: i64) -> Result<bgh_smart_sync::Device> {
    match engine.get_status(EndpointId(endpoint), false).await? {
        DeviceStatus::Ready(device) => Ok(device),
        DeviceStatus::Initializing => Err(SyncError::not_found(format!("endpoint {endpoint}"))),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
