//! Command line front end of the HM-10 switch controller.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hm10_switch_controller::domain::authorization::{AuthorizationStore, JsonFileStore};
use hm10_switch_controller::domain::models::BdAddr;
use hm10_switch_controller::domain::settings::SettingsService;
use hm10_switch_controller::infrastructure::bluetooth::service::commit_received_key;
use hm10_switch_controller::infrastructure::logging::init_logger;
use hm10_switch_controller::infrastructure::rfcomm::{
    spawn_initiator, spawn_responder, HandshakeConfig, HandshakeHandle, RfcommAdapter, TcpRfcomm,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "hm10-switch")]
#[command(about = "Controller for HM-10 based smart switches")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for another controller to hand over a peripheral key
    ReceiveKey {
        /// Listen address of the key channel
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Hand a peripheral key to another controller
    GiveKey {
        /// Address of the receiving controller (host:port)
        #[arg(short, long)]
        peer: String,
        /// Peripheral address to hand over
        #[arg(short, long)]
        token: String,
    },
    /// Show whether a peripheral has authorized this controller
    Status {
        address: String,
    },
    /// Scan for nearby peripherals
    #[cfg(feature = "btleplug")]
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        secs: Option<u64>,
    },
    /// Connect to a peripheral and print what it reports
    #[cfg(feature = "btleplug")]
    Watch {
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match cli.config {
        Some(path) => SettingsService::load(path),
        None => SettingsService::new()?,
    };
    let _guard = init_logger(&settings.get().log_settings)?;

    let store_path = settings.authorization_path();
    let store = AuthorizationStore::new(Arc::new(
        JsonFileStore::open(&store_path)
            .with_context(|| format!("opening {}", store_path.display()))?,
    ));
    let config = HandshakeConfig::from(&settings.get().key_exchange);

    match cli.command {
        Commands::ReceiveKey { bind } => {
            let bind = bind.unwrap_or_else(|| settings.get().key_exchange.tcp_bind.clone());
            let adapter = TcpRfcomm::new(bind);
            let listener = adapter.listen(&config.service_name, config.service_uuid)?;
            println!("Waiting for a key on {}", listener.local_address());

            let handle = spawn_responder(listener, config, move |session| {
                commit_received_key(&store, session)
            })?;
            let session = join(handle).await?;
            println!("Received key for {} from {}", session.token, session.peer_address);
        }
        Commands::GiveKey { peer, token } => {
            let token = BdAddr::parse(&token)?;
            let adapter: Arc<dyn RfcommAdapter> =
                Arc::new(TcpRfcomm::new(settings.get().key_exchange.tcp_bind.clone()));
            let handle = spawn_initiator(adapter, &peer, token.as_str(), config)?;
            join(handle).await?;
            println!("Handed key for {} to {}", token, peer);
        }
        Commands::Status { address } => {
            let address = BdAddr::parse(&address)?;
            let state = if store.is_authorized(address.as_str()) {
                "authorized"
            } else {
                "not authorized"
            };
            println!("{}: {}", address, state);
        }
        #[cfg(feature = "btleplug")]
        Commands::Scan { secs } => {
            let period = secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| settings.get().ble.scan_period());
            ble::scan(period).await?;
        }
        #[cfg(feature = "btleplug")]
        Commands::Watch { address } => {
            ble::watch(&address, settings.get(), store).await?;
        }
    }

    Ok(())
}

/// Wait for a handshake worker without blocking the runtime.
async fn join(
    handle: HandshakeHandle,
) -> anyhow::Result<hm10_switch_controller::domain::models::HandshakeSession> {
    let session = tokio::task::spawn_blocking(move || handle.join()).await??;
    info!("Key handshake finished");
    Ok(session)
}

#[cfg(feature = "btleplug")]
mod ble {
    use super::*;
    use hm10_switch_controller::domain::models::{AppEvent, LinkEvent, ScanEvent};
    use hm10_switch_controller::domain::settings::Settings;
    use hm10_switch_controller::infrastructure::bluetooth::platform::{
        default_adapter, BtleplugScanner, BtleplugTransport,
    };
    use hm10_switch_controller::infrastructure::bluetooth::scanner::ScanSession;
    use hm10_switch_controller::BluetoothService;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub async fn scan(period: Duration) -> anyhow::Result<()> {
        let adapter = default_adapter().await?;
        let session = ScanSession::new(Arc::new(BtleplugScanner::new(adapter)));
        let mut events = session.subscribe();

        println!("Scanning for {} seconds...", period.as_secs());
        session.start(period)?;
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::DeviceFound(device) => {
                    println!("  {} ({})", device.display_name(), device.address)
                }
                ScanEvent::Stopped(_) => break,
                ScanEvent::Started => {}
            }
        }
        println!("Found {} devices", session.devices().len());
        Ok(())
    }

    pub async fn watch(
        address: &str,
        settings: &Settings,
        store: AuthorizationStore,
    ) -> anyhow::Result<()> {
        let adapter = default_adapter().await?;

        // The platform only knows peripherals it has seen advertising
        let scanner = Arc::new(BtleplugScanner::new(adapter.clone()));
        let (tx, mut events) = mpsc::unbounded_channel();
        let service = BluetoothService::new(
            Arc::new(BtleplugTransport::new(adapter)),
            scanner,
            Arc::new(TcpRfcomm::new(settings.key_exchange.tcp_bind.clone())),
            store,
            settings,
            tx,
        );
        service.start_scan()?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        service.stop_scan();
        service.connect(address)?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Some(AppEvent::Link(LinkEvent::DataAvailable(message))) => {
                        println!("<- {}", message)
                    }
                    Some(AppEvent::Link(LinkEvent::Disconnected)) => {
                        println!("Disconnected");
                        break;
                    }
                    Some(AppEvent::Link(event)) => println!("{:?}", event),
                    Some(AppEvent::Peripheral(state)) => println!("{:?}", state),
                    Some(AppEvent::LogMessage(msg)) => println!("{}", msg.message),
                    Some(_) => {}
                    None => break,
                },
            }
        }

        service.disconnect();
        Ok(())
    }
}
