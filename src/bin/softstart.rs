//! Command-line client for the motor soft-starter.
//!
//! # Usage
//!
//! ```sh
//! softstart mqtt soft 50 100 150 200 250 254   # 6-step soft start
//! softstart mqtt continuous
//! softstart mqtt stop
//! softstart provision <ssid> <password>        # AP-mode WiFi setup
//! softstart manual-ip <ip>                     # use a known address
//! softstart discover                           # find a configured device
//! softstart diagnostics                        # stored configuration
//! softstart bluetooth <address> stop           # with --features bluez
//! ```
//!
//! Configuration is read from (and created at) the platform config dir,
//! e.g. `~/.config/rs-softstart/config.toml`. Set `RUST_LOG=debug` for
//! protocol-level logging.

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use rs_softstart::config::{Config, NetworkMode};
use rs_softstart::hal::{
    BackendClient, NmcliWifi, NoBluetooth, ReqwestDeviceClient, RumqttcConnector,
    UdpBroadcastDiscovery, DISCOVERY_PORT,
};
use rs_softstart::protocol::{MotorCommand, STEP_COUNT};
use rs_softstart::provisioning::{AutoSetupOutcome, ConfigureOutcome, Esp32Provisioner};
use rs_softstart::store::{NetworkConfigStore, STORE_FILE};
use rs_softstart::traits::{ApiError, CommandAudit, WifiInfo};
use rs_softstart::{MqttTransport, TransportManager};

/// How long to listen for telemetry after a command.
const TELEMETRY_WINDOW: Duration = Duration::from_secs(2);

/// Backend audit that is skipped when no base URL is configured.
struct OptionalAudit(Option<BackendClient>);

impl CommandAudit for OptionalAudit {
    async fn record(&self, command: &MotorCommand) -> Result<(), ApiError> {
        match &self.0 {
            Some(client) => client.record(command).await,
            None => Ok(()),
        }
    }
}

fn print_usage(program: &str) {
    println!("Motor soft-starter client");
    println!();
    println!("Usage:");
    println!("  {} mqtt soft <v1> <v2> <v3> <v4> <v5> <v6>", program);
    println!("  {} mqtt continuous | stop", program);
    println!("  {} provision <ssid> <password>", program);
    println!("  {} manual-ip <ip>", program);
    println!("  {} discover", program);
    println!("  {} diagnostics", program);
    #[cfg(feature = "bluez")]
    println!("  {} bluetooth <address> soft <v1..v6> | continuous | stop", program);
}

fn parse_command(args: &[String]) -> Result<MotorCommand> {
    match args.first().map(String::as_str) {
        Some("soft") => {
            let values = args[1..]
                .iter()
                .map(|v| v.parse::<i32>().with_context(|| format!("bad PWM value {:?}", v)))
                .collect::<Result<Vec<i32>>>()?;
            MotorCommand::soft_start_from_slice(&values)
                .ok_or_else(|| anyhow!("soft start needs {} values", STEP_COUNT))
        }
        Some("continuous") => Ok(MotorCommand::ContinuousStart),
        Some("stop") => Ok(MotorCommand::EmergencyStop),
        Some(other) => bail!("unknown motor command {:?}", other),
        None => bail!("missing motor command"),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("softstart");
    if args.len() < 2 || matches!(args[1].as_str(), "--help" | "-h" | "help") {
        print_usage(program);
        exit(if args.len() < 2 { 1 } else { 0 });
    }

    if let Err(e) = run(&args[1], &args[2..]).await {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

async fn run(subcommand: &str, args: &[String]) -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load_or_init(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let store = Arc::new(NetworkConfigStore::open(Config::data_dir().join(STORE_FILE))?);

    match subcommand {
        "mqtt" => run_mqtt(&config, &store, parse_command(args)?).await,
        "provision" => {
            let [ssid, password] = args else {
                bail!("usage: provision <ssid> <password>");
            };
            run_provision(&config, store, ssid, password).await
        }
        "manual-ip" => {
            let [ip] = args else {
                bail!("usage: manual-ip <ip>");
            };
            let provisioner = provisioner(&config, store)?;
            let saved = provisioner.configure_manual_ip(ip).await?;
            println!("Saved device {} on network {:?}", saved.esp32_ip, saved.network_ssid);
            Ok(())
        }
        "discover" => {
            let provisioner = provisioner(&config, store)?;
            let ip = provisioner.retry_discovery().await?;
            println!("Device found at {}", ip);
            Ok(())
        }
        "diagnostics" => {
            let ssid = NmcliWifi::new().current_ssid().await;
            for (key, value) in store.diagnostics(&config.endpoints, ssid.as_deref()) {
                println!("{:<16} {}", key, value);
            }
            Ok(())
        }
        #[cfg(feature = "bluez")]
        "bluetooth" => {
            let Some((address, rest)) = args.split_first() else {
                bail!("usage: bluetooth <address> <command>");
            };
            run_bluetooth(&config, address, parse_command(rest)?).await
        }
        other => bail!("unknown sub-command {:?}", other),
    }
}

fn provisioner(
    config: &Config,
    store: Arc<NetworkConfigStore>,
) -> Result<Esp32Provisioner<ReqwestDeviceClient, NmcliWifi, UdpBroadcastDiscovery>> {
    let http = ReqwestDeviceClient::new(config.provisioning.device_port)?;
    let fallback =
        UdpBroadcastDiscovery::new(DISCOVERY_PORT, config.provisioning.identity_markers.clone());
    Ok(Esp32Provisioner::with_fallback(
        Arc::new(http),
        Arc::new(NmcliWifi::new()),
        Arc::new(fallback),
        store,
        config.provisioning.clone(),
    ))
}

async fn run_provision(
    config: &Config,
    store: Arc<NetworkConfigStore>,
    ssid: &str,
    password: &str,
) -> Result<()> {
    let provisioner = provisioner(config, store)?;
    match provisioner.auto_setup().await {
        Ok(AutoSetupOutcome::AlreadyConfigured { ip }) => {
            println!("Device already configured at {}", ip);
            return Ok(());
        }
        Ok(AutoSetupOutcome::NeedsPassword { ssid: host_ssid }) => {
            if host_ssid != ssid {
                warn!("host is on {:?}, configuring device for {:?}", host_ssid, ssid);
            }
        }
        Err(e) => {
            if let Some(hint) = e.suggestion() {
                eprintln!("Hint: {}", hint);
            }
            return Err(e.into());
        }
    }

    info!("pushing WiFi settings to the device");
    match provisioner.configure_wifi(ssid, password).await? {
        ConfigureOutcome::Configured { ip } => println!("Device online at {}", ip),
        ConfigureOutcome::ConfiguredNotFound { notice } => println!("{}", notice),
    }
    Ok(())
}

async fn run_mqtt(config: &Config, store: &NetworkConfigStore, command: MotorCommand) -> Result<()> {
    let mut mqtt = config.mqtt.clone();
    let current_ssid = NmcliWifi::new().current_ssid().await;
    let use_store = config.endpoints.mode != NetworkMode::Local
        || store.is_configuration_valid(current_ssid.as_deref());
    if use_store {
        if let Some(url) = store.mqtt_url(&config.endpoints) {
            mqtt = mqtt.with_broker(&url);
        }
    }

    let audit = if config.backend.is_enabled() {
        Some(BackendClient::new(&config.backend)?)
    } else {
        None
    };
    let manager: TransportManager<NoBluetooth, RumqttcConnector, OptionalAudit> =
        TransportManager::with_audit(Arc::new(OptionalAudit(audit)));

    manager
        .activate(MqttTransport::new(RumqttcConnector::new(), mqtt))
        .await?;
    manager.send(command).await?;
    println!("Sent {} ({})", command, command.type_label());

    tokio::time::sleep(TELEMETRY_WINDOW).await;
    let sample = manager.telemetry().latest();
    println!(
        "Telemetry: speed={} state={} current={:?} voltage={:?}",
        sample.speed, sample.state, sample.current, sample.voltage
    );
    manager.deactivate().await;
    Ok(())
}

#[cfg(feature = "bluez")]
async fn run_bluetooth(config: &Config, address: &str, command: MotorCommand) -> Result<()> {
    use rs_softstart::hal::BluezAdapter;
    use rs_softstart::traits::BluetoothDevice;
    use rs_softstart::BluetoothTransport;

    let adapter = Arc::new(BluezAdapter::new().await?);
    let transport = BluetoothTransport::new(adapter, config.bluetooth.clone())
        .with_device(BluetoothDevice::new(None, address));
    let manager: TransportManager<BluezAdapter, RumqttcConnector> = TransportManager::new();
    manager.activate(transport).await?;
    manager.send(command).await?;
    println!("Sent {} over Bluetooth", command);

    tokio::time::sleep(TELEMETRY_WINDOW).await;
    let sample = manager.telemetry().latest();
    println!("Telemetry: speed={} state={}", sample.speed, sample.state);
    manager.deactivate().await;
    Ok(())
}
