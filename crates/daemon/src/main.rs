use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use meshd::{
    bus::{self, MessageBus, TcpBus},
    config,
    http,
    identity::Identity,
    messages::{RegisterMessage, CONTROLLER_CHANNEL},
    metrics::Metrics,
    netcheck::{NatClassifier, StunReflector},
    node::{self, LocalNodeState},
    planner::WG_DEFAULT_PORT,
    platform::{native_driver, Os},
    registry::HttpDeviceRegistry,
    reconciler::Reconciler,
    Agent,
};
use rand::Rng;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

/// Source ports used for periodic NAT re-classification while the tunnel
/// holds the listen port.
const NAT_PROBE_PORTS: std::ops::Range<u16> = 32768..61000;

fn load_config(args: &Args) -> Result<config::Config> {
    match &args.config {
        Some(path) => config::Config::load(path),
        None => config::Config::load_or_default(),
    }
}

/// Command-line values win over the config file.
fn apply_overrides(args: &Args, config: &mut config::Config) {
    if let Some(port) = args.port {
        config.daemon.listen_port = port;
    }
    if let Some(interface) = &args.interface {
        config.daemon.interface = interface.clone();
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level = level.clone();
    }
    if let Some(path) = &args.identity {
        config.daemon.identity_path = Some(path.to_string_lossy().to_string());
    }
    if let Some(bus) = &args.bus {
        config.coordinator.bus = Some(bus.clone());
    }
    if let Some(url) = &args.api_url {
        config.coordinator.api_url = Some(url.clone());
    }
    if let Some(zone) = &args.zone {
        config.coordinator.zone = zone.clone();
    }
    if let Some(id) = &args.device_id {
        config.network.device_id = Some(id.clone());
    }
    if let Some(ip) = &args.endpoint_ip {
        config.network.endpoint_ip = Some(ip.clone());
    }
    if let Some(ip) = &args.request_ip {
        config.network.request_ip = Some(ip.clone());
    }
    if !args.child_prefix.is_empty() {
        config.network.child_prefixes = args.child_prefix.clone();
    }
    if !args.stun_server.is_empty() {
        config.network.stun_servers = args.stun_server.clone();
    }
    config.network.stun |= args.stun;
    config.network.hub_router |= args.hub_router;
}

fn reflector_pair(servers: &[String]) -> Result<(String, String)> {
    match servers {
        [first, second, ..] if first != second => Ok((first.clone(), second.clone())),
        _ => bail!("Two distinct STUN servers are required for NAT classification"),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "meshd",
    version,
    about = "WireGuard mesh node agent",
    long_about = "meshd\n\n\
        Joins a coordinator zone and keeps the local WireGuard interface and\n\
        routing table converged onto the zone roster:\n\
        - Symmetric NAT detection via two STUN reflectors\n\
        - Same-LAN, direct and hub-relayed peering\n\
        - Hub router mode for hub-and-spoke zones (Linux)\n\n\
        Examples:\n  \
          # Join a zone as a spoke\n  \
          meshd --bus coordinator.example:6379 --api-url http://coordinator.example:8080 --zone lab\n\n  \
          # Join as the zone's hub router, advertising a site subnet\n  \
          meshd --bus coordinator.example:6379 --api-url http://coordinator.example:8080 \\\n    \
          --zone lab --hub-router --child-prefix 192.168.50.0/24"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    /// Coordinator message bus address (host:port)
    #[arg(long, short = 'b')]
    bus: Option<String>,

    /// Device registry base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Zone to join
    #[arg(long, short = 'z')]
    zone: Option<String>,

    /// WireGuard listen port (hub routers always use 51820)
    #[arg(short, long)]
    port: Option<u16>,

    /// Tunnel interface name
    #[arg(long)]
    interface: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Path to identity directory
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Device id assigned by the coordinator (defaults to the public key)
    #[arg(long)]
    device_id: Option<String>,

    /// Public address to advertise as this node's endpoint
    #[arg(long)]
    endpoint_ip: Option<String>,

    /// Tunnel address to request from the coordinator
    #[arg(long)]
    request_ip: Option<String>,

    /// Subnet reachable behind this node (repeatable or comma separated)
    #[arg(long, action = clap::ArgAction::Append)]
    child_prefix: Vec<String>,

    /// Act as the hub router of a hub-and-spoke zone
    #[arg(long)]
    hub_router: bool,

    /// Advertise the STUN-discovered public address as the endpoint
    #[arg(long)]
    stun: bool,

    /// STUN server used for NAT classification (repeat twice)
    #[arg(long, short = 's', action = clap::ArgAction::Append)]
    stun_server: Vec<String>,

    /// Initialize new identity and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, load_error) = match load_config(&args) {
        Ok(config) => (config, None),
        Err(e) => (config::Config::default(), Some(e)),
    };
    apply_overrides(&args, &mut config);

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.daemon.log_level.as_str()),
    )
    .init();

    if let Some(e) = load_error {
        warn!("Failed to load config: {:#}. Using defaults.", e);
    }

    let identity_dir = config
        .daemon
        .identity_path
        .as_ref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()));

    // Handle --init flag
    if args.init {
        let id = Identity::generate()?;
        let dir = identity_dir.unwrap_or_else(Identity::default_path);
        id.save(&dir)?;
        info!("Generated new identity: {}", id.public_key_base64());
        println!("Your Public Key: {}", id.public_key_base64());
        return Ok(());
    }

    // === Startup validation ===
    let os = Os::current().context("Unsupported operating system")?;
    let hub_router = config.network.hub_router;
    node::check_supported(os, hub_router)?;

    let (requested_address, child_prefixes) = node::validate_inputs(
        config.network.request_ip.as_deref(),
        &config.network.child_prefixes,
    )
    .context("Invalid address configuration")?;
    let endpoint_override = config
        .network
        .endpoint_ip
        .as_deref()
        .map(|s| s.trim().parse::<IpAddr>())
        .transpose()
        .context("Invalid endpoint IP")?;

    let zone = config.coordinator.zone.trim().to_string();
    if zone.is_empty() {
        bail!("No zone configured (--zone)");
    }
    let bus_addr = config
        .coordinator
        .bus
        .clone()
        .context("No coordinator bus address configured (--bus)")?;
    let api_url = config
        .coordinator
        .api_url
        .clone()
        .context("No device registry URL configured (--api-url)")?;
    let (first_reflector, second_reflector) = reflector_pair(&config.network.stun_servers)?;

    let interface = if config.daemon.interface.is_empty() {
        os.default_interface().to_string()
    } else {
        config.daemon.interface.clone()
    };
    let driver = native_driver(os, &interface);
    driver
        .check_prerequisites()
        .context("Tunnel prerequisites missing")?;

    let identity = Identity::load_or_generate(identity_dir.as_deref())?;
    info!("Using public key: {}", identity.public_key_base64());

    info!(
        "Starting meshd on {} (interface {}, zone {}{})",
        os,
        interface,
        zone,
        if hub_router { ", hub router" } else { "" }
    );

    // === Coordinator ===
    let tcp_bus = TcpBus::connect(&bus_addr).await?;
    let coordinator = tcp_bus.coordinator();
    let bus: Arc<dyn MessageBus> = Arc::new(tcp_bus);
    bus::wait_until_ready(bus.as_ref(), config.coordinator.ready_timeout())
        .await
        .context("Coordinator readiness check failed")?;

    // === NAT classification ===
    let listen_port = if hub_router {
        WG_DEFAULT_PORT
    } else {
        config.daemon.listen_port
    };
    let classifier = NatClassifier::new(StunReflector::default())
        .with_servers(first_reflector, second_reflector)
        .with_retries(config.timing.nat_retries, config.timing.nat_backoff());
    let nat = classifier.classify_or_assume_symmetric(listen_port).await;
    info!("NAT classification: {}", nat);

    // === Local node ===
    let local_address = match driver.local_address(coordinator) {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!("Could not discover local address: {}", e);
            None
        }
    };
    let endpoint_ip = node::choose_endpoint_ip(
        endpoint_override,
        nat.reflexive_ip(),
        config.network.stun,
        local_address,
    )?;
    let local = LocalNodeState {
        device_id: config
            .network
            .device_id
            .clone()
            .unwrap_or_else(|| identity.public_key_base64()),
        public_key: identity.public_key_base64(),
        zone,
        os,
        hub_router,
        listen_port,
        requested_address,
        endpoint_ip,
        local_address,
        reflexive_address: nat.reflexive_ip(),
        child_prefixes,
    };

    if hub_router {
        driver
            .enable_forwarding()
            .context("Failed to enable IP forwarding")?;
        info!("IP forwarding enabled for hub routing");
    }

    // === Metrics ===
    let metrics = Metrics::new();
    if config.metrics.enabled {
        let metrics = Arc::clone(&metrics);
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(metrics, port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    // === Join the zone ===
    let (bus_tx, bus_rx) = mpsc::channel(64);
    bus.subscribe(&local.zone).await?;
    let pump = bus::spawn_pump(Arc::clone(&bus), bus_tx);

    let register = RegisterMessage::new(local.registration_record(nat.is_symmetric()));
    bus.publish(CONTROLLER_CHANNEL, &serde_json::to_string(&register)?)
        .await?;
    info!(
        "Registration sent for {} with endpoint {}",
        local.device_id,
        local.endpoint()
    );

    // === NAT refresh ===
    let (nat_tx, nat_rx) = mpsc::channel(4);
    let nat_refresh = config.timing.nat_refresh();
    if !nat_refresh.is_zero() {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + nat_refresh, nat_refresh);
            loop {
                ticker.tick().await;
                let port = rand::thread_rng().gen_range(NAT_PROBE_PORTS);
                match classifier.classify(port).await {
                    Ok(result) => {
                        if nat_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("NAT refresh failed, keeping previous result: {}", e),
                }
            }
        });
    }

    // === Shutdown ===
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let registry = HttpDeviceRegistry::new(&api_url, config.coordinator.registry_timeout())?;
    let reconciler = Reconciler::new(driver, identity.private_key_base64());
    let agent = Agent::new(local, reconciler, Arc::new(registry), nat, Arc::clone(&metrics))
        .with_keepalive(config.timing.wg_keepalive())
        .with_registry_timeout(config.coordinator.registry_timeout())
        .with_resync_interval(config.timing.resync_interval());

    let result = agent.run(bus_rx, nat_rx, shutdown_rx).await;
    pump.abort();

    match result {
        Ok(()) => {
            info!("meshd stopped");
            Ok(())
        }
        Err(e) => {
            error!("Fatal: {}", e);
            Err(e.into())
        }
    }
}
