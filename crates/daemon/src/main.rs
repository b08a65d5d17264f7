/// mobileproxy daemon
///
/// Turns the device into an egress node:
/// - HTTP and SOCKS5 proxies whose upstream sockets are bound to cellular
/// - An optional UDP tunnel to the controller
/// - IP rotation on demand or on a schedule
/// - A local status API

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mobileproxy_common::{AppConfig, DeviceId, NetworkConfig, ProviderKind, RadioKind};
use mobileproxy_core::{
    AttemptOutcome, IpRotationManager, ManualProvider, NetworkManager, NetworkProvider,
    RotationReport, TunnelSettings, VpnTunnelManager,
};
use mobileproxy_daemon::{ApiServer, AppState, ProxyManager};

const DEFAULT_CONFIG_PATH: &str = "mobileproxy.toml";

/// How long `rotate` waits for cellular before trying anyway
const ATTACH_WAIT: Duration = Duration::from_secs(5);

struct Args {
    command: String,
    config_path: PathBuf,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args> {
    let mut command = None;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = raw.next().context("--config needs a path")?;
                config_path = PathBuf::from(path);
            }
            _ if command.is_none() => command = Some(arg),
            _ => bail!("unexpected argument: {}", arg),
        }
    }

    Ok(Args {
        command: command.unwrap_or_else(|| "run".to_string()),
        config_path,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    match args.command.as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-v" => {
            println!("mobileproxy v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "init-config" => init_config(&args.config_path),
        "run" => run_daemon(load_config(&args.config_path)?, true).await,
        "proxy" => run_daemon(load_config(&args.config_path)?, false).await,
        "rotate" => rotate_once(load_config(&args.config_path)?).await,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

/// Loads the config file (defaults when absent) and installs logging.
fn load_config(path: &PathBuf) -> Result<AppConfig> {
    let (config, loaded) = if path.exists() {
        (AppConfig::from_file(path)?, true)
    } else {
        (AppConfig::new(), false)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if loaded {
        info!("Loaded configuration from {:?}", path);
    } else {
        warn!("No configuration file at {:?}, using defaults", path);
    }

    config.validate()?;
    Ok(config)
}

fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        bail!("{:?} already exists", path);
    }
    let id = DeviceId::generate();
    AppConfig::new().with_device_id(id).to_file(path)?;
    println!("Wrote default configuration to {:?} (device {})", path, id);
    Ok(())
}

fn network_provider(config: &NetworkConfig) -> Arc<dyn NetworkProvider> {
    match config.provider {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        ProviderKind::Interface => Arc::new(mobileproxy_core::InterfaceProvider::new(config)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        ProviderKind::Interface => {
            warn!("Interface watching is not supported here, using manual networks");
            Arc::new(ManualProvider::new())
        }
        ProviderKind::Manual => Arc::new(ManualProvider::new()),
    }
}

#[cfg(target_os = "linux")]
fn build_tunnel(
    config: &AppConfig,
    network: Arc<NetworkManager>,
) -> Result<Option<Arc<VpnTunnelManager>>> {
    if !config.tunnel.enabled {
        return Ok(None);
    }

    let settings = TunnelSettings::from_config(&config.tunnel, config.device_id()?)?;
    let interfaces = Arc::new(mobileproxy_core::TunFactory::new(
        config.tunnel.interface_name.clone(),
        config.tunnel.routes.clone(),
    ));
    Ok(Some(Arc::new(VpnTunnelManager::new(
        settings, network, interfaces,
    ))))
}

#[cfg(not(target_os = "linux"))]
fn build_tunnel(
    config: &AppConfig,
    _network: Arc<NetworkManager>,
) -> Result<Option<Arc<VpnTunnelManager>>> {
    if !config.tunnel.enabled {
        return Ok(None);
    }
    TunnelSettings::from_config(&config.tunnel, config.device_id()?)?;
    bail!("the tunnel needs a TUN device, which this platform does not provide")
}

/// Runs until Ctrl-C. `full` adds the tunnel, scheduled rotation and the status API.
async fn run_daemon(config: AppConfig, full: bool) -> Result<()> {
    info!("Starting mobileproxy v{}", env!("CARGO_PKG_VERSION"));
    match config.device.id {
        Some(id) => info!("Device {}", id),
        None => info!("No device id configured"),
    }

    let network = Arc::new(NetworkManager::new(network_provider(&config.network)));
    network.acquire_networks();

    let proxies = Arc::new(ProxyManager::new(network.clone(), config.proxy.clone()));
    let addrs = proxies
        .start()
        .await
        .context("failed to start the proxies")?;
    info!("HTTP proxy listening on {}", addrs.http);
    info!("SOCKS5 proxy listening on {} (TCP and UDP)", addrs.socks5);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    let mut tunnel = None;

    if full {
        tunnel = match build_tunnel(&config, network.clone()) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                proxies.stop().await;
                return Err(e);
            }
        };
        if let Some(tunnel) = &tunnel {
            if let Err(e) = tunnel.connect().await {
                proxies.stop().await;
                return Err(e).context("failed to start the tunnel");
            }
        }

        let rotation = Arc::new(IpRotationManager::from_config(
            network.clone(),
            &config.rotation,
        ));
        info!("Rotation strategies: {}", rotation.strategy_names().join(", "));
        if let Some(every) = config.rotation.interval() {
            info!("Rotating every {:?}", every);
            background.push(tokio::spawn(rotation.clone().run_periodic(every)));
        }

        if config.api.enabled {
            let api_addr = config
                .api
                .listen_addr
                .parse()
                .context("invalid api.listen_addr")?;
            let api_server = ApiServer::new(
                api_addr,
                AppState {
                    device_id: config.device.id,
                    network: network.clone(),
                    proxies: proxies.clone(),
                    tunnel: tunnel.clone(),
                    rotation,
                },
            );
            background.push(tokio::spawn(async move {
                if let Err(e) = api_server.start().await {
                    warn!("API server error: {}", e);
                }
            }));
        }
    }

    info!("mobileproxy is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for task in background {
        task.abort();
    }
    proxies.stop().await;
    if let Some(tunnel) = tunnel {
        tunnel.disconnect().await;
    }
    network.release_networks();

    info!("mobileproxy stopped");
    Ok(())
}

async fn rotate_once(config: AppConfig) -> Result<()> {
    let network = Arc::new(NetworkManager::new(network_provider(&config.network)));
    network.acquire_networks();
    if network
        .wait_for_attachment(RadioKind::Cellular, ATTACH_WAIT)
        .await
        .is_none()
    {
        warn!("Cellular is not attached, rotating anyway");
    }

    let rotation = IpRotationManager::from_config(network.clone(), &config.rotation);
    let report = rotation.rotate().await?;
    print_report(&report);
    network.release_networks();

    if !report.success {
        std::process::exit(2);
    }
    Ok(())
}

fn print_report(report: &RotationReport) {
    println!("\n========================================");
    println!("         IP Rotation");
    println!("========================================");
    for attempt in &report.attempts {
        let outcome = match attempt.outcome {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Pending => "pending",
        };
        println!(
            "#{:<4} {:<20} {:<8} {} ms",
            attempt.id, attempt.strategy, outcome, attempt.duration_ms
        );
    }
    println!(
        "Result:           {}",
        if report.success { "rotated" } else { "all strategies failed" }
    );
    println!("========================================\n");
}

fn print_help() {
    println!("mobileproxy - mobile egress proxy daemon");
    println!();
    println!("USAGE:");
    println!("    mobileproxy [COMMAND] [--config PATH]");
    println!();
    println!("COMMANDS:");
    println!("    run           Proxies, tunnel, scheduled rotation and status API (default)");
    println!("    proxy         HTTP and SOCKS5 proxies only");
    println!("    rotate        Rotate the cellular IP once and print the outcome");
    println!("    init-config   Write a default configuration file");
    println!("    help          Show this help message");
    println!("    version       Show version information");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config PATH   Configuration file (default: {})", DEFAULT_CONFIG_PATH);
    println!();
    println!("PORTS:");
    println!("    HTTP:       base_port + 0  (default 8080)");
    println!("    SOCKS5:     base_port + 1  (default 8081, TCP and UDP)");
    println!("    Status API: 127.0.0.1:8090");
    println!();
    println!("EXAMPLES:");
    println!("    curl --proxy socks5h://DEVICE:8081 https://ifconfig.me");
    println!("    curl --proxy http://DEVICE:8080 http://ifconfig.me");
    println!("    curl http://127.0.0.1:8090/api/status");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults_to_run() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.command, "run");
        assert_eq!(parsed.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_config_flag_in_any_position() {
        let parsed = args(&["--config", "/data/mp.toml", "proxy"]).unwrap();
        assert_eq!(parsed.command, "proxy");
        assert_eq!(parsed.config_path, PathBuf::from("/data/mp.toml"));

        let parsed = args(&["rotate", "-c", "x.toml"]).unwrap();
        assert_eq!(parsed.command, "rotate");
        assert_eq!(parsed.config_path, PathBuf::from("x.toml"));
    }

    #[test]
    fn test_rejects_dangling_and_extra_args() {
        assert!(args(&["run", "--config"]).is_err());
        assert!(args(&["run", "proxy"]).is_err());
    }
}
