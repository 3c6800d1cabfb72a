use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_ap::platform::{
    self, IptablesFilter, SystemLinks, SystemPorts, SystemVpn, SystemdSupervisor,
};
use vpn_ap::recovery::RecoveryReport;
use vpn_ap::shutdown::install_interrupt_handler;
use vpn_ap::status::{self, PUBLIC_IP_TIMEOUT};
use vpn_ap::types::WifiCredentials;
use vpn_ap::{Config, EmergencyOverride, Gateway, GatewayError, HealthSupervisor, NetworkMode};

#[derive(Parser)]
#[command(name = "vpn-ap")]
#[command(about = "Network mode controller and watchdog for a travel router")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./vpn-ap.toml, then /etc/vpn-ap/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mode, upstream, VPN, services and watchdog health
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Also look up the public IP address
        #[arg(long)]
        public_ip: bool,
    },
    /// Emergency: load an allow-all firewall
    Reset,
    /// Emergency: restart the access point, DHCP/DNS and portal services
    Restart,
    /// Emergency: disconnect VPN, allow-all firewall, restart services
    Full,
    /// Emergency: disconnect VPN and load an allow-all firewall
    VpnOff,
    /// Startup reconciliation (captive, or VPN if already connected)
    Boot,
    /// Run a single watchdog pass
    Tick,
    /// Run the watchdog until interrupted
    Watchdog,
    /// Join a WiFi network as the upstream
    ConnectWifi {
        #[arg(long)]
        ssid: String,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
        /// The network has no password
        #[arg(long, conflicts_with = "password")]
        open: bool,
    },
    /// Acquire an upstream and give clients direct internet
    ConnectUpstream {
        /// Use this interface only (required for long-range links)
        #[arg(long)]
        iface: Option<String>,
    },
    /// Connect the VPN and route clients only through it
    ConnectVpn,
    /// Switch to captive or internet mode
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Generate default config file
    Init {
        #[arg(default_value = "vpn-ap.toml")]
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Captive,
    Internet,
}

impl From<ModeArg> for NetworkMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Captive => NetworkMode::Captive,
            ModeArg::Internet => NetworkMode::Internet,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout is reserved for command output
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {e}");
    }

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    if let Commands::Init { path } = &cli.command {
        info!("Generating default config...");
        Config::default().save(path)?;
        println!("Created default config: {}", path.display());
        return Ok(());
    }

    let config = Config::resolve(cli.config.as_deref())?;
    let ports = platform::system_ports(&config)?;

    if let Commands::Status { json, public_ip } = cli.command {
        let mut snapshot = status::collect(&ports, &config).await;
        if public_ip {
            snapshot.public_ip = status::public_ip(PUBLIC_IP_TIMEOUT).await;
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            print!("{snapshot}");
        }
        return Ok(());
    }

    platform::require_root()?;

    match cli.command {
        Commands::Reset => {
            let report = emergency(ports, &config).reset_firewall_only().await?;
            print_report(&report);
        }
        Commands::Restart => {
            let report = emergency(ports, &config).restart_services().await?;
            print_report(&report);
        }
        Commands::Full => {
            let report = emergency(ports, &config).full_recovery().await?;
            print_report(&report);
        }
        Commands::VpnOff => {
            let report = emergency(ports, &config).vpn_off().await?;
            print_report(&report);
        }
        Commands::Boot => {
            let mode = Gateway::new(ports, &config).boot().await?;
            println!("mode: {mode}");
        }
        Commands::Tick => {
            let mut supervisor = HealthSupervisor::new(ports, &config);
            let report = supervisor.run_pass().await?;
            println!("{report:#?}");
        }
        Commands::Watchdog => {
            let shutdown = install_interrupt_handler()?;
            let mut supervisor = HealthSupervisor::new(ports, &config);
            supervisor.run(shutdown).await;
        }
        Commands::ConnectWifi {
            ssid,
            password,
            open,
        } => {
            let secret = match (password, open) {
                (_, true) => None,
                (Some(password), false) => Some(password),
                (None, false) => {
                    let entered = rpassword::prompt_password(format!("Password for {ssid}: "))
                        .map_err(|e| GatewayError::Usage(format!("Could not read password: {e}")))?;
                    (!entered.is_empty()).then_some(entered)
                }
            };
            let creds = WifiCredentials { ssid, secret };
            let shutdown = install_interrupt_handler()?;
            let mut gateway = operator_gateway(ports, &config);
            let link = gateway.connect_wifi(&creds, &shutdown).await?;
            println!("upstream: {} ({})", link.iface, link.kind);
        }
        Commands::ConnectUpstream { iface } => {
            let shutdown = install_interrupt_handler()?;
            let mut gateway = operator_gateway(ports, &config);
            let link = gateway.connect_upstream(iface.as_deref(), &shutdown).await?;
            println!("upstream: {} ({})", link.iface, link.kind);
            println!("mode: {}", gateway.mode());
        }
        Commands::ConnectVpn => {
            let shutdown = install_interrupt_handler()?;
            let mut gateway = operator_gateway(ports, &config);
            let session = gateway.connect_vpn(&shutdown).await?;
            println!("vpn: connected via {} ({})", session.interface, session.hint);
            println!("mode: {}", gateway.mode());
        }
        Commands::Mode { mode } => {
            let mut gateway = operator_gateway(ports, &config);
            let mode = gateway.set_mode(mode.into()).await?;
            println!("mode: {mode}");
        }
        Commands::Status { .. } | Commands::Init { .. } => {}
    }

    Ok(())
}

type SystemGateway = Gateway<IptablesFilter, SystemdSupervisor, SystemLinks, SystemVpn>;
type SystemOverride = EmergencyOverride<IptablesFilter, SystemdSupervisor, SystemLinks, SystemVpn>;

fn emergency(ports: SystemPorts, config: &Config) -> SystemOverride {
    EmergencyOverride::new(ports, config)
}

fn operator_gateway(ports: SystemPorts, config: &Config) -> SystemGateway {
    Gateway::new(ports, config)
}

fn print_report(report: &RecoveryReport) {
    if let Some(disconnected) = report.vpn_disconnected {
        println!(
            "vpn:       {}",
            if disconnected { "disconnected" } else { "disconnect failed" }
        );
    }
    if report.firewall_reset {
        println!("firewall:  allow-all loaded");
    }
    for (service, up) in &report.services {
        println!("{service}: {}", if *up { "restarted" } else { "DOWN" });
    }
    if let Some(snapshot) = &report.status {
        println!();
        print!("{snapshot}");
    }
}
