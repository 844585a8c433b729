use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use twinwall::config::{self, Config};
use twinwall::dataplane::{Firewall, InterfaceId};
use twinwall::telemetry::init_logging;

/// Passes over the pipeline per wake-up before yielding to the event loop
const MAX_PASSES: usize = 16;

#[derive(Parser)]
#[command(name = "twinwall")]
#[command(about = "Two-interface firewall/router forwarding engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Routing table queries
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Run the firewall on the configured devices
    Run {
        /// Path to twinwall.toml
        #[arg(short, long, default_value = "twinwall.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate twinwall.toml
    Validate {
        #[arg(short, long, default_value = "twinwall.toml")]
        config: PathBuf,
    },
    /// Print the configuration with every default filled in
    Show {
        #[arg(short, long, default_value = "twinwall.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum RouteAction {
    /// Resolve the egress interface and next hop for an address
    Lookup {
        #[arg(short, long, default_value = "twinwall.toml")]
        config: PathBuf,
        /// Ingress interface (external or internal)
        #[arg(short, long, default_value = "internal", value_parser = parse_interface)]
        interface: InterfaceId,
        /// Destination address
        destination: Ipv4Addr,
    },
}

fn parse_interface(s: &str) -> Result<InterfaceId, String> {
    InterfaceId::ALL
        .into_iter()
        .find(|id| id.as_str() == s)
        .ok_or_else(|| format!("unknown interface '{}', expected external or internal", s))
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => {
            init_logging(None);
            match action {
                ConfigAction::Validate { config } => cmd_config_validate(&config),
                ConfigAction::Show { config } => cmd_config_show(&config),
            }
        }
        Commands::Route {
            action:
                RouteAction::Lookup {
                    config,
                    interface,
                    destination,
                },
        } => {
            init_logging(None);
            cmd_route_lookup(&config, interface, destination)
        }
        Commands::Run { config } => cmd_run(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

/// Load and validate, printing diagnostics
fn load_config(config_path: &PathBuf) -> Result<Config, String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }
    Ok(cfg)
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());
    load_config(config_path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_config_show(config_path: &PathBuf) -> Result<(), String> {
    let cfg = load_config(config_path)?;
    let rendered = config::render(&cfg).map_err(|e| format!("Failed to render config: {}", e))?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_route_lookup(
    config_path: &PathBuf,
    interface: InterfaceId,
    destination: Ipv4Addr,
) -> Result<(), String> {
    let cfg = load_config(config_path)?;
    let fw = Firewall::new(&cfg).map_err(|e| format!("Failed to build routing tables: {}", e))?;

    match fw.router(interface).routing().resolve(destination) {
        Some(hop) if hop.ip == destination => {
            println!("{} dev {} (connected)", destination, hop.interface);
        }
        Some(hop) => println!("{} via {} dev {}", destination, hop.ip, hop.interface),
        None => println!("{} unreachable from {}", destination, interface),
    }
    Ok(())
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;
    use tracing::{debug, error, warn};
    use twinwall::capture::{fill_checksums, AfPacketSocket};

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;
    init_logging(Some(&cfg.logging));

    info!("Loading {}...", config_path.display());
    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err("Validation failed".to_string());
    }

    let mut fw = Firewall::new(&cfg).map_err(|e| format!("Failed to start: {}", e))?;

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let mut sockets = Vec::with_capacity(2);
        for id in InterfaceId::ALL {
            let device = cfg
                .interface(id)
                .device
                .as_deref()
                .ok_or_else(|| format!("interfaces.{}: no device configured", id))?;
            info!("Binding {} to {}...", id, device);
            let socket = AfPacketSocket::bind(device).map_err(|e| {
                format!(
                    "Failed to bind to {}: {}. Run with root privileges.",
                    device, e
                )
            })?;
            sockets.push(socket);
        }

        let mut ext_buf = vec![0u8; cfg.limits.buffer_size];
        let mut int_buf = vec![0u8; cfg.limits.buffer_size];
        let mut arp_timer = tokio::time::interval(Duration::from_millis(cfg.limits.arp_tick_ms));
        let mut stats_timer = tokio::time::interval(Duration::from_secs(60));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Firewall started, processing packets...");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                _ = arp_timer.tick() => fw.tick(),
                _ = stats_timer.tick() => {
                    for (name, value) in fw.stats() {
                        debug!("{} = {}", name, value);
                    }
                }
                result = sockets[0].recv(&mut ext_buf) => match result {
                    Ok(len) => {
                        fw.receive(InterfaceId::External, &ext_buf[..len]);
                    }
                    Err(e) => error!("Receive error on {}: {}", InterfaceId::External, e),
                },
                result = sockets[1].recv(&mut int_buf) => match result {
                    Ok(len) => {
                        fw.receive(InterfaceId::Internal, &int_buf[..len]);
                    }
                    Err(e) => error!("Receive error on {}: {}", InterfaceId::Internal, e),
                },
            }

            for _ in 0..MAX_PASSES {
                fw.poll();
                for id in InterfaceId::ALL {
                    let socket = &sockets[id.index()];
                    fw.transmit(id, |frame| {
                        fill_checksums(frame);
                        socket.try_send(frame)
                    });
                }
                if !fw.needs_poll() {
                    break;
                }
            }
        }

        for (name, value) in fw.stats() {
            info!("{} = {}", name, value);
        }
        Ok::<(), String>(())
    })
}
