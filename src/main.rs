use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vpnctl::connection::{Connection, ConnectionError};
use vpnctl::daemon::DaemonError;
use vpnctl::selector::{Node, SelectionMode};
use vpnctl::settings::Settings;
use vpnctl::storage::{config_dir, JsonFile};

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "VPN connection orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an exit node
    Connect {
        /// Pick the node with the lowest measured latency
        #[arg(long, conflicts_with = "random")]
        best: bool,

        /// Pick a random reachable node
        #[arg(long)]
        random: bool,

        /// Node list file (defaults to nodes.json in the config directory)
        #[arg(long)]
        nodes: Option<PathBuf>,
    },
    /// Disconnect and tear down the tunnel
    Disconnect {
        /// Tear down without checking the connection status first
        #[arg(long)]
        force: bool,
    },
    /// Show the current connection status
    Status,
    /// Generate a default settings file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Connect {
            best,
            random,
            nodes,
        } => {
            let mode = if best {
                SelectionMode::Best
            } else if random {
                SelectionMode::Random
            } else {
                SelectionMode::Menu
            };
            if let Err(e) = run_connect(mode, nodes).await {
                report_error(&e);
                std::process::exit(1);
            }
        }
        Commands::Disconnect { force } => {
            if let Err(e) = run_disconnect(force).await {
                report_error(&e);
                std::process::exit(1);
            }
        }
        Commands::Status => {
            if let Err(e) = run_status().await {
                report_error(&e);
                std::process::exit(1);
            }
        }
        Commands::Init => {
            let settings = Settings::default();
            settings.save()?;
            println!("Created default settings: {}", Settings::path()?.display());
        }
    }

    Ok(())
}

/// Node list produced by the account tooling, JSON, one object per node.
fn load_nodes(path: Option<PathBuf>) -> Result<Vec<Node>, Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path,
        None => config_dir()?.join("nodes.json"),
    };
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Could not read node list {}: {}", path.display(), e))?;
    let nodes: Vec<Node> = serde_json::from_str(&content)
        .map_err(|e| format!("Could not parse node list {}: {}", path.display(), e))?;
    Ok(nodes)
}

async fn run_connect(
    mode: SelectionMode,
    nodes_path: Option<PathBuf>,
) -> Result<(), ConnectionError> {
    let nodes = match load_nodes(nodes_path) {
        Ok(nodes) => nodes,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut connection = Connection::open()?;

    let interrupted = {
        let start = connection.start(nodes, mode);
        tokio::pin!(start);
        tokio::select! {
            result = &mut start => {
                result?;
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        }
    };

    if interrupted {
        info!("Interrupted, ending the session properly...");
        // Keep retrying: another Ctrl-C must not leave a half-provisioned
        // tunnel behind.
        while let Err(e) = connection.stop().await {
            if matches!(e, ConnectionError::Daemon(DaemonError::Unreachable { .. })) {
                report_error(&e);
                std::process::exit(1);
            }
            warn!("Cleanup failed, retrying: {}", e);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        println!("Disconnected");
        return Ok(());
    }

    match connection.status().await {
        Ok(report) if report.is_active() => println!("Connected"),
        Ok(_) => println!("Not connected"),
        Err(e) => warn!("Could not verify connection status: {}", e),
    }
    Ok(())
}

async fn run_disconnect(force: bool) -> Result<(), ConnectionError> {
    let mut connection = Connection::open()?;
    if force || connection.is_active().await? {
        connection.stop().await?;
    }
    println!("Disconnected");
    Ok(())
}

async fn run_status() -> Result<(), ConnectionError> {
    let connection = Connection::open()?;
    let report = connection.status().await?;

    if report.is_active() {
        println!("Status: Connected");
        println!("  Services active:    {}", report.service_active);
        println!("  Interface address:  {}", report.iface_addr_present);
        println!("  Interface up:       {}", report.iface_up);
        println!("  Default route:      {}", report.default_route);
        println!("  DNS rule installed: {}", report.dns_rule);
        println!("  Exit address match: {}", report.exit_address_match);
        if let Some(node) = connection.session().node_address {
            println!("  Exit node:          {}", node);
        }
    } else {
        println!("Status: Not connected");
    }
    Ok(())
}

fn report_error(e: &ConnectionError) {
    if let ConnectionError::Daemon(DaemonError::Unreachable { .. }) = e {
        eprintln!("Is the vpnctl daemon running?");
        eprintln!("Check it with 'systemctl status vpnctld'");
    }
    error!("{}", e);
}
