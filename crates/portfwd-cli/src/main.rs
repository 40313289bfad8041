//! portfwd - Manage Kubernetes port-forwards from the terminal

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use portfwd_cli::daemon::{self, StopOutcome};
use portfwd_cli::ipc::{IpcClient, IpcError};
use portfwd_cli::paths::{AppPaths, CONFIG_DIR_ENV};
use portfwd_cli::profiles::{ForwardSpec, Profile, ProfileConfig};
use portfwd_cli::protocol::{AddRequest, Command, ConnectionInfo, IpcResponse, StatusInfo};
use portfwd_cli::{foreground, output};
use portfwd_core::{ForwardManager, Inventory, TunnelTarget};
use portfwd_kube::{KubeInventory, KubePortForwarder};

/// Manage port-forwards to pods and services
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "Manage Kubernetes port-forwards", long_about = None)]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("PORTFWD_GIT_HASH"), "\nBuilt: ", env!("PORTFWD_BUILD_DATE")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write logs to debug.log in the config directory
    #[arg(long, global = true)]
    debug: bool,

    /// Directory for state, socket and logs
    #[arg(long, global = true, env = CONFIG_DIR_ENV)]
    config_dir: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,
}

/// Pod-or-service target flags shared by `forward`, `add` and `profile add`
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Namespace
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Pod name
    #[arg(short, long, conflicts_with = "service", required_unless_present = "service")]
    pod: Option<String>,

    /// Service name
    #[arg(short, long)]
    service: Option<String>,

    /// Local port
    #[arg(short, long)]
    local: u16,

    /// Remote port (defaults to the local port)
    #[arg(short, long)]
    remote: Option<u16>,
}

impl TargetArgs {
    fn forward_spec(&self) -> ForwardSpec {
        ForwardSpec {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            service: self.service.clone(),
            local_port: self.local,
            remote_port: self.remote.unwrap_or(self.local),
        }
    }

    fn target(&self) -> Result<TunnelTarget> {
        self.forward_spec()
            .target()
            .context("Exactly one of --pod or --service is required")
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Forward a port in the foreground until interrupted
    Forward(TargetArgs),
    /// List cluster resources
    #[command(alias = "ls")]
    List {
        #[command(subcommand)]
        resource: ListResource,
    },
    /// Add a forward to the running daemon
    Add(TargetArgs),
    /// Remove a stopped forward from the daemon
    #[command(alias = "rm")]
    Remove {
        /// Connection ID (namespace/kind/name:local->remote)
        id: String,
        /// Stop the forward first if it is running
        #[arg(short, long)]
        force: bool,
    },
    /// Stop a forward in the daemon
    Stop {
        /// Connection ID
        id: String,
    },
    /// Restart a stopped or failed forward in the daemon
    Reconnect {
        /// Connection ID
        id: String,
    },
    /// Show the daemon's connections
    #[command(alias = "ps")]
    Connections,
    /// Show daemon status and connections
    Status,
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Manage saved profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ListResource {
    /// List namespaces
    #[command(alias = "ns")]
    Namespaces,
    /// List pods with phase and ports
    Pods {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// List services with their ports
    #[command(alias = "svc")]
    Services {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in the current process instead of detaching
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop,
    /// Show whether the daemon is running
    Status,
}

#[derive(Subcommand, Debug)]
enum ProfileCommands {
    /// List profiles
    List,
    /// Show a profile's forwards
    Show { name: String },
    /// Run every forward of a profile in the foreground
    Start { name: String },
    /// Delete a profile
    Delete { name: String },
    /// Add a forward to a profile, creating it if needed
    Add {
        name: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Profile description
        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::resolve(cli.config_dir.clone())?;

    init_logging(&cli.log_level, cli.debug.then(|| paths.debug_log()))?;
    debug!(dir = %paths.dir().display(), "Using config directory");

    match cli.command {
        Commands::Forward(args) => handle_forward(&cli.context, args).await,
        Commands::List { resource } => handle_list(&cli.context, resource).await,
        Commands::Add(args) => handle_add(&paths, args).await,
        Commands::Remove { id, force } => handle_remove(&paths, id, force).await,
        Commands::Stop { id } => {
            let response = send(&paths, Command::Stop { id }).await?;
            println!("{}", response.message.unwrap_or_default());
            Ok(())
        }
        Commands::Reconnect { id } => handle_reconnect(&paths, id).await,
        Commands::Connections => {
            let response = send(&paths, Command::List).await?;
            let connections: Vec<ConnectionInfo> = response.data_as()?;
            output::print_connection_table(&connections);
            Ok(())
        }
        Commands::Status => handle_status(&paths).await,
        Commands::Daemon { command } => {
            handle_daemon(&paths, &cli.context, &cli.log_level, cli.debug, command).await
        }
        Commands::Profile { command } => handle_profile(&paths, &cli.context, command).await,
    }
}

fn init_logging(log_level: &str, debug_file: Option<PathBuf>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    let file_layer = match debug_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open debug log {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(file_layer)
        .init();

    Ok(())
}

async fn kube_manager(context: &Option<String>) -> Result<ForwardManager> {
    let client = portfwd_kube::connect(context.as_deref())
        .await
        .context("Failed to connect to the cluster")?;
    Ok(ForwardManager::new(
        Arc::new(KubeInventory::new(client.clone())),
        Arc::new(KubePortForwarder::new(client)),
    ))
}

/// Send one command and turn a failed response into an error
async fn send(paths: &AppPaths, command: Command) -> Result<IpcResponse> {
    let mut client = match IpcClient::connect(&paths.socket_path()).await {
        Ok(client) => client,
        Err(e @ IpcError::NotConnected { .. }) => {
            return Err(e).context("Daemon is not running; start it with `portfwd daemon start`");
        }
        Err(e) => return Err(e.into()),
    };
    let response = client.send(&command).await?;
    if !response.success {
        anyhow::bail!(response
            .error
            .unwrap_or_else(|| format!("{} failed", command.name())));
    }
    Ok(response)
}

async fn handle_forward(context: &Option<String>, args: TargetArgs) -> Result<()> {
    let target = args.target()?;
    let manager = kube_manager(context).await?;

    let outcome = foreground::start_all(&manager, vec![target]).await;
    if let Some(Err(e)) = outcome.into_iter().next().map(|o| o.result) {
        return Err(e.into());
    }

    foreground::print_transitions(&manager);
    foreground::run_until_interrupted(&manager).await;
    Ok(())
}

async fn handle_list(context: &Option<String>, resource: ListResource) -> Result<()> {
    let client = portfwd_kube::connect(context.as_deref())
        .await
        .context("Failed to connect to the cluster")?;
    let inventory = KubeInventory::new(client);

    match resource {
        ListResource::Namespaces => {
            for ns in inventory.list_namespaces().await? {
                println!("{}", ns);
            }
        }
        ListResource::Pods { namespace } => {
            let pods = inventory.list_pods(&namespace).await?;
            if pods.is_empty() {
                println!("No pods in namespace '{}'.", namespace);
            }
            println!("{:<48} {:<10} PORTS", "NAME", "PHASE");
            for pod in pods {
                let ports: Vec<String> = pod
                    .ports
                    .iter()
                    .map(|p| match &p.name {
                        Some(name) => format!("{}/{}({})", p.port, p.protocol, name),
                        None => format!("{}/{}", p.port, p.protocol),
                    })
                    .collect();
                println!("{:<48} {:<10} {}", pod.name, pod.phase, ports.join(", "));
            }
        }
        ListResource::Services { namespace } => {
            let services = inventory.list_services(&namespace).await?;
            if services.is_empty() {
                println!("No services in namespace '{}'.", namespace);
            }
            println!("{:<40} {:<14} PORTS", "NAME", "TYPE");
            for svc in services {
                let ports: Vec<String> = svc
                    .ports
                    .iter()
                    .map(|p| {
                        let target = p
                            .target_port
                            .as_ref()
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| p.port.to_string());
                        format!("{}→{}/{}", p.port, target, p.protocol)
                    })
                    .collect();
                println!("{:<40} {:<14} {}", svc.name, svc.service_type, ports.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_add(paths: &AppPaths, args: TargetArgs) -> Result<()> {
    let target = args.target()?;
    let response = send(paths, Command::Add(AddRequest::from(&target))).await?;
    let info: ConnectionInfo = response.data_as()?;
    println!("✅ {} ({})", info.id, info.status);
    Ok(())
}

async fn handle_remove(paths: &AppPaths, id: String, force: bool) -> Result<()> {
    if force {
        send(paths, Command::Stop { id: id.clone() }).await?;
    }
    let response = send(paths, Command::Remove { id }).await?;
    println!("{}", response.message.unwrap_or_default());
    Ok(())
}

async fn handle_reconnect(paths: &AppPaths, id: String) -> Result<()> {
    let target: TunnelTarget = id.parse()?;
    let response = send(paths, Command::Add(AddRequest::from(&target))).await?;
    let info: ConnectionInfo = response.data_as()?;
    println!("✅ Reconnected {} ({})", info.id, info.status);
    Ok(())
}

async fn handle_status(paths: &AppPaths) -> Result<()> {
    let response = send(paths, Command::Status).await?;
    let status: StatusInfo = response.data_as()?;
    println!("Daemon running (pid {}, up {})", status.pid, status.uptime);
    println!();
    output::print_connection_table(&status.connections);
    Ok(())
}

async fn handle_daemon(
    paths: &AppPaths,
    context: &Option<String>,
    log_level: &str,
    debug: bool,
    command: DaemonCommands,
) -> Result<()> {
    match command {
        DaemonCommands::Start { foreground: true } => {
            let manager = kube_manager(context).await?;
            daemon::run(paths, manager).await
        }
        DaemonCommands::Start { foreground: false } => {
            let mut extra = vec!["--log-level".to_string(), log_level.to_string()];
            if debug {
                extra.push("--debug".to_string());
            }
            if let Some(context) = context {
                extra.push("--context".to_string());
                extra.push(context.clone());
            }
            let pid = daemon::start_background(paths, &extra).await?;
            println!("✅ Daemon started (pid {})", pid);
            println!("   Logs: {}", paths.daemon_log().display());
            Ok(())
        }
        DaemonCommands::Stop => {
            match daemon::stop_daemon(paths).await? {
                StopOutcome::Requested => println!("✅ Daemon stopping"),
                StopOutcome::Signalled(pid) => println!("✅ Sent SIGTERM to daemon (pid {})", pid),
                StopOutcome::NotRunning => println!("Daemon is not running"),
            }
            Ok(())
        }
        DaemonCommands::Status => {
            let mut client = match IpcClient::connect(&paths.socket_path()).await {
                Ok(client) => client,
                Err(_) => {
                    daemon::cleanup_stale(paths);
                    println!("Daemon is not running");
                    return Ok(());
                }
            };
            let status: StatusInfo = client.send(&Command::Status).await?.data_as()?;
            println!("Daemon running");
            println!("  PID:         {}", status.pid);
            println!("  Uptime:      {}", status.uptime);
            println!("  Connections: {}", status.connections.len());
            Ok(())
        }
    }
}

async fn handle_profile(
    paths: &AppPaths,
    context: &Option<String>,
    command: ProfileCommands,
) -> Result<()> {
    let path = paths.config_file();
    let mut config = ProfileConfig::load(&path)?;

    match command {
        ProfileCommands::List => {
            if config.profiles.is_empty() {
                println!("No profiles. Create one with `portfwd profile add`.");
            }
            for profile in &config.profiles {
                let description = profile.description.as_deref().unwrap_or("");
                println!(
                    "{:<20} {:>2} forward(s)  {}",
                    profile.name,
                    profile.forwards.len(),
                    description
                );
            }
        }
        ProfileCommands::Show { name } => {
            let profile = config
                .get(&name)
                .with_context(|| format!("Profile '{}' not found", name))?;
            println!("{}", profile.name);
            if let Some(description) = &profile.description {
                println!("  {}", description);
            }
            for forward in &profile.forwards {
                match forward.target() {
                    Some(target) => println!("  {}", target.identity()),
                    None => println!("  (invalid forward in {})", forward.namespace),
                }
            }
        }
        ProfileCommands::Start { name } => {
            config.validate()?;
            let profile = config
                .get(&name)
                .with_context(|| format!("Profile '{}' not found", name))?;
            let targets: Vec<TunnelTarget> =
                profile.forwards.iter().filter_map(ForwardSpec::target).collect();

            let manager = kube_manager(context).await?;
            let outcomes = foreground::start_all(&manager, targets).await;
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            if failed == outcomes.len() {
                anyhow::bail!("No forward in profile '{}' could be started", name);
            }
            if failed > 0 {
                println!("⚠️  {} of {} forward(s) failed", failed, outcomes.len());
            }

            foreground::print_transitions(&manager);
            foreground::run_until_interrupted(&manager).await;
        }
        ProfileCommands::Delete { name } => {
            config.delete(&name)?;
            config.save(&path)?;
            println!("✅ Deleted profile '{}'", name);
        }
        ProfileCommands::Add {
            name,
            target,
            description,
        } => {
            let spec = target.forward_spec();
            let mut profile = config.get(&name).cloned().unwrap_or(Profile {
                name: name.clone(),
                description: None,
                forwards: Vec::new(),
            });
            if description.is_some() {
                profile.description = description;
            }
            profile.forwards.push(spec);
            config.upsert(profile);
            config.validate()?;
            config.save(&path)?;
            println!("✅ Added forward to profile '{}'", name);
        }
    }
    Ok(())
}
