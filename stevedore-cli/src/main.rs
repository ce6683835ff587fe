mod context;
mod ops;

use clap::{Parser, Subcommand};
use ops::{
    install_service, list_services, list_versions, logs_service, override_service, parse_input,
    reset_parameter, restart_service, run_command, set_mode, set_parameter, show_service,
    start_service, status_service, stop_all_services, stop_service, use_version, OutputFormat,
    OverrideTarget,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run and configure the services described in a local service document.
#[derive(Parser)]
#[command(
    name = "stevedore",
    author,
    version,
    about = "Declarative service orchestration for containers and native processes"
)]
struct Cli {
    /// Data directory holding services.json and per-service files
    #[arg(long, env = "SD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Container engine CLI (overrides the document's default)
    #[arg(long, env = "SD_ENGINE")]
    engine: Option<String>,

    /// Token for GitHub release and package discovery
    #[arg(long, env = "SD_GITHUB_TOKEN")]
    github_token: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ==================== 服务 ====================
    /// List services
    List,
    /// Show effective configuration and status
    Show { id: String },
    /// Show status
    Status { id: String },
    /// Start a service
    Start { id: String },
    /// Stop a service
    Stop { id: String },
    /// Restart a service
    Restart { id: String },
    /// Stop every running service
    StopAll,
    /// Show logs (tail)
    Logs {
        id: String,
        #[arg(long, default_value_t = 200)]
        tail: usize,
        /// 持续跟随
        #[arg(long, short, default_value_t = false)]
        follow: bool,
    },

    // ==================== 版本 ====================
    /// List selectable versions
    Versions { id: String },
    /// Select a version (or --reset to the declared default)
    UseVersion {
        id: String,
        version: Option<String>,
        #[arg(long, conflicts_with = "version")]
        reset: bool,
    },
    /// Download and install a release binary
    Install {
        id: String,
        /// 版本号；缺省为当前选中的版本
        version: Option<String>,
    },

    // ==================== 配置 ====================
    /// Set a parameter value
    Set { id: String, name: String, value: String },
    /// Reset a parameter to its default
    Unset { id: String, name: String },
    /// Override names, network, ports, volumes or environment
    #[command(subcommand)]
    Override(OverrideCommands),
    /// Switch execution mode (container | process)
    Mode { id: String, mode: String },

    // ==================== 自定义命令 ====================
    /// Run a custom command inside the running service
    Run {
        id: String,
        command: String,
        /// 输入值 key=value，可重复
        #[arg(short = 'i', long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },
}

/// Omitting the value resets the override.
#[derive(Subcommand)]
enum OverrideCommands {
    /// Instance name
    Name { id: String, value: Option<String> },
    /// Container network
    Network { id: String, value: Option<String> },
    /// Host port for a container port
    Port {
        id: String,
        container_port: u16,
        host_port: Option<u16>,
    },
    /// Host path for a container path
    Volume {
        id: String,
        container_path: String,
        host_path: Option<String>,
    },
    /// Environment variable value
    Env {
        id: String,
        name: String,
        value: Option<String>,
    },
}

impl OverrideCommands {
    fn into_target(self) -> (String, OverrideTarget) {
        match self {
            Self::Name { id, value } => (id, OverrideTarget::Name(value)),
            Self::Network { id, value } => (id, OverrideTarget::Network(value)),
            Self::Port {
                id,
                container_port,
                host_port,
            } => (id, OverrideTarget::Port { container_port, host_port }),
            Self::Volume {
                id,
                container_path,
                host_path,
            } => (id, OverrideTarget::Volume { container_path, host_path }),
            Self::Env { id, name, value } => (id, OverrideTarget::Env { name, value }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载 .env 文件（如果存在），忽略错误
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(context::default_data_dir);
    let token = cli
        .github_token
        .or_else(|| std::env::var("GITHUB_TOKEN").ok())
        .filter(|t| !t.is_empty());
    let orch = context::build(&data_dir, cli.engine, token).await?;
    let output = cli.output;

    match cli.command {
        Commands::List => list_services(&orch, output).await?,
        Commands::Show { id } => show_service(&orch, &id, output).await?,
        Commands::Status { id } => status_service(&orch, &id, output).await?,
        Commands::Start { id } => start_service(&orch, &id, output).await?,
        Commands::Stop { id } => stop_service(&orch, &id, output).await?,
        Commands::Restart { id } => restart_service(&orch, &id, output).await?,
        Commands::StopAll => stop_all_services(&orch, output).await?,
        Commands::Logs { id, tail, follow } => logs_service(&orch, &id, tail, follow, output).await?,

        Commands::Versions { id } => list_versions(&orch, &id, output).await?,
        Commands::UseVersion { id, version, reset } => {
            use_version(&orch, &id, version.as_deref(), reset, output).await?
        }
        Commands::Install { id, version } => {
            install_service(&orch, &id, version.as_deref(), output).await?
        }

        Commands::Set { id, name, value } => set_parameter(&orch, &id, &name, &value, output).await?,
        Commands::Unset { id, name } => reset_parameter(&orch, &id, &name, output).await?,
        Commands::Override(cmd) => {
            let (id, target) = cmd.into_target();
            override_service(&orch, &id, target, output).await?
        }
        Commands::Mode { id, mode } => set_mode(&orch, &id, &mode, output).await?,

        Commands::Run { id, command, inputs } => {
            run_command(&orch, &id, &command, inputs, output).await?
        }
    }

    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
