use clap::{Parser, Subcommand};
use ghostpass_config::GhostPassConfig;
use ghostpass_node::run_node;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "ghostpass-node", about = "Fair ticket sale commitment service")]
struct Cli {
    /// Path to a TOML config file; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service (default).
    Run,
    /// Print an example configuration file.
    PrintConfig,
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_env("GHOSTPASS_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::PrintConfig => match toml::to_string_pretty(&GhostPassConfig::example()) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!("could not render example config: {err}");
                std::process::exit(1);
            }
        },
        Command::Run => {
            let path = cli
                .config
                .or_else(|| std::env::var("GHOSTPASS_CONFIG").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("config/ghostpass.toml"));
            let cfg = match GhostPassConfig::load(Some(&path)) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!("invalid configuration: {err:#}");
                    std::process::exit(1);
                }
            };
            if let Err(err) = run_node(cfg).await {
                error!("node failed: {err:#}");
                std::process::exit(1);
            }
        }
    }
}
