use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "cutover",
    about = "cutover — blue/green deployments with automatic rollback",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to cutover.toml.
    #[arg(long, global = true, default_value = "cutover.toml")]
    config: PathBuf,
    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a cutover.toml scaffold with one local environment.
    Init {
        #[arg(default_value = "prod")]
        environment: String,
        /// Port the application listens on.
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Deploy a revision to an environment.
    ///
    /// REVISION is a path to a .toml or .json revision spec, or an image
    /// reference combined with the environment's [defaults].
    Deploy {
        environment: String,
        revision: String,
    },
    /// Restore the environment's rollback target.
    Rollback { environment: String },
    /// Show the deployment record and traffic split.
    Status { environment: String },
    /// List deployment reports, newest first.
    History {
        environment: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Serve the REST API.
    Serve {
        #[arg(short, long, default_value = "8443")]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cutover=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { environment, port } => {
            commands::init::init(&cli.config, &environment, port).map(|()| 0)
        }
        Commands::Deploy {
            environment,
            revision,
        } => commands::deploy::deploy(&cli.config, &environment, &revision, cli.json).await,
        Commands::Rollback { environment } => {
            commands::deploy::rollback(&cli.config, &environment, cli.json).await
        }
        Commands::Status { environment } => {
            commands::status::status(&cli.config, &environment, cli.json).await
        }
        Commands::History { environment, limit } => {
            commands::status::history(&cli.config, &environment, limit, cli.json)
        }
        Commands::Serve { port, bind } => {
            commands::serve::serve(&cli.config, &bind, port).await.map(|()| 0)
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            commands::exit_code(&e)
        }
    };
    std::process::exit(code);
}
