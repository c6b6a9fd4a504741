mod api;
mod cache;
mod cli;
mod config;
mod db;
mod models;
mod services;
mod utils;

use clap::{Parser, Subcommand};
use config::Config;

#[derive(Parser)]
#[command(name = "fairline")]
#[command(about = "Fair-odds and expected-value analysis for sportsbook markets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Run one fetch-analyse-persist cycle and exit
    Fetch {
        #[arg(short, long)]
        sport: Option<String>,
    },
    /// Print the current ranked opportunity list
    Analyze,
    /// Initialize the database
    InitDb,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting Fairline API server on port {}", port);
            api::serve(config, port).await
        }
        Some(Commands::Fetch { sport }) => cli::fetch_once(&config, sport.as_deref()).await,
        Some(Commands::Analyze) => cli::analyze(&config).await,
        Some(Commands::InitDb) => cli::init_db(&config).await,
        None => {
            // Default to serving
            tracing::info!("Starting Fairline API server on port 3000");
            api::serve(config, 3000).await
        }
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(2);
    }
}
