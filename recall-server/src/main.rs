use clap::Parser;
use recall_core::RecallConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use recall_server::{server, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "recall.toml", env = "RECALL_CONFIG")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match RecallConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over [service] log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let state = match AppState::from_config(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start Recall: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match state.repo.health().await {
            Ok(v) => println!("✅ Store connected: {}", v),
            Err(e) => {
                println!("❌ Store check failed: {}", e);
                std::process::exit(1);
            }
        }

        match state.repo.count().await {
            Ok(n) => println!("✅ Collection '{}': {} sessions", state.repo.collection(), n),
            Err(e) => {
                println!("❌ Collection count failed: {}", e);
                std::process::exit(1);
            }
        }

        println!(
            "✅ Embedding backend: {} ({} dims)",
            state.repo.embedder_name(),
            state.repo.dimensions()
        );
        println!("✅ Recall health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if state.config.http.enabled {
        let http_state = state.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = recall_server::http::start_http_server(http_state, http_shutdown).await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = shellexpand::tilde(&state.config.service.socket_path).into_owned();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    Ok(())
}
