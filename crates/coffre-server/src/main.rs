mod error;
mod handlers;
mod state;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use coffre_core::storage::{self, store_config_from_location, Store};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "coffre-server", version, about = "coffre storage server")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9876")]
    listen: String,

    /// Store location to serve (e.g. "fs:///var/lib/coffre/repo")
    #[arg(short = 's', long)]
    store: String,

    /// Reject DELETE operations
    #[arg(long, default_value_t = false)]
    no_delete: bool,

    /// Log output format: "json" or "pretty"
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to build tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async_main(cli));
}

async fn async_main(cli: Cli) {
    match cli.log_format.as_str() {
        "json" => tracing_subscriber::fmt().json().init(),
        _ => tracing_subscriber::fmt().init(),
    }

    let store_config = store_config_from_location(&cli.store);
    let store = match storage::backend_for(&store_config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: cannot open store '{}': {e}", cli.store);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.open() {
        eprintln!("Error: '{}' is not a repository: {e}", cli.store);
        std::process::exit(1);
    }

    // This layer carries no authentication; access control belongs to
    // the deployment (reverse proxy, mTLS, network partitioning).
    if !cli.listen.starts_with("127.") && !cli.listen.starts_with("localhost") {
        warn!(
            listen = %cli.listen,
            "serving without authentication on a non-loopback address"
        );
    }

    let state = AppState::new(store, cli.no_delete);
    let app = handlers::router(state);

    info!("coffre-server listening on {}", cli.listen);
    let listener = TcpListener::bind(&cli.listen).await.unwrap_or_else(|e| {
        eprintln!("Error: cannot bind to {}: {e}", cli.listen);
        std::process::exit(1);
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
    info!("coffre-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
