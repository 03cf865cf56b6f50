//! courier - controller / runner binary
//!
//! ```text
//! courier controller --listen 127.0.0.1:8080 --http 127.0.0.1:8081
//! courier runner --connect 127.0.0.1:8080
//! ```

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use courier_core::app::Runner;
use courier_core::impls::{RouteExecutor, TcpAcceptor, TcpConnector, WsAcceptor, WsConnector};
use courier_core::ports::{Acceptor, Channel, Connector};
use courier_core::{ControllerBuilder, ControllerConfig};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Dispatch tasks to remote workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept workers and dispatch tasks to them.
    Controller {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        #[arg(long, value_enum, default_value_t = TransportKind::Tcp)]
        transport: TransportKind,
        /// TOML controller config.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Serve `POST /send-task` and `GET /status` on this address.
        #[arg(long)]
        http: Option<String>,
    },
    /// Connect to a controller and execute the demo routes.
    Runner {
        #[arg(long, default_value = "127.0.0.1:8080")]
        connect: String,
        #[arg(long, value_enum, default_value_t = TransportKind::Tcp)]
        transport: TransportKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Tcp,
    Ws,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Controller {
            listen,
            transport,
            config,
            http,
        } => run_controller(listen, transport, config, http).await,
        Command::Runner { connect, transport } => run_runner(connect, transport).await,
    }
}

async fn run_controller(
    listen: String,
    transport: TransportKind,
    config: Option<PathBuf>,
    http: Option<String>,
) -> Result<()> {
    let config = match config {
        Some(path) => {
            let config = ControllerConfig::load(&path)?;
            info!(path = %path.display(), "loaded configuration");
            config
        }
        None => ControllerConfig::default(),
    };
    let controller = Arc::new(ControllerBuilder::new().config(config).build()?);

    let acceptor: Box<dyn Acceptor> = match transport {
        TransportKind::Tcp => Box::new(TcpAcceptor::bind(&listen).await?),
        TransportKind::Ws => Box::new(WsAcceptor::bind(&listen).await?),
    };
    info!(address = %listen, transport = ?transport, "accepting workers");
    controller.start().await;

    let serving = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.serve(acceptor.as_ref()).await })
    };

    let http_server = match http {
        Some(address) => {
            let listener = tokio::net::TcpListener::bind(&address).await?;
            info!(address = %address, "http endpoint listening");
            let app = http::router(Arc::clone(&controller));
            let mut signal = controller.shutdown_signal();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = signal.wait_for(|stopping| *stopping).await;
                    })
                    .await
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c");
    controller.shutdown().await;

    serving.await??;
    if let Some(server) = http_server {
        server.await??;
    }
    Ok(())
}

async fn run_runner(address: String, transport: TransportKind) -> Result<()> {
    let channel: Arc<dyn Channel> = match transport {
        TransportKind::Tcp => Arc::from(TcpConnector.connect(&address).await?),
        TransportKind::Ws => Arc::from(WsConnector.connect(&address).await?),
    };
    info!(address = %address, transport = ?transport, "connected to controller");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    });

    let runner = Runner::new(channel, Arc::new(RouteExecutor::demo()));
    let answered = runner.run(shutdown_rx).await?;
    info!(answered, "runner stopped");
    Ok(())
}
