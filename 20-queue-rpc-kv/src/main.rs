use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use queue_rpc_kv::{
    broker::Broker,
    bus::SERVER_QUEUE,
    cli::{BrokerArgs, Cli, ClientArgs, Mode, ServerArgs},
    client::RpcClient,
    remote::{BrokerServer, RemoteBus},
    server::RpcServer,
};

/// Logs go to stdout, except in client mode where stdout carries the reply.
/// With a log file, warnings and errors are appended there as well.
fn init_tracing(log_file: Option<&Path>, to_stderr: bool) -> Result<()> {
    use tracing_subscriber::{
        EnvFilter, filter::LevelFilter, fmt, fmt::writer::BoxMakeWriter, prelude::*,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_writer = if to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console = fmt::layer().with_target(false).with_writer(console_writer);

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::WARN),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.mode {
        Mode::Broker(args) => {
            init_tracing(None, false)?;
            run_broker(args).await
        }
        Mode::Server(args) => {
            init_tracing(args.log_file.as_deref(), false)?;
            run_server(args).await
        }
        Mode::Client(args) => {
            init_tracing(None, true)?;
            run_client(args).await
        }
    }
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = BrokerServer::new(listener, Broker::new());
    let addr = server.local_addr()?;
    info!("broker listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("broker exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let bus = RemoteBus::connect(args.broker).await?;
    let server = RpcServer::start(bus, args.config()).await?;
    info!("server consuming '{}' via {}", SERVER_QUEUE, args.broker);
    server.run_until_ctrl_c().await
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let command = args.to_command()?;
    let bus = RemoteBus::connect(args.broker).await?;
    let client = RpcClient::with_config(bus, args.config());

    match client.call(command).await? {
        Some(reply) => {
            let rendered = reply.render();
            if !rendered.is_empty() {
                println!("{rendered}");
            }
            Ok(())
        }
        None => bail!("no reply received"),
    }
}
