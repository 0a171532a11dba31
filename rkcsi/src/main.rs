//! `rkcsi`: the RK8s CSI plugin process.
//!
//! `rkcsi serve` runs the Identity, Controller and Node services on one
//! endpoint until SIGINT or SIGTERM; `rkcsi probe` checks a running plugin.

mod config;

use anyhow::Context;
use clap::Parser;
use libcsi::Driver;
use libcsi::proto::{GetPluginInfoRequest, ProbeRequest};
use libcsi::transport::{CsiClient, Endpoint};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{Cli, Command, ServeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe { endpoint } => probe(&endpoint).await,
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)
            .with_context(|| format!("invalid log level {:?}", cli.log_level))?
            .add_directive("h2=warn".parse()?)
            .add_directive("hyper=warn".parse()?)
            .add_directive("tower=warn".parse()?),
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let driver = Driver::new(args.driver_options()).context("invalid driver configuration")?;
    let backends = args.backends(&driver).await?;

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                info!("received SIGINT");
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    };

    driver
        .run(backends, shutdown)
        .await
        .context("CSI server failed")?;
    info!("rkcsi exited");
    Ok(())
}

async fn probe(endpoint: &str) -> anyhow::Result<()> {
    let endpoint: Endpoint = endpoint.parse()?;
    let mut client = CsiClient::connect(&endpoint)
        .await
        .with_context(|| format!("connect to {endpoint}"))?;

    let info = client
        .identity
        .get_plugin_info(GetPluginInfoRequest::default())
        .await
        .context("GetPluginInfo")?
        .into_inner();
    let ready = client
        .identity
        .probe(ProbeRequest::default())
        .await
        .context("Probe")?
        .into_inner()
        .ready
        .unwrap_or(false);

    println!("{} {} ready={ready}", info.name, info.vendor_version);
    if !ready {
        anyhow::bail!("plugin at {endpoint} is not ready");
    }
    Ok(())
}
