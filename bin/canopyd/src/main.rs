// SPDX-License-Identifier: MIT

//! canopyd follows the Bitcoin header chain without trusting any single peer. It keeps a set of
//! connections to Electrum servers and P2P nodes, checks proof-of-work, linkage and checkpoints
//! on every header it gets, and cross-checks peers against each other before believing them.

mod cli;

use std::fs;
use std::io;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use canopy_node::Canopyd;
use canopy_node::Config;
use canopy_wire::address_man::Protocol;
use clap::Parser;
use cli::Cli;
use cli::Network;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// How long we wait for every task to wrap up before giving up on a clean shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    let params = Cli::parse();

    let data_dir = data_dir_path(params.data_dir.clone(), params.network);
    fs::create_dir_all(&data_dir).unwrap_or_else(|e| {
        eprintln!("Could not create data dir {data_dir:?}: {e}");
        exit(1);
    });

    let _log_guard = init_logging(&data_dir, params.log_to_file, params.debug).unwrap_or_else(|e| {
        eprintln!("Logging file couldn't be created at {data_dir:?}: {e}");
        exit(1);
    });

    let protocols = match (params.electrum_only, params.p2p_only) {
        (true, _) => vec![Protocol::Electrum],
        (_, true) => vec![Protocol::P2p],
        _ => vec![Protocol::Electrum, Protocol::P2p],
    };

    let mut config = Config::new(params.network.into(), data_dir);
    config.config_file = params.config_file;
    config.proxy = params.proxy;
    config.dns_seeds = !params.no_dns_seeds;
    config.connect = params.connect;
    config.protocols = protocols;
    config.connections = params.connections;
    config.memory_store = params.memory_store;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .max_blocking_threads(4)
        .thread_keep_alive(Duration::from_secs(60))
        .thread_name("canopyd")
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Could not start the async runtime: {e}");
            exit(1);
        });

    let signal = Arc::new(RwLock::new(false));
    let ctrl_c_signal = signal.clone();

    rt.spawn(async move {
        // Set once we get a Ctrl-C, the main loop below picks it up
        if tokio::signal::ctrl_c().await.is_ok() {
            *ctrl_c_signal.write().await = true;
        }
    });

    let canopyd = Canopyd::from(config);
    rt.block_on(async {
        canopyd.start().await.unwrap_or_else(|e| {
            eprintln!("Failed to start canopyd: {e}");
            exit(1);
        });

        loop {
            if canopyd.should_stop().await || *signal.read().await {
                info!("Stopping canopy");
                canopyd.stop().await;
                if timeout(SHUTDOWN_TIMEOUT, canopyd.wait_shutdown())
                    .await
                    .is_err()
                {
                    info!("some tasks didn't stop in time, exiting anyway");
                }
                break;
            }

            sleep(Duration::from_secs(1)).await;
        }
    });

    drop(canopyd);
    drop(rt);
}

fn data_dir_path(dir: Option<String>, network: Network) -> String {
    let mut base: PathBuf = dir
        .as_ref()
        .map(|s| s.trim_end_matches(['/', '\\']).into())
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".canopy")
        });

    match network {
        Network::Bitcoin => {}
        Network::Signet => base.push("signet"),
        Network::Testnet => base.push("testnet3"),
        Network::Regtest => base.push("regtest"),
    }

    base.to_string_lossy().into_owned()
}

/// Sends tracing events to stdout, and to `<data_dir>/debug.log` if asked to. Records from
/// the libraries, which use `log`, are picked up too.
fn init_logging(
    data_dir: &str,
    log_to_file: bool,
    debug: bool,
) -> Result<Option<WorkerGuard>, io::Error> {
    let log_level = if debug { "debug" } else { "info" };
    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if log_to_file {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(format!("{data_dir}/debug.log"))?;
    }

    let log_timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string());

    let fmt_layer_stdout = fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(IsTerminal::is_terminal(&io::stdout()))
        .with_timer(log_timer.clone())
        .with_target(true)
        .with_level(true)
        .with_filter(log_filter.clone());

    // Keep the guard alive, or buffered lines are lost on exit
    let mut guard = None;
    let fmt_layer_logfile = log_to_file.then(|| {
        let file_appender = tracing_appender::rolling::never(data_dir, "debug.log");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_timer(log_timer)
            .with_target(true)
            .with_level(true)
            .with_filter(log_filter.clone())
    });

    tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer_stdout)
        .with(fmt_layer_logfile)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_path() {
        let default_expected = dirs::home_dir()
            .unwrap_or(PathBuf::from("."))
            .join(".canopy");
        assert_eq!(
            data_dir_path(None, Network::Bitcoin),
            default_expected.display().to_string(),
        );

        assert_eq!(
            data_dir_path(Some("path/to/dir///".into()), Network::Bitcoin),
            "path/to/dir"
        );

        for (network, suffix) in [
            (Network::Testnet, "testnet3"),
            (Network::Signet, "signet"),
            (Network::Regtest, "regtest"),
        ] {
            let expected = PathBuf::from("path").join(suffix);
            assert_eq!(
                data_dir_path(Some("path/".into()), network),
                expected.display().to_string(),
            );
        }
    }
}
