//! Pulse: a Bitcoin SV block-header tracking node.

mod config;
mod p2p;

use std::process::ExitCode;
use std::sync::Arc;

use pulse_chain::{BroadcastSink, ChainEvent, ChainOptions, ChainService};
use pulse_consensus::params::network_params;
use pulse_log::LogConfig;
use pulse_primitives::BlockHeader;
use pulse_store::{HeaderStore, SqliteHeaderStore};
use tokio::sync::watch;

use crate::config::{parse_args, AppConfig, CliAction, USAGE};
use crate::p2p::coordinator::SyncCoordinator;
use crate::p2p::peer_book::PeerBook;

fn main() -> ExitCode {
    let config = match parse_args() {
        Ok(CliAction::Help) => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Ok(CliAction::Run(config)) => *config,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!();
            eprint!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    pulse_log::init(LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: true,
    });

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            pulse_log::log_error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: AppConfig) -> Result<(), String> {
    let params = network_params(config.network);
    pulse_log::log_info!(
        "starting pulse on {} (genesis {})",
        params.network.as_str(),
        params.genesis_hash
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let store = SqliteHeaderStore::open(&config.db_path).map_err(|err| err.to_string())?;
    store.migrate().map_err(|err| err.to_string())?;

    let sink = Arc::new(BroadcastSink::new(1024));
    let chain = Arc::new(
        ChainService::new(store, params.clone(), ChainOptions {
            blocks_for_fork_confirmation: config.blocks_for_fork_confirmation,
            max_block_height_excess: config.max_block_height_excess,
            ..ChainOptions::default()
        })
        .with_sink(sink.clone()),
    );

    // An empty store bootstraps from the pinned genesis header.
    if chain.tip().map_err(|err| err.to_string())?.is_none() {
        chain
            .accept_header(BlockHeader::genesis(&params))
            .map_err(|err| err.to_string())?;
    }
    let tip = chain
        .tip()
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "store has no tip after genesis bootstrap".to_string())?;
    pulse_log::log_info!("chain tip at height {} ({})", tip.height, tip.hash);

    let book = Arc::new(PeerBook::new());
    match book.load(&config.banlist_path) {
        Ok(count) if count > 0 => {
            pulse_log::log_info!("loaded {count} banned peers");
        }
        Ok(_) => {}
        Err(err) => pulse_log::log_warn!("banlist not loaded: {err}"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| err.to_string())?;

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Event log: the in-process stand-in for webhook/WebSocket sinks.
        let mut events = sink.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ChainEvent::TipChanged { hash, height } => {
                        pulse_log::log_info!("tip -> {height} ({hash})");
                    }
                    ChainEvent::Reorg {
                        from,
                        to,
                        common,
                        depth,
                    } => {
                        pulse_log::log_warn!(
                            "reorg depth {depth}: {from} -> {to} (fork {common})"
                        );
                    }
                    ChainEvent::HeaderAdded { .. } => {}
                }
            }
        });

        let coordinator = SyncCoordinator::new(
            chain.clone(),
            params.clone(),
            config.p2p.clone(),
            book.clone(),
            shutdown_rx,
        );
        let mut coordinator_task = tokio::spawn(coordinator.run());

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    pulse_log::log_error!("signal handler failed: {err}");
                }
                pulse_log::log_info!("interrupt received; shutting down");
                let _ = shutdown_tx.send(true);
                match (&mut coordinator_task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err.to_string()),
                    Err(err) => return Err(err.to_string()),
                }
            }
            finished = &mut coordinator_task => {
                match finished {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err.to_string()),
                    Err(err) => return Err(err.to_string()),
                }
            }
        }
        Ok(())
    })?;

    if let Err(err) = book.save(&config.banlist_path) {
        pulse_log::log_warn!("banlist not saved: {err}");
    }
    pulse_log::log_info!("shutdown complete");
    Ok(())
}
