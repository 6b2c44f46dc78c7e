use std::sync::Arc;

use clap::Parser;
use tokio::{sync::mpsc, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use talksearch::{
    active::{ActiveIndexHolder, RetirePolicy, serve_updates},
    error::{Error, Result},
    index_dir::IndexDir,
    index_handle::IndexHandle,
    pipeline::BuildOptions,
    server,
    source::{GitRepository, SourceRepository},
    state::read_state,
    watch::{WatchConfig, publish_initial, watch_for_updates},
};

mod cli;

use cli::Cli;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("TALKSEARCH_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if !cli.data_path.is_dir() {
        return Err(Error::Config(format!(
            "data path is not a directory: {}",
            cli.data_path.display()
        )));
    }

    let index_dir = IndexDir::resolve(cli.index_path.as_deref())?;
    let source: Arc<dyn SourceRepository> = Arc::new(GitRepository::new(
        &cli.data_path,
        cli.remote.as_str(),
        cli.branch.as_str(),
    ));
    let policy = if cli.keep_old_indexes {
        RetirePolicy::Retain
    } else {
        RetirePolicy::Destroy
    };
    let config = WatchConfig {
        index_dir,
        data_path: cli.data_path.clone(),
        interval: cli.check_interval,
        build: BuildOptions {
            parser_workers: cli.parser_workers,
            ..BuildOptions::default()
        },
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli, config, source, policy))
}

/// Remove every build except the one recorded in `.state`.
fn prune_stale_builds(dir: &IndexDir) {
    let keep = match read_state(dir) {
        Ok(Some(state)) => state.index,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read index state");
            return;
        }
    };
    match dir.prune_builds(&keep) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed stale index builds"),
        Err(e) => tracing::warn!(error = %e, "failed to remove stale builds"),
    }
}

async fn run(
    cli: Cli,
    config: WatchConfig,
    source: Arc<dyn SourceRepository>,
    policy: RetirePolicy,
) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    // Searches see an empty index until the first load is published.
    let holder = Arc::new(ActiveIndexHolder::new(IndexHandle::in_memory()?));
    let (publisher, updates) = mpsc::channel(1);
    let consumer = tokio::spawn(serve_updates(
        Arc::clone(&holder),
        updates,
        policy,
        cancel.clone(),
    ));

    let addr = cli.http_addr;
    let server = cli.http.then(|| {
        let holder = Arc::clone(&holder);
        let origins = cli.allowed_origins.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result =
                server::serve(addr, holder, &origins, cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        })
    });

    let loaded = publish_initial(
        &config,
        Arc::clone(&source),
        cli.force_rebuild,
        &publisher,
        &cancel,
    )
    .await;

    let watched = match loaded {
        Err(e) => Err(e),
        Ok(false) => Ok(()),
        Ok(true) => {
            if policy == RetirePolicy::Destroy {
                prune_stale_builds(&config.index_dir);
            }
            if config.interval.is_zero() {
                tracing::info!(
                    "check interval is 0, automatic updates disabled"
                );
                drop(publisher);
                Ok(())
            } else {
                let watcher = tokio::spawn(watch_for_updates(
                    config,
                    source,
                    publisher,
                    cancel.clone(),
                ));
                joined(watcher.await)
            }
        }
    };

    if watched.is_err() || server.is_none() {
        cancel.cancel();
    }
    let served = match server {
        Some(server) => joined(server.await),
        None => Ok(()),
    };

    cancel.cancel();
    if let Err(e) = consumer.await {
        tracing::error!(error = %e, "index consumer failed");
    }

    watched.and(served)
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutting down");
            cancel.cancel();
        }
    }
}

fn joined<T>(outcome: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match outcome {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Canceled),
    }
}
