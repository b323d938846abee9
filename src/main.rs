use anyhow::{Context, Result};
use chainsync::coordinator::{Coordinator, DownstreamEvent};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = chainsync::config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("sync engine starting");
    tracing::info!(networks = cfg.networks.len(), sources = cfg.sources.len(), "config loaded");

    let mut coordinator = Coordinator::new(cfg).await.context("start coordinator")?;
    let shutdown = coordinator.shutdown_token();
    let (tx, rx) = mpsc::channel::<DownstreamEvent>(1024);

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    join_set.spawn(consume_events(rx));
    join_set.spawn(async move {
        coordinator.run_historical(&tx).await?;
        coordinator.start_realtime();
        while !coordinator.shutdown_token().is_cancelled() {
            coordinator.run_realtime_once(&tx).await?;
        }
        coordinator.kill();
        drop(tx);
        Ok(())
    });

    tracing::info!("sync engine started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("sync engine task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("sync engine task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("sync engine task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("sync engine task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("sync engine task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

async fn consume_events(mut rx: mpsc::Receiver<DownstreamEvent>) -> Result<()> {
    let mut historical_total = 0u64;
    while let Some(event) = rx.recv().await {
        match event {
            DownstreamEvent::Historical(batch) => {
                historical_total += batch.len() as u64;
                tracing::debug!(batch = batch.len(), total = historical_total, "historical events");
            }
            DownstreamEvent::Block(batch) => {
                tracing::info!(count = batch.len(), "realtime block events");
            }
            DownstreamEvent::Finalize(checkpoint) => {
                tracing::info!(%checkpoint, "chain finalized");
            }
            DownstreamEvent::Reorg(checkpoint) => {
                tracing::warn!(%checkpoint, "reorg detected");
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
