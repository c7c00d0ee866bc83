use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gapps_mirror_bot::storage::GlobalStorage;
use gapps_mirror_bot::{github, Bot, Config, Db, DownloadQueue};

#[derive(Parser)]
#[command(version, author, about)]
struct Cli {
    /// Config file name, without the extension.
    #[arg(long, default_value = "config")]
    config: String,

    /// Log level filter.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> gapps_mirror_bot::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).context("invalid log level")?)
        .init();

    info!("starting the bot");
    let cfg = Arc::new(Config::load(&cli.config).context("unable to init config")?);
    info!("config parsed");

    let cache = Arc::new(Db::open(&cfg.db.path, cfg.db.timeout())?);
    let dq = Arc::new(DownloadQueue::new(cfg.max_downloads));
    let gh = Arc::new(github::Client::new(&cfg.github.token));
    let gs = Arc::new(GlobalStorage::new(Arc::clone(&cache)));

    gs.load().context("unable to load the storage cache")?;
    if let Err(err) = gs.add_latest(&gh, &dq, &cfg).await {
        warn!(error = %err, "unable to index the latest release");
    }

    let mut bot = Bot::new(
        Arc::clone(&cfg),
        Arc::clone(&dq),
        Arc::clone(&gs),
        Arc::clone(&gh),
    )
    .await?;

    let mut renew = time::interval(cfg.gapps.renew_period());
    renew.tick().await; // the immediate first tick; startup indexing covered it
    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = renew.tick() => {
                if let Err(err) = gs.add_latest(&gh, &dq, &cfg).await {
                    error!(error = %err, "unable to renew the latest release");
                }
            }
            res = bot.poll() => {
                if let Err(err) = res {
                    warn!(error = %err, "unable to get updates");
                    time::sleep(Duration::from_secs(3)).await;
                }
            }
            _ = signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("shutting down");
    gs.save();
    cache.close(false).await?;
    info!("bye");
    Ok(())
}
