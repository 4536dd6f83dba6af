//! Serve command - run a job server until interrupted

use crate::bus::tcp::TcpBusServer;
use crate::bus::InProcessBus;
use crate::cache::StatsReport;
use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::error::{JobServerError, JobServerResult};
use crate::packages::GoListResolver;
use crate::server::{JobServer, URL_ENV};
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> JobServerResult<()> {
    let listen = args.listen.as_deref().unwrap_or(&config.server.listen);
    let shutdown = CancellationToken::new();
    let bus = InProcessBus::new();

    let listener = TcpBusServer::bind(listen, bus.clone(), shutdown.clone()).await?;
    let url = listener.url();
    let resolver = Arc::new(GoListResolver::new(&config.resolver));
    let server = JobServer::start(url.clone(), &bus, resolver, shutdown.clone()).await?;

    println!(
        "{} Job server {} listening on {}",
        style("✓").green(),
        server.id(),
        style(&url).cyan()
    );
    println!("  export {}={}", URL_ENV, url);

    let mut ticker = config
        .server
        .stats_interval()
        .map(|period| interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| JobServerError::io("waiting for Ctrl-C", e))?;
                break;
            }
            _ = tick(&mut ticker) => log_stats(&server.stats()),
        }
    }

    println!("Stopping job server...");
    server.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(5), server.wait())
        .await
        .map_err(|_| JobServerError::Internal("subscription loops did not stop".to_string()))??;

    println!(
        "{} Served {} requests ({} hits, {:.0}% hit ratio)",
        style("✓").green(),
        report.total.requests(),
        report.total.hits,
        report.total.hit_ratio() * 100.0
    );
    Ok(())
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(report: &StatsReport) {
    for (name, snapshot) in &report.caches {
        info!(
            "{}: {} hits, {} misses, {} in flight, {} entries",
            name, snapshot.hits, snapshot.misses, snapshot.in_flight, snapshot.entries
        );
    }
}
