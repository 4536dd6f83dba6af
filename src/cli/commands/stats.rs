//! Stats command - show cache counters of a running job server

use crate::bus::tcp::TcpBusClient;
use crate::cli::args::StatsArgs;
use crate::client;
use crate::config::Config;
use crate::error::{JobServerError, JobServerResult};
use console::style;

/// Execute the stats command
pub async fn execute(args: StatsArgs, _config: &Config) -> JobServerResult<()> {
    let bus = TcpBusClient::connect(&args.url).await?;
    let report = client::stats(&bus).await;
    bus.close();
    let report = report?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).map_err(JobServerError::Encode)?;
        println!("{}", json);
        return Ok(());
    }

    println!(
        "{} at {}",
        style("Job server stats").bold(),
        report.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  {:<16} {:>8} {:>8} {:>10} {:>8}",
        "CACHE", "HITS", "MISSES", "IN FLIGHT", "ENTRIES"
    );
    for (name, s) in &report.caches {
        println!(
            "  {:<16} {:>8} {:>8} {:>10} {:>8}",
            style(name).cyan(),
            s.hits,
            s.misses,
            s.in_flight,
            s.entries
        );
    }
    println!(
        "  {:<16} {:>8} {:>8} {:>10} {:>8}",
        "total", report.total.hits, report.total.misses, report.total.in_flight, report.total.entries
    );
    println!("  hit ratio: {:.1}%", report.total.hit_ratio() * 100.0);
    Ok(())
}
