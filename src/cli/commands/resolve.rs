//! Resolve command - ask a running job server for one package

use crate::bus::tcp::TcpBusClient;
use crate::cli::args::ResolveArgs;
use crate::client;
use crate::config::Config;
use crate::error::{JobServerError, JobServerResult};
use crate::packages::{BuildContext, ResolveRequest};
use std::time::Duration;

/// Execute the resolve command
pub async fn execute(args: ResolveArgs, config: &Config) -> JobServerResult<()> {
    let request = build_request(args.goos, args.goarch, args.tags, args.dir, args.import_path)?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .or_else(|| config.server.request_timeout());

    let bus = TcpBusClient::connect(&args.url).await?;
    let response = client::resolve(&bus, &request, timeout).await;
    bus.close();

    let json = serde_json::to_string_pretty(&response?).map_err(JobServerError::Encode)?;
    println!("{}", json);
    Ok(())
}

fn build_request(
    goos: Option<String>,
    goarch: Option<String>,
    tags: Vec<String>,
    dir: Option<std::path::PathBuf>,
    import_path: String,
) -> JobServerResult<ResolveRequest> {
    let host = BuildContext::host();
    let build = tags.into_iter().fold(
        BuildContext::new(goos.unwrap_or(host.goos), goarch.unwrap_or(host.goarch)),
        |build, tag| build.with_tag(tag),
    );

    let mut request = ResolveRequest::new(import_path).with_build(build);
    // The server runs elsewhere; relative paths would resolve against its cwd
    if let Some(dir) = dir {
        let dir = std::path::absolute(&dir)
            .map_err(|e| JobServerError::io(format!("resolving {}", dir.display()), e))?;
        request = request.with_dir(dir);
    }
    Ok(request)
}
