//! Resolution backends
//!
//! The job server never inspects packages itself. A `Resolver` does the
//! actual work; `GoListResolver` shells out to `go list`.

use crate::config::schema::ResolverConfig;
use crate::error::ResolveError;
use crate::packages::request::{ResolveRequest, ResolveResponse};
use crate::server::URL_ENV;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a resolver gets besides the request itself
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Address of the job server hosting this resolution
    pub server_url: String,

    /// Cancelled when the job server shuts down
    pub cancel: CancellationToken,
}

/// Computes resolution results
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve one package
    async fn resolve(
        &self,
        ctx: &ResolveContext,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse, ResolveError>;

    /// Human-readable resolver name for logs
    fn name(&self) -> &'static str;
}

/// Resolver backed by `go list -json`
pub struct GoListResolver {
    program: String,
    extra_args: Vec<String>,
}

impl GoListResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn command(&self, ctx: &ResolveContext, request: &ResolveRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["list", "-json"]);
        if !request.build.tags.is_empty() {
            let tags: Vec<&str> = request.build.tags.iter().map(String::as_str).collect();
            cmd.arg(format!("-tags={}", tags.join(",")));
        }
        cmd.args(&self.extra_args);
        cmd.arg(&request.import_path);

        if !request.build.goos.is_empty() {
            cmd.env("GOOS", &request.build.goos);
        }
        if !request.build.goarch.is_empty() {
            cmd.env("GOARCH", &request.build.goarch);
        }
        cmd.envs(&request.env);
        // Nested toolchain invocations find their way back to this server
        cmd.env(URL_ENV, &ctx.server_url);
        if let Some(dir) = &request.dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Resolver for GoListResolver {
    async fn resolve(
        &self,
        ctx: &ResolveContext,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse, ResolveError> {
        debug!("Running {} list for {}", self.program, request.import_path);

        let child = self.command(ctx, request).spawn().map_err(|e| {
            ResolveError::Resolution(format!("failed to run {}: {}", self.program, e))
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                ResolveError::Resolution(format!("failed to wait for {}: {}", self.program, e))
            })?,
            _ = ctx.cancel.cancelled() => return Err(ResolveError::Shutdown),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::Resolution(format!(
                "{} list {} failed: {}",
                self.program,
                request.import_path,
                stderr.trim()
            )));
        }

        parse_go_list(&output.stdout, &request.import_path)
    }

    fn name(&self) -> &'static str {
        "go list"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoListPackage {
    import_path: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    export: String,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    error: Option<GoListError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoListError {
    err: String,
}

/// Turn `go list -json` output into a response
///
/// `go list` prints one JSON object per matched package back to back; only
/// the first is used.
fn parse_go_list(stdout: &[u8], import_path: &str) -> Result<ResolveResponse, ResolveError> {
    let package = serde_json::Deserializer::from_slice(stdout)
        .into_iter::<GoListPackage>()
        .next()
        .ok_or_else(|| {
            ResolveError::Resolution(format!("go list reported no package for {}", import_path))
        })?
        .map_err(|e| ResolveError::Resolution(format!("unreadable go list output: {}", e)))?;

    if let Some(error) = package.error {
        return Err(ResolveError::Resolution(error.err));
    }

    let mut response = ResolveResponse::new(package.import_path);
    response.imports = package.imports.into_iter().map(Into::into).collect();
    for (key, value) in [("name", package.name), ("dir", package.dir), ("export", package.export)] {
        if !value.is_empty() {
            response.metadata.insert(key.to_string(), value);
        }
    }
    Ok(response)
}
