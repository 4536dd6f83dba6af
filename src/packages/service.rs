//! Package resolution service: compute once, reuse many

use crate::cache::{Cache, CacheError, CacheStats};
use crate::error::ResolveError;
use crate::graph::DependencyGraph;
use crate::packages::request::{ResolutionKey, ResolveRequest, ResolveResponse};
use crate::packages::resolver::{ResolveContext, Resolver};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Owns the resolution cache and the dependency graph for one job server
pub struct ResolutionService {
    resolved: Cache<ResolutionKey, ResolveResponse, ResolveError>,
    graph: Arc<DependencyGraph>,
    resolver: Arc<dyn Resolver>,
    server_url: String,
    lifetime: CancellationToken,
}

impl ResolutionService {
    /// Create a service
    ///
    /// `lifetime` is handed to the resolver for every computation; cancelling
    /// it is the only way to interrupt work already started.
    pub fn new(
        server_url: impl Into<String>,
        resolver: Arc<dyn Resolver>,
        stats: Arc<CacheStats>,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            resolved: Cache::new(stats),
            graph: Arc::new(DependencyGraph::new()),
            resolver,
            server_url: server_url.into(),
            lifetime,
        }
    }

    /// Resolve a package, reusing any finished or in-flight computation
    ///
    /// Cancelling `cancel` makes this call return `ResolveError::Cancelled`
    /// right away; the computation itself still runs to completion and
    /// populates the cache for later callers.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        request: ResolveRequest,
    ) -> Result<ResolveResponse, ResolveError> {
        let key = ResolutionKey::derive(&request);
        debug!("Resolving {}", key);

        let resolver = Arc::clone(&self.resolver);
        let graph = Arc::clone(&self.graph);
        let ctx = ResolveContext {
            server_url: self.server_url.clone(),
            cancel: self.lifetime.clone(),
        };

        let outcome = self
            .resolved
            .get_or_compute(key.clone(), cancel, move || async move {
                let response = resolver.resolve(&ctx, &request).await?;
                record_dependencies(&graph, &response);
                debug!(
                    "Resolved {} via {} ({} imports)",
                    response.package,
                    resolver.name(),
                    response.imports.len()
                );
                Ok::<_, ResolveError>(response)
            })
            .await;

        match outcome {
            Ok(response) => Ok(response),
            Err(CacheError::Compute(e)) => {
                debug!("Resolution of {} failed: {}", key, e);
                Err(ResolveError::clone(&e))
            }
            Err(CacheError::Cancelled) if self.lifetime.is_cancelled() => {
                Err(ResolveError::Shutdown)
            }
            Err(CacheError::Cancelled) => Err(ResolveError::Cancelled),
            Err(CacheError::Abandoned) => {
                warn!("Resolution of {} ended without a result", key);
                Err(ResolveError::Abandoned)
            }
        }
    }

    /// Dependency graph of everything resolved so far
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Counters of the resolution cache
    pub fn stats(&self) -> &Arc<CacheStats> {
        self.resolved.stats()
    }

    /// Address handed to resolvers
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Register a resolved package and its imports
///
/// The graph is an auxiliary index; failures are logged and never fail the
/// resolution.
fn record_dependencies(graph: &DependencyGraph, response: &ResolveResponse) {
    let package = response.package.as_str();
    if let Err(e) = graph.add_package(package) {
        warn!("Not recording package {:?} in dependency graph: {}", package, e);
        return;
    }
    for import in &response.imports {
        if let Err(e) = graph.add_dependency(package, import.as_str()) {
            warn!(
                "Not recording {} -> {:?} in dependency graph: {}",
                package,
                import.as_str(),
                e
            );
        }
    }
}
