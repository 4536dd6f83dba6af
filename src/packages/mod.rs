//! Package resolution over the bus
//!
//! Clients publish a `ResolveRequest` on `packages.resolve` and get back a
//! `ResolveResponse`. Identical requests share one computation for the whole
//! build.

mod request;
mod resolver;
mod service;

pub use request::{BuildContext, ResolutionKey, ResolveRequest, ResolveResponse};
pub use resolver::{GoListResolver, ResolveContext, Resolver};
pub use service::ResolutionService;

pub use crate::error::ResolveError;

use crate::bus::MessageBus;
use crate::cache::StatsCollector;
use crate::error::JobServerResult;
use crate::router;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Subject resolution requests are published on
pub const RESOLVE_SUBJECT: &str = "packages.resolve";

/// Name the resolution cache registers its counters under
pub const STATS_NAME: &str = "packages";

/// Start serving resolution requests
///
/// Subscribes to `RESOLVE_SUBJECT` and spawns the dispatch loop, which runs
/// until `shutdown` is cancelled.
pub async fn subscribe(
    shutdown: &CancellationToken,
    server_url: &str,
    bus: &dyn MessageBus,
    stats: &StatsCollector,
    resolver: Arc<dyn Resolver>,
) -> JobServerResult<(Arc<ResolutionService>, JoinHandle<()>)> {
    let service = Arc::new(ResolutionService::new(
        server_url,
        resolver,
        stats.register(STATS_NAME),
        shutdown.clone(),
    ));

    let subscription = bus.subscribe(RESOLVE_SUBJECT).await?;
    let handler = {
        let service = Arc::clone(&service);
        move |cancel: CancellationToken, request: ResolveRequest| {
            let service = Arc::clone(&service);
            async move { service.resolve(&cancel, request).await }
        }
    };
    let task = tokio::spawn(router::handle_requests(
        subscription,
        shutdown.clone(),
        handler,
    ));

    Ok((service, task))
}
