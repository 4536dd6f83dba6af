//! Job server lifecycle
//!
//! A `JobServer` owns the stats registry and the resolution service of one
//! build, and keeps their subscription loops running until shut down.

use crate::bus::MessageBus;
use crate::cache::{StatsCollector, StatsReport};
use crate::error::{JobServerError, JobServerResult};
use crate::packages::{self, ResolutionService, Resolver};
use crate::router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Environment variable carrying the job server URL to child processes
pub const URL_ENV: &str = "JOBSERVER_URL";

/// Subject stats snapshots are served on
pub const STATS_SUBJECT: &str = "stats.snapshot";

/// Body of a stats request; carries nothing today
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsQuery {}

/// A running job server
pub struct JobServer {
    id: Uuid,
    url: String,
    started_at: DateTime<Utc>,
    stats: StatsCollector,
    packages: Arc<ResolutionService>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl JobServer {
    /// Subscribe every service on `bus` and start serving
    ///
    /// `url` is how clients (and resolvers' child processes) reach this
    /// server. Everything stops once `shutdown` is cancelled.
    pub async fn start(
        url: impl Into<String>,
        bus: &dyn MessageBus,
        resolver: Arc<dyn Resolver>,
        shutdown: CancellationToken,
    ) -> JobServerResult<Self> {
        let url = url.into();
        let id = Uuid::new_v4();
        let stats = StatsCollector::new();

        let (packages, packages_task) =
            packages::subscribe(&shutdown, &url, bus, &stats, resolver).await?;

        let subscription = bus.subscribe(STATS_SUBJECT).await?;
        let stats_task = tokio::spawn(router::handle_requests(
            subscription,
            shutdown.clone(),
            {
                let stats = stats.clone();
                move |_: CancellationToken, _: StatsQuery| {
                    let report = stats.snapshot();
                    async move { Ok::<_, Infallible>(report) }
                }
            },
        ));

        info!("Job server {} started at {}", id, url);
        Ok(Self {
            id,
            url,
            started_at: Utc::now(),
            stats,
            packages,
            tasks: vec![packages_task, stats_task],
            shutdown,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Counters of every cache this server owns
    pub fn stats(&self) -> StatsReport {
        self.stats.snapshot()
    }

    pub fn packages(&self) -> &Arc<ResolutionService> {
        &self.packages
    }

    /// Ask every loop to stop; `wait` returns once they have
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all subscription loops to finish
    pub async fn wait(self) -> JobServerResult<StatsReport> {
        for task in self.tasks {
            task.await.map_err(|e| {
                JobServerError::Internal(format!("subscription loop failed: {}", e))
            })?;
        }

        let report = self.stats.snapshot();
        let uptime = Utc::now() - self.started_at;
        info!(
            "Job server {} stopped after {}s: {} requests, {} hits",
            self.id,
            uptime.num_seconds(),
            report.total.requests(),
            report.total.hits
        );
        if report.total.in_flight > 0 {
            warn!(
                "{} resolutions were still running at shutdown",
                report.total.in_flight
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::error::ResolveError;
    use crate::packages::{ResolveContext, ResolveRequest, ResolveResponse};
    use crate::protocol::{self, Reply};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Leaf;

    #[async_trait]
    impl Resolver for Leaf {
        async fn resolve(
            &self,
            _ctx: &ResolveContext,
            request: &ResolveRequest,
        ) -> Result<ResolveResponse, ResolveError> {
            Ok(ResolveResponse::new(request.import_path.as_str()))
        }

        fn name(&self) -> &'static str {
            "leaf"
        }
    }

    #[tokio::test]
    async fn serves_stats_subject() {
        let bus = InProcessBus::new();
        let shutdown = CancellationToken::new();
        let server = JobServer::start("inproc://test", &bus, Arc::new(Leaf), shutdown)
            .await
            .unwrap();

        let payload = protocol::encode(&StatsQuery {}).unwrap();
        let reply = bus.request(STATS_SUBJECT, payload, None).await.unwrap();
        let report = protocol::decode::<Reply<StatsReport>>(&reply)
            .unwrap()
            .into_result()
            .unwrap();

        assert!(report.caches.contains_key(packages::STATS_NAME));
        assert_eq!(report.total.requests(), 0);
        assert_eq!(server.url(), "inproc://test");
    }

    #[tokio::test]
    async fn second_server_on_same_bus_is_rejected() {
        let bus = InProcessBus::new();
        let shutdown = CancellationToken::new();
        let _first = JobServer::start("inproc://a", &bus, Arc::new(Leaf), shutdown.clone())
            .await
            .unwrap();

        let second = JobServer::start("inproc://b", &bus, Arc::new(Leaf), shutdown).await;
        assert!(matches!(second, Err(JobServerError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn shutdown_ends_wait() {
        let bus = InProcessBus::new();
        let server = JobServer::start(
            "inproc://test",
            &bus,
            Arc::new(Leaf),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let id = server.id();
        assert!(!id.is_nil());

        server.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(1), server.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.total.in_flight, 0);
    }
}
