//! Integration tests for the job server

use async_trait::async_trait;
use jobserver::bus::MessageBus;
use jobserver::packages::{ResolveContext, ResolveError, ResolveRequest, ResolveResponse, Resolver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Resolver with a fixed import table that counts its invocations
struct Counting {
    calls: AtomicUsize,
    delay: Duration,
}

impl Counting {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for Counting {
    async fn resolve(
        &self,
        ctx: &ResolveContext,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match request.import_path.as_str() {
            "k1" => Ok(ResolveResponse::new("k1")
                .with_import("k2")
                .with_metadata("server", ctx.server_url.as_str())),
            "broken" => Err(ResolveError::Resolution("no Go files in broken".to_string())),
            other => Ok(ResolveResponse::new(other)),
        }
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn erase(bus: impl MessageBus + 'static) -> std::sync::Arc<dyn MessageBus> {
    std::sync::Arc::new(bus)
}

mod end_to_end {
    use super::*;
    use jobserver::bus::tcp::{TcpBusClient, TcpBusServer};
    use jobserver::bus::InProcessBus;
    use jobserver::client;
    use jobserver::packages::STATS_NAME;
    use jobserver::protocol::ErrorKind;
    use jobserver::server::JobServer;
    use jobserver::JobServerError;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Two requests for K1, the second issued while the first is computing
    async fn joined_requests(server: &JobServer, bus: Arc<dyn MessageBus>, resolver: &Counting) {
        let first = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                let request = ResolveRequest::new("k1");
                client::resolve(bus.as_ref(), &request, None).await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = client::resolve(bus.as_ref(), &ResolveRequest::new("k1"), None)
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.package.as_str(), "k1");
        assert_eq!(first.imports.len(), 1);
        assert_eq!(first.metadata.get("server").map(String::as_str), Some(server.url()));
        assert_eq!(resolver.calls(), 1);

        let report = client::stats(bus.as_ref()).await.unwrap();
        let packages = report.caches[STATS_NAME];
        assert_eq!(packages.misses, 1);
        assert_eq!(packages.hits, 1);
        assert_eq!(packages.entries, 1);
        assert_eq!(packages.in_flight, 0);

        let graph = server.packages().graph();
        assert!(graph.contains("k1"));
        assert!(graph.contains("k2"));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        let deps: Vec<_> = graph.neighbors("k1").map(|id| id.to_string()).collect();
        assert_eq!(deps, vec!["k2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_process_bus() {
        let resolver = Arc::new(Counting::new(Duration::from_millis(100)));
        let bus = InProcessBus::new();
        let server = JobServer::start(
            "inproc://e2e",
            &bus,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        joined_requests(&server, erase(bus), &resolver).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tcp_bus() {
        let resolver = Arc::new(Counting::new(Duration::from_millis(100)));
        let shutdown = CancellationToken::new();
        let bus = InProcessBus::new();
        let listener = TcpBusServer::bind("127.0.0.1:0", bus.clone(), shutdown.clone())
            .await
            .unwrap();
        let server = JobServer::start(
            listener.url(),
            &bus,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
            shutdown.clone(),
        )
        .await
        .unwrap();

        let client_bus = TcpBusClient::connect(&listener.url()).await.unwrap();
        joined_requests(&server, erase(client_bus), &resolver).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failures_are_reported_and_retried() {
        let resolver = Arc::new(Counting::new(Duration::ZERO));
        let bus = InProcessBus::new();
        let _server = JobServer::start(
            "inproc://e2e",
            &bus,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        for attempt in 1..=2 {
            let err = client::resolve(&bus, &ResolveRequest::new("broken"), None)
                .await
                .unwrap_err();
            match err {
                JobServerError::Remote(reply) => assert_eq!(reply.kind, ErrorKind::Resolution),
                other => panic!("unexpected: {other:?}"),
            }
            assert_eq!(resolver.calls(), attempt);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dropped_connection_leaves_other_waiters_intact() {
        let resolver = Arc::new(Counting::new(Duration::from_millis(200)));
        let shutdown = CancellationToken::new();
        let bus = InProcessBus::new();
        let listener = TcpBusServer::bind("127.0.0.1:0", bus.clone(), shutdown.clone())
            .await
            .unwrap();
        let server = JobServer::start(
            listener.url(),
            &bus,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
            shutdown.clone(),
        )
        .await
        .unwrap();

        let leaving = TcpBusClient::connect(&listener.url()).await.unwrap();
        let first = tokio::spawn(async move {
            client::resolve(&leaving, &ResolveRequest::new("k1"), None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let staying = TcpBusClient::connect(&listener.url()).await.unwrap();
        let second = tokio::spawn(async move {
            client::resolve(&staying, &ResolveRequest::new("k1"), None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Aborting drops the first client and closes its connection
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let response = second.await.unwrap().unwrap();
        assert_eq!(response.package.as_str(), "k1");
        assert_eq!(resolver.calls(), 1);

        let packages = server.stats().caches[STATS_NAME];
        assert_eq!(packages.misses, 1);
        assert_eq!(packages.hits, 1);
        assert_eq!(packages.entries, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_request_over_tcp_gets_decode_error() {
        let shutdown = CancellationToken::new();
        let bus = InProcessBus::new();
        let listener = TcpBusServer::bind("127.0.0.1:0", bus.clone(), shutdown.clone())
            .await
            .unwrap();
        let _server = JobServer::start(
            listener.url(),
            &bus,
            Arc::new(Counting::new(Duration::ZERO)),
            shutdown.clone(),
        )
        .await
        .unwrap();

        let client_bus = TcpBusClient::connect(&listener.url()).await.unwrap();
        let reply = client_bus
            .request(
                jobserver::packages::RESOLVE_SUBJECT,
                b"{\"import_path\": 42}".to_vec(),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        let reply: jobserver::protocol::Reply<ResolveResponse> =
            jobserver::protocol::decode(&reply).unwrap();
        match reply {
            jobserver::protocol::Reply::Error(e) => assert_eq!(e.kind, ErrorKind::Decode),
            other => panic!("unexpected: {other:?}"),
        }

        shutdown.cancel();
    }
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use jobserver::bus::tcp::TcpBusServer;
    use jobserver::bus::InProcessBus;
    use jobserver::server::JobServer;
    use predicates::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Binary pointed at a config file that does not exist, so defaults apply
    fn cli(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("jobserver");
        cmd.env_remove("JOBSERVER_URL")
            .arg("--config")
            .arg(config_dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        cli(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("shared package resolution"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        cli(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("jobserver"));
    }

    #[test]
    fn resolve_help() {
        let temp = TempDir::new().unwrap();
        cli(&temp)
            .args(["resolve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Import path of the package"));
    }

    #[test]
    fn resolve_requires_url() {
        let temp = TempDir::new().unwrap();
        cli(&temp)
            .args(["resolve", "fmt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--url"));
    }

    #[test]
    fn stats_rejects_non_tcp_url() {
        let temp = TempDir::new().unwrap();
        cli(&temp)
            .args(["stats", "--url", "http://127.0.0.1:4222"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid bus URL"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[server\n").unwrap();
        cli(&temp)
            .args(["stats", "--url", "tcp://127.0.0.1:4222"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_and_stats_against_running_server() {
        let shutdown = CancellationToken::new();
        let bus = InProcessBus::new();
        let listener = TcpBusServer::bind("127.0.0.1:0", bus.clone(), shutdown.clone())
            .await
            .unwrap();
        let _server = JobServer::start(
            listener.url(),
            &bus,
            Arc::new(Counting::new(Duration::ZERO)),
            shutdown.clone(),
        )
        .await
        .unwrap();

        let url = listener.url();
        tokio::task::spawn_blocking(move || {
            let temp = TempDir::new().unwrap();
            cli(&temp)
                .args(["resolve", "--url", &url, "--tag", "netgo", "k1"])
                .assert()
                .success()
                .stdout(predicate::str::contains("\"package\": \"k1\""))
                .stdout(predicate::str::contains("k2"));

            cli(&temp)
                .args(["stats", "--url", &url, "--json"])
                .assert()
                .success()
                .stdout(predicate::str::contains("\"misses\": 1"));
        })
        .await
        .unwrap();

        shutdown.cancel();
    }
}
