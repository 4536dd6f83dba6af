//! Typed client helpers
//!
//! Thin wrappers over `MessageBus::request` that encode the request and
//! unwrap the reply envelope. Error replies surface as
//! `JobServerError::Remote`; callers decide whether to retry with
//! `JobServerError::is_retryable`.

use crate::bus::MessageBus;
use crate::cache::StatsReport;
use crate::error::JobServerResult;
use crate::packages::{ResolveRequest, ResolveResponse, RESOLVE_SUBJECT};
use crate::protocol::{self, Reply};
use crate::server::{StatsQuery, STATS_SUBJECT};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Send one typed request and decode its reply
pub async fn request<Req, Resp>(
    bus: &dyn MessageBus,
    subject: &str,
    request: &Req,
    timeout: Option<Duration>,
) -> JobServerResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = protocol::encode(request)?;
    debug!("Requesting {} ({} bytes)", subject, payload.len());
    let reply = bus.request(subject, payload, timeout).await?;
    protocol::decode::<Reply<Resp>>(&reply)?.into_result()
}

/// Resolve one package through the job server
pub async fn resolve(
    bus: &dyn MessageBus,
    request: &ResolveRequest,
    timeout: Option<Duration>,
) -> JobServerResult<ResolveResponse> {
    self::request(bus, RESOLVE_SUBJECT, request, timeout).await
}

/// Fetch the server's cache counters
pub async fn stats(bus: &dyn MessageBus) -> JobServerResult<StatsReport> {
    self::request(bus, STATS_SUBJECT, &StatsQuery {}, None).await
}
