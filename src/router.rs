//! Request router: bridges bus subscriptions to typed handlers
//!
//! Every inbound message is decoded, dispatched on its own task and answered
//! exactly once through its responder. The router never serializes requests;
//! handlers must be safe to run concurrently.

use crate::bus::{Message, Subscription};
use crate::protocol::{self, ErrorKind, ErrorReply, Reply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serve requests from `subscription` until `shutdown` is cancelled
///
/// `handler` receives a token that is cancelled when the server shuts down,
/// when the request's own timeout elapses, or when the requester goes away.
pub async fn handle_requests<Req, Resp, E, H, Fut>(
    mut subscription: Subscription,
    shutdown: CancellationToken,
    handler: H,
) where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Into<ErrorReply> + Send + 'static,
    H: Fn(CancellationToken, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let subject = subscription.subject().to_string();
    info!("Handling requests on {}", subject);

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        tokio::spawn(dispatch(
            message,
            shutdown.child_token(),
            Arc::clone(&handler),
        ));
    }

    info!("Stopped handling requests on {}", subject);
}

async fn dispatch<Req, Resp, E, H, Fut>(message: Message, cancel: CancellationToken, handler: Arc<H>)
where
    Req: DeserializeOwned,
    Resp: Serialize,
    E: Into<ErrorReply>,
    H: Fn(CancellationToken, Req) -> Fut,
    Fut: Future<Output = Result<Resp, E>>,
{
    let Message {
        subject,
        payload,
        timeout,
        mut responder,
    } = message;

    let reply: Reply<Resp> = match protocol::decode::<Req>(&payload) {
        Err(e) => {
            warn!("Rejecting malformed request on {}: {}", subject, e);
            Reply::Error(ErrorReply::new(ErrorKind::Decode, e.to_string()))
        }
        Ok(request) => {
            let call = handler(cancel.clone(), request);
            tokio::select! {
                result = call => result.into(),
                _ = deadline(timeout) => {
                    cancel.cancel();
                    Reply::Error(ErrorReply::new(
                        ErrorKind::Timeout,
                        format!("no result within {:?}", timeout.unwrap_or_default()),
                    ))
                }
                _ = responder.closed() => {
                    cancel.cancel();
                    debug!("Requester on {} stopped waiting", subject);
                    Reply::Error(ErrorReply::new(ErrorKind::Cancelled, "requester stopped waiting"))
                }
            }
        }
    };

    let payload = protocol::encode(&reply).unwrap_or_else(|e| {
        error!("Failed to encode reply on {}: {}", subject, e);
        br#"{"error":{"kind":"internal","message":"failed to encode reply"}}"#.to_vec()
    });
    if let Err(e) = responder.respond(payload) {
        error!("Failed to deliver reply on {}: {}", subject, e);
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
