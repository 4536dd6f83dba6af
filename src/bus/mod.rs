//! Message bus abstraction
//!
//! Request/reply over named subjects. Every inbound `Message` carries its own
//! `Responder`; replying consumes it, so a request can be answered at most
//! once. Handlers never see the transport behind it.
//!
//! Two transports are provided:
//! - `InProcessBus`: tokio channels, used by the server and in tests
//! - `tcp`: newline-delimited JSON frames so separate processes can talk to
//!   an `InProcessBus` hosted by the job server

mod memory;
pub mod tcp;

pub use memory::InProcessBus;

use crate::error::JobServerResult;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reply capability for one inbound request
#[async_trait]
pub trait Responder: Send {
    /// Send the reply payload to the requester
    fn respond(self: Box<Self>, payload: Vec<u8>) -> JobServerResult<()>;

    /// Resolves once the requester has stopped waiting for a reply
    ///
    /// Transports that cannot tell never resolve.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

/// One inbound request
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    /// How long the requester is willing to wait, if it said so
    pub timeout: Option<Duration>,
    pub responder: Box<dyn Responder>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Stream of requests published on one subject
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next request, or `None` once the bus has dropped the subscription
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Request/reply transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Receive every request published on `subject`
    async fn subscribe(&self, subject: &str) -> JobServerResult<Subscription>;

    /// Publish a request and wait for its single reply
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> JobServerResult<Vec<u8>>;
}
