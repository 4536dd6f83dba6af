//! In-process bus built on tokio channels

use crate::bus::{Message, MessageBus, Responder, Subscription};
use crate::error::{JobServerError, JobServerResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Bus connecting publishers and subscribers within one process
///
/// Each subject has at most one subscriber, so every request has exactly one
/// handler. Queues are unbounded: admission control is not this layer's job.
#[derive(Clone, Default)]
pub struct InProcessBus {
    subjects: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn subscribe(&self, subject: &str) -> JobServerResult<Subscription> {
        let mut subjects = self.subjects.write();
        if subjects.get(subject).is_some_and(|tx| !tx.is_closed()) {
            return Err(JobServerError::AlreadySubscribed(subject.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        subjects.insert(subject.to_string(), tx);
        debug!("Subscribed to {}", subject);
        Ok(Subscription::new(subject, rx))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> JobServerResult<Vec<u8>> {
        let sender = self
            .subjects
            .read()
            .get(subject)
            .cloned()
            .ok_or_else(|| JobServerError::NoResponders(subject.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let message = Message {
            subject: subject.to_string(),
            payload,
            timeout,
            responder: Box::new(ChannelResponder(reply_tx)),
        };
        sender
            .send(message)
            .map_err(|_| JobServerError::NoResponders(subject.to_string()))?;

        let reply = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| JobServerError::RequestTimeout {
                    subject: subject.to_string(),
                    timeout,
                })?,
            None => reply_rx.await,
        };
        reply.map_err(|_| JobServerError::NoReply(subject.to_string()))
    }
}

struct ChannelResponder(oneshot::Sender<Vec<u8>>);

#[async_trait]
impl Responder for ChannelResponder {
    fn respond(self: Box<Self>, payload: Vec<u8>) -> JobServerResult<()> {
        self.0
            .send(payload)
            .map_err(|_| JobServerError::ReplyDelivery("requester stopped waiting".to_string()))
    }

    async fn closed(&mut self) {
        self.0.closed().await
    }
}
