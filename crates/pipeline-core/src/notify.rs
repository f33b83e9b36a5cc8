//! # Operator Notifications
//!
//! Warnings raised by handlers and tasks are forwarded to an external channel
//! (a chat bot, a pager, ...) through a [`NotificationSink`]. Delivery goes
//! through a background worker that sends at most one message per interval and
//! never lets a delivery failure reach the caller.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination of operator notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, message: &str) -> Result<()> {
        info!(target: "notification", "{message}");
        Ok(())
    }
}

/// Cheap handle used to queue notifications.
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<String>,
}

impl Notifier {
    /// Creates the handle and its delivery worker.
    ///
    /// The worker must be driven with [`NotifierWorker::run`], usually in a
    /// spawned task.
    pub fn new(sink: Arc<dyn NotificationSink>, interval: Duration) -> (Self, NotifierWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, NotifierWorker { sink, interval, receiver })
    }

    /// Queues a message without waiting for delivery.
    pub fn notify(&self, message: impl Into<String>) {
        if self.sender.send(message.into()).is_err() {
            debug!("Notifier stopped, message dropped");
        }
    }
}

/// Background half of a [`Notifier`].
pub struct NotifierWorker {
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl NotifierWorker {
    /// Delivers queued messages until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?self.interval, "Notifier started");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            ticker.tick().await;
            if let Err(err) = self.sink.send(&message).await {
                warn!(error = %err, "Failed to deliver notification");
            }
        }

        debug!("Notifier stopped");
    }
}
