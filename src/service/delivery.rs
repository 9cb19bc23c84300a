//! # Retry & Resume
//!
//! Outgoing messages travel as [`OutgoingEnvelope`]s through the outgoing tier pools.
//! Each attempt looks the destination up in the [`ConnectionRegistry`]:
//!
//! - destination absent: the payload goes straight to that destination's resume queue,
//!   no retry is consumed;
//! - send failure or timeout: the retry count is bumped, the policy interval is waited
//!   out (cancellable) and the envelope goes back on the same tier;
//! - retry count reaches the policy maximum: the payload lands in the resume queue.
//!
//! Completion messages (`FileComplete`, `FileCompleteAck`) get exactly one attempt.
//!
//! Resume queues are flushed oldest-first in a background task whenever the destination
//! re-registers or a send to it succeeds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::RetryConfig;
use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{ClientId, CommunicationData, Priority};
use crate::service::pool::{Processor, TierQueues};
use crate::service::registry::{ClientHandle, ConnectionRegistry};
use crate::service::transfer::MessageSink;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::cancellable_sleep;

/// A queued send and its retry bookkeeping
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub destination: ClientId,
    pub data: CommunicationData,
    pub priority: Priority,
    pub retry_count: u32,
    pub last_sent: Option<Instant>,
}

impl OutgoingEnvelope {
    pub fn new(destination: ClientId, data: CommunicationData, priority: Priority) -> Self {
        Self {
            destination,
            data,
            priority,
            retry_count: 0,
            last_sent: None,
        }
    }
}

/// Per-destination holding area for undeliverable messages. In memory only.
#[derive(Debug, Default)]
pub struct ResumeQueues {
    queues: Mutex<HashMap<ClientId, VecDeque<CommunicationData>>>,
}

impl ResumeQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, destination: ClientId, data: CommunicationData) {
        self.queues
            .lock()
            .entry(destination)
            .or_default()
            .push_back(data);
    }

    /// Put `items` back at the head of the queue, keeping their order.
    pub fn push_front_all(&self, destination: ClientId, items: Vec<CommunicationData>) {
        if items.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(destination).or_default();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    /// Remove and return everything queued for `destination`, oldest first.
    pub fn take_all(&self, destination: ClientId) -> Vec<CommunicationData> {
        self.queues
            .lock()
            .remove(&destination)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, destination: ClientId) -> usize {
        self.queues
            .lock()
            .get(&destination)
            .map_or(0, VecDeque::len)
    }

    pub fn total(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }
}

/// Send-with-retry path behind the outgoing pools
pub struct Delivery {
    registry: Arc<ConnectionRegistry>,
    codec: PacketCodec,
    retry: RetryConfig,
    send_timeout: Duration,
    queues: TierQueues<OutgoingEnvelope>,
    resume: ResumeQueues,
    flushing: Mutex<HashSet<ClientId>>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Delivery {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        codec: PacketCodec,
        retry: RetryConfig,
        send_timeout: Duration,
        queues: TierQueues<OutgoingEnvelope>,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            codec,
            retry,
            send_timeout,
            queues,
            resume: ResumeQueues::new(),
            flushing: Mutex::new(HashSet::new()),
            cancel,
            metrics,
        }
    }

    /// Queue `data` for `destination` on the given tier. Never blocks and never reports
    /// delivery failure; undeliverable messages end up in the resume queue.
    pub fn enqueue(
        &self,
        destination: ClientId,
        data: CommunicationData,
        priority: Priority,
    ) -> Result<()> {
        trace!(
            client_id = destination,
            info_type = %data.info_type(),
            %priority,
            "Queued outgoing message"
        );
        self.queues
            .enqueue(priority, OutgoingEnvelope::new(destination, data, priority))
    }

    /// Pool callback for the outgoing tiers
    pub fn processor(self: &Arc<Self>) -> Processor<OutgoingEnvelope> {
        let delivery = self.clone();
        Arc::new(move |envelope| {
            let delivery = delivery.clone();
            async move { delivery.attempt(envelope).await }.boxed()
        })
    }

    /// One delivery attempt for `envelope`.
    pub async fn attempt(self: &Arc<Self>, mut envelope: OutgoingEnvelope) -> Result<()> {
        let destination = envelope.destination;
        let live = self
            .registry
            .get(destination)
            .filter(|handle| !handle.cancellation().is_cancelled());
        let Some(handle) = live else {
            debug!(
                client_id = destination,
                info_type = %envelope.data.info_type(),
                "Destination offline, deferring to resume queue"
            );
            self.defer(destination, envelope.data);
            return Ok(());
        };

        envelope.last_sent = Some(Instant::now());
        let result = self.send_direct(&handle, &envelope.data).await;
        match result {
            Ok(()) => {
                if self.resume.pending(destination) > 0 {
                    self.flush_resume(destination);
                }
                Ok(())
            }
            Err(e) if is_transient(&e) => self.retry_or_defer(envelope, e).await,
            Err(e) => {
                error!(
                    client_id = destination,
                    info_type = %envelope.data.info_type(),
                    error = %e,
                    "Dropping unencodable message"
                );
                Err(e)
            }
        }
    }

    async fn retry_or_defer(
        self: &Arc<Self>,
        mut envelope: OutgoingEnvelope,
        cause: ProtocolError,
    ) -> Result<()> {
        let destination = envelope.destination;
        self.metrics.send_failed();

        if envelope.data.is_completion() {
            warn!(
                client_id = destination,
                info_type = %envelope.data.info_type(),
                error = %cause,
                "Completion message send failed; not retried"
            );
            return Ok(());
        }

        envelope.retry_count += 1;
        let policy = self.retry.policy(envelope.priority);
        if envelope.retry_count >= policy.max_retries {
            warn!(
                client_id = destination,
                priority = %envelope.priority,
                attempts = envelope.retry_count,
                error = %cause,
                "Retries exhausted, moving message to resume queue"
            );
            self.defer(destination, envelope.data);
            return Ok(());
        }

        debug!(
            client_id = destination,
            priority = %envelope.priority,
            retry_count = envelope.retry_count,
            interval_ms = policy.interval.as_millis() as u64,
            error = %cause,
            "Send failed, scheduling retry"
        );
        self.metrics.retry_scheduled();

        if !cancellable_sleep(policy.interval, &self.cancel).await {
            self.defer(destination, envelope.data);
            return Ok(());
        }
        let priority = envelope.priority;
        self.queues.enqueue(priority, envelope)
    }

    /// Encode and write one message on an already resolved connection.
    ///
    /// A connection that had to be closed mid-frame leaves the registry at once, so the
    /// next attempt defers instead of writing after a partial frame.
    pub async fn send_direct(&self, handle: &Arc<ClientHandle>, data: &CommunicationData) -> Result<()> {
        let frame = self.codec.encode(data)?;
        if let Err(e) = handle
            .send_frame(&frame, data.is_file_traffic(), self.send_timeout)
            .await
        {
            if handle.cancellation().is_cancelled() {
                self.registry.remove_if_same(handle.id(), handle);
            }
            return Err(e);
        }
        self.metrics.frame_sent(frame.len() as u64);
        Ok(())
    }

    fn defer(&self, destination: ClientId, data: CommunicationData) {
        self.resume.push(destination, data);
        self.metrics.resume_queued();
    }

    pub fn resume_queues(&self) -> &ResumeQueues {
        &self.resume
    }

    pub fn pending_resume(&self, destination: ClientId) -> usize {
        self.resume.pending(destination)
    }

    /// Drain `destination`'s resume queue in the background. At most one flush per
    /// destination runs at a time; extra requests while one is active are ignored.
    pub fn flush_resume(self: &Arc<Self>, destination: ClientId) {
        if self.resume.pending(destination) == 0 || self.cancel.is_cancelled() {
            return;
        }
        if !self.flushing.lock().insert(destination) {
            return;
        }

        let delivery = self.clone();
        tokio::spawn(async move {
            let delivered = delivery.drain_resume(destination).await;
            delivery.flushing.lock().remove(&destination);
            if delivered > 0 {
                info!(client_id = destination, delivered, "Resume queue flushed");
            }
            // Items pushed while the flag was held would otherwise wait for the next trigger
            if delivered > 0 && delivery.registry.contains(destination) {
                delivery.flush_resume(destination);
            }
        });
    }

    async fn drain_resume(&self, destination: ClientId) -> u64 {
        let mut delivered = 0u64;
        let mut batch: VecDeque<CommunicationData> = self.resume.take_all(destination).into();

        while let Some(data) = batch.pop_front() {
            if self.cancel.is_cancelled() {
                batch.push_front(data);
                break;
            }
            let Some(handle) = self.registry.get(destination) else {
                batch.push_front(data);
                break;
            };
            match self.send_direct(&handle, &data).await {
                Ok(()) => delivered += 1,
                Err(e) if is_transient(&e) => {
                    debug!(client_id = destination, error = %e, "Resume flush interrupted");
                    batch.push_front(data);
                    break;
                }
                Err(e) => {
                    error!(client_id = destination, error = %e, "Dropping unencodable resumed message");
                }
            }
        }

        self.resume.push_front_all(destination, batch.into());
        if delivered > 0 {
            self.metrics.resume_delivered(delivered);
        }
        delivered
    }
}

/// Failures worth another attempt: the connection may recover or be replaced.
fn is_transient(error: &ProtocolError) -> bool {
    matches!(
        error,
        ProtocolError::Io(_) | ProtocolError::Timeout | ProtocolError::ConnectionClosed
    )
}

/// [`MessageSink`] bound to one destination; sends go through the retry pipeline.
#[derive(Clone)]
pub struct Outbound {
    delivery: Arc<Delivery>,
    destination: ClientId,
}

impl Outbound {
    pub fn new(delivery: Arc<Delivery>, destination: ClientId) -> Self {
        Self {
            delivery,
            destination,
        }
    }
}

impl MessageSink for Outbound {
    fn send(&self, data: CommunicationData) -> BoxFuture<'_, Result<()>> {
        let priority = data.priority;
        let result = self.delivery.enqueue(self.destination, data, priority);
        async move { result }.boxed()
    }
}
