//! Observability and Metrics
//!
//! Atomic counters owned by a server instance. There is no global collector; every
//! component that records something receives the same `Arc<Metrics>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::ProtocolError;

/// Metrics collector for one server instance
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently registered connections
    pub connections_active: AtomicU64,
    /// TLS handshakes that failed
    pub tls_handshake_failures: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Frames read and decoded
    pub frames_received: AtomicU64,
    /// Bytes written
    pub bytes_sent: AtomicU64,
    /// Bytes read
    pub bytes_received: AtomicU64,
    /// Frames dropped for checksum mismatch
    pub checksum_failures: AtomicU64,
    /// Frames dropped for an unsupported version
    pub version_rejections: AtomicU64,
    /// Frames dropped for exceeding the size limit
    pub oversized_frames: AtomicU64,
    /// Other protocol errors (header, length, payload)
    pub protocol_errors: AtomicU64,
    /// Failed send attempts
    pub send_failures: AtomicU64,
    /// Retries scheduled
    pub retries: AtomicU64,
    /// Messages parked in a resume queue
    pub resume_queued: AtomicU64,
    /// Messages delivered out of a resume queue
    pub resume_delivered: AtomicU64,
    /// File chunks accepted
    pub chunks_accepted: AtomicU64,
    /// File chunks dropped on hash mismatch
    pub chunks_rejected: AtomicU64,
    /// Files reassembled and verified
    pub files_completed: AtomicU64,
    /// Transfers aborted or failing verification
    pub files_failed: AtomicU64,
    /// Handler failures and panics in worker pools
    pub handler_failures: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tls_handshake_failures: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            version_rejections: AtomicU64::new(0),
            oversized_frames: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            resume_queued: AtomicU64::new(0),
            resume_delivered: AtomicU64::new(0),
            chunks_accepted: AtomicU64::new(0),
            chunks_rejected: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tls_handshake_failed(&self) {
        self.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Classify and count a dropped frame
    pub fn frame_rejected(&self, error: &ProtocolError) {
        let counter = match error {
            ProtocolError::ChecksumMismatch { .. } => &self.checksum_failures,
            ProtocolError::UnsupportedVersion(_) => &self.version_rejections,
            ProtocolError::PacketTooLarge { .. } => &self.oversized_frames,
            _ => &self.protocol_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resume_queued(&self) {
        self.resume_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resume_delivered(&self, count: u64) {
        self.resume_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn chunk_accepted(&self) {
        self.chunks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_rejected(&self) {
        self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            version_rejections: self.version_rejections.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            resume_queued: self.resume_queued.load(Ordering::Relaxed),
            resume_delivered: self.resume_delivered.load(Ordering::Relaxed),
            chunks_accepted: self.chunks_accepted.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            tls_handshake_failures = s.tls_handshake_failures,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            checksum_failures = s.checksum_failures,
            version_rejections = s.version_rejections,
            oversized_frames = s.oversized_frames,
            protocol_errors = s.protocol_errors,
            send_failures = s.send_failures,
            retries = s.retries,
            resume_queued = s.resume_queued,
            resume_delivered = s.resume_delivered,
            chunks_accepted = s.chunks_accepted,
            chunks_rejected = s.chunks_rejected,
            files_completed = s.files_completed,
            files_failed = s.files_failed,
            handler_failures = s.handler_failures,
            uptime_seconds = s.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub tls_handshake_failures: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub checksum_failures: u64,
    pub version_rejections: u64,
    pub oversized_frames: u64,
    pub protocol_errors: u64,
    pub send_failures: u64,
    pub retries: u64,
    pub resume_queued: u64,
    pub resume_delivered: u64,
    pub chunks_accepted: u64,
    pub chunks_rejected: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub handler_failures: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
