//! # Connection Registry
//!
//! Maps client ids to their live transport and per-client bookkeeping. The registry is an
//! ordinary value shared through `Arc`; there is no process-wide client table, so tests
//! can build isolated instances.
//!
//! The map lock is only held for lookups and inserts. All I/O happens on the
//! `Arc<ClientHandle>` after the lock is released, so a slow client never stalls lookups
//! for other clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::ClientId;

/// Write half of a client transport, plain or TLS
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

/// Per-client traffic counters, split by normal and file traffic
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub file_bytes_sent: AtomicU64,
    pub file_bytes_received: AtomicU64,
    pub file_messages_sent: AtomicU64,
    pub file_messages_received: AtomicU64,
}

impl TrafficCounters {
    fn record_sent(&self, bytes: u64, file_traffic: bool) {
        if file_traffic {
            self.file_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            self.file_messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_received(&self, bytes: u64, file_traffic: bool) {
        if file_traffic {
            self.file_bytes_received.fetch_add(bytes, Ordering::Relaxed);
            self.file_messages_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
            self.messages_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            file_bytes_sent: self.file_bytes_sent.load(Ordering::Relaxed),
            file_bytes_received: self.file_bytes_received.load(Ordering::Relaxed),
            file_messages_sent: self.file_messages_sent.load(Ordering::Relaxed),
            file_messages_received: self.file_messages_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub file_bytes_sent: u64,
    pub file_bytes_received: u64,
    pub file_messages_sent: u64,
    pub file_messages_received: u64,
}

/// One connected client
pub struct ClientHandle {
    id: AtomicU64,
    kind: TransportKind,
    peer: Option<SocketAddr>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    counters: TrafficCounters,
    last_heartbeat: Mutex<Instant>,
    output_root: PathBuf,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        kind: TransportKind,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        output_root: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: AtomicU64::new(id),
            kind,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            counters: TrafficCounters::default(),
            last_heartbeat: Mutex::new(Instant::now()),
            output_root,
            cancel,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn counters(&self) -> TrafficSnapshot {
        self.counters.snapshot()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Directory where files received from this client are written
    pub fn output_dir(&self) -> PathBuf {
        client_output_dir(&self.output_root, self.id())
    }

    /// Write one encoded frame and flush it, allowing `timeout` for the writer lock and
    /// again for the write.
    ///
    /// A lock timeout leaves the stream untouched. Any failure after writing started may
    /// leave a partial frame on the wire, so the connection is closed.
    pub async fn send_frame(&self, frame: &[u8], file_traffic: bool, timeout: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut writer = tokio::time::timeout(timeout, self.writer.lock())
            .await
            .map_err(|_| ProtocolError::Timeout)?;
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let written = tokio::time::timeout(timeout, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await;
        let result = match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_) => Err(ProtocolError::Timeout),
        };
        drop(writer);

        match result {
            Ok(()) => {
                self.counters.record_sent(frame.len() as u64, file_traffic);
                Ok(())
            }
            Err(e) => {
                warn!(client_id = self.id(), error = %e, "Frame write interrupted, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    pub fn record_received(&self, bytes: usize, file_traffic: bool) {
        self.counters.record_received(bytes as u64, file_traffic);
    }

    /// Refresh the liveness timestamp
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the read loop and refuse further writes
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Flush and shut down the write half
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(client_id = self.id(), error = %e, "Writer shutdown failed");
        }
    }
}

pub fn client_output_dir(root: &Path, id: ClientId) -> PathBuf {
    root.join(format!("client_{id}"))
}

/// Live client table
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    next_id: AtomicU64,
    output_root: PathBuf,
}

impl ConnectionRegistry {
    pub fn new<P: Into<PathBuf>>(output_root: P) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            output_root: output_root.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Allocate the next client id (monotonic, starting at 1)
    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `id` was ever handed out by [`next_id`](Self::next_id)
    pub fn is_issued(&self, id: ClientId) -> bool {
        id != 0 && id < self.next_id.load(Ordering::Relaxed)
    }

    /// Insert a handle under its id, returning any handle it displaced
    pub fn register(&self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let id = handle.id();
        let previous = self.clients.write().insert(id, handle);
        if let Some(old) = &previous {
            old.close();
        }
        info!(client_id = id, "Client registered");
        previous
    }

    /// Build and insert a handle around `writer`
    pub fn register_with_id(
        &self,
        id: ClientId,
        kind: TransportKind,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        cancel: CancellationToken,
    ) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle::new(
            id,
            kind,
            peer,
            writer,
            self.output_root.clone(),
            cancel,
        ));
        self.register(handle.clone());
        handle
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and close a client
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        let removed = self.clients.write().remove(&id);
        if let Some(handle) = &removed {
            handle.close();
            info!(client_id = id, "Client removed");
        }
        removed
    }

    /// Remove `id` only if it still maps to `handle`
    pub fn remove_if_same(&self, id: ClientId, handle: &Arc<ClientHandle>) -> bool {
        let mut clients = self.clients.write();
        match clients.get(&id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                clients.remove(&id);
                drop(clients);
                handle.close();
                info!(client_id = id, "Client removed");
                true
            }
            _ => false,
        }
    }

    /// Move the connection registered as `from` to the id `to`.
    ///
    /// Fails when `to` is already live or `from` is unknown.
    pub fn rekey(&self, from: ClientId, to: ClientId) -> Result<Arc<ClientHandle>> {
        let mut clients = self.clients.write();
        if clients.contains_key(&to) {
            return Err(ProtocolError::InvalidOperation(format!(
                "client id {to} is already connected"
            )));
        }
        let handle = clients
            .remove(&from)
            .ok_or(ProtocolError::ClientNotConnected(from))?;
        handle.id.store(to, Ordering::Release);
        clients.insert(to, handle.clone());
        drop(clients);
        info!(from, to, "Client re-keyed");
        Ok(handle)
    }

    /// Write an encoded frame to a client
    pub async fn send_bytes(
        &self,
        id: ClientId,
        frame: &[u8],
        file_traffic: bool,
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.get(id).ok_or(ProtocolError::ClientNotConnected(id))?;
        handle.send_frame(frame, file_traffic, timeout).await
    }

    pub fn record_received(&self, id: ClientId, bytes: usize, file_traffic: bool) {
        if let Some(handle) = self.get(id) {
            handle.record_received(bytes, file_traffic);
        }
    }

    pub fn touch(&self, id: ClientId) {
        if let Some(handle) = self.get(id) {
            handle.touch();
        }
    }

    /// Clients whose last heartbeat is older than `timeout`
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .read()
            .iter()
            .filter(|(_, handle)| handle.idle_for() > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove and close every client
    pub fn disconnect_all(&self) -> Vec<Arc<ClientHandle>> {
        let drained: Vec<_> = self.clients.write().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.close();
        }
        drained
    }
}
