//! # File Transfer
//!
//! Files travel as a stream of `FileChunk` messages followed by one `FileComplete`.
//!
//! ## Send side
//! [`FileChunker`] splits a file into fixed-size chunks under a fresh transfer id and
//! hashes the whole file up front. [`FileSender`] pushes every chunk through a
//! [`MessageSink`], waits until [`OutgoingTransfers`] has seen a `ChunkAck` for each index,
//! re-sends whatever is missing and finally emits the completion marker.
//!
//! ## Receive side
//! [`FileReceiver`] keeps one session per `(client, file_id)`:
//!
//! ```text
//! Unseen -> Receiving -> Reassembling -> Verified | Failed
//! ```
//!
//! Chunks are verified against their own hash before being staged on disk. Staging and
//! reassembly for one session are serialized by that session's async mutex; different
//! sessions proceed independently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    ClientId, CommunicationData, Content, FileChunk, FileComplete, Priority,
};
use crate::service::registry::client_output_dir;
use crate::utils::metrics::{Metrics, Timer};

/// Lowercase hex SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Somewhere a file sender can push messages.
pub trait MessageSink: Send + Sync {
    fn send(&self, data: CommunicationData) -> BoxFuture<'_, Result<()>>;
}

/// Name reported back to the sender for a stored file; never the local path.
pub fn stored_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reduce a peer-supplied file name to a bare final component.
fn sanitize_file_name(name: &str, file_id: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("file_{file_id}"))
}

/// Transfer ids become directory names, so only a conservative character set is allowed.
fn is_safe_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id.len() <= 128
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Read-only view of a file split into fixed-size chunks
#[derive(Debug, Clone)]
pub struct FileChunker {
    path: PathBuf,
    file_id: String,
    file_name: String,
    file_size: u64,
    chunk_size: usize,
    total_chunks: u32,
    file_hash: String,
}

impl FileChunker {
    /// Open `path`, assign a fresh transfer id and hash the whole file.
    pub async fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if chunk_size == 0 {
            return Err(ProtocolError::InvalidOperation(
                "chunk size must be greater than 0".to_string(),
            ));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                ProtocolError::InvalidOperation(format!("not a file path: {}", path.display()))
            })?;

        let mut file = tokio::fs::File::open(&path).await?;
        let file_size = file.metadata().await?.len();

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        // An empty file still travels as one empty chunk so the receiver opens a session
        let total_chunks = file_size.div_ceil(chunk_size as u64).max(1);
        let total_chunks = u32::try_from(total_chunks).map_err(|_| {
            ProtocolError::InvalidOperation(format!("{} has too many chunks", path.display()))
        })?;

        Ok(Self {
            path,
            file_id: Uuid::new_v4().to_string(),
            file_name,
            file_size,
            chunk_size,
            total_chunks,
            file_hash: format!("{:x}", hasher.finalize()),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    /// Read and hash chunk `index`.
    pub async fn chunk(&self, index: u32) -> Result<FileChunk> {
        if index >= self.total_chunks {
            return Err(ProtocolError::InvalidOperation(format!(
                "chunk {index} out of range for {} chunks",
                self.total_chunks
            )));
        }

        let offset = u64::from(index) * self.chunk_size as u64;
        let len = (self.file_size - offset.min(self.file_size)).min(self.chunk_size as u64) as usize;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut chunk_data = vec![0u8; len];
        file.read_exact(&mut chunk_data).await?;

        Ok(FileChunk {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            chunk_index: index,
            total_chunks: self.total_chunks,
            chunk_hash: sha256_hex(&chunk_data),
            chunk_data,
        })
    }

    pub fn completion(&self) -> FileComplete {
        FileComplete {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            total_chunks: self.total_chunks,
            file_hash: self.file_hash.clone(),
        }
    }
}

/// Receiver's verdict on a whole transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub success: bool,
    pub detail: String,
}

struct TransferProgress {
    peer: ClientId,
    total: u32,
    acked: HashSet<u32>,
    notify: Arc<Notify>,
    completion: Option<oneshot::Sender<CompletionOutcome>>,
}

/// Sender-side ack bookkeeping for transfers in flight. Acks only count when they come
/// from the peer the transfer was sent to.
#[derive(Default)]
pub struct OutgoingTransfers {
    transfers: Mutex<HashMap<String, TransferProgress>>,
}

impl OutgoingTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(
        &self,
        peer: ClientId,
        file_id: &str,
        total: u32,
    ) -> (Arc<Notify>, oneshot::Receiver<CompletionOutcome>) {
        let notify = Arc::new(Notify::new());
        let (tx, rx) = oneshot::channel();
        self.transfers.lock().insert(
            file_id.to_string(),
            TransferProgress {
                peer,
                total,
                acked: HashSet::new(),
                notify: notify.clone(),
                completion: Some(tx),
            },
        );
        (notify, rx)
    }

    /// Record a `ChunkAck` from `peer`. Returns `false` for unknown transfers and for
    /// acks from anyone but the transfer's destination.
    pub fn record_ack(&self, peer: ClientId, file_id: &str, chunk_index: u32) -> bool {
        let mut transfers = self.transfers.lock();
        let Some(progress) = transfers.get_mut(file_id) else {
            debug!(file_id, chunk_index, "Ack for unknown transfer");
            return false;
        };
        if progress.peer != peer {
            warn!(client_id = peer, file_id, chunk_index, "Ack from a peer that is not the destination");
            return false;
        }
        if chunk_index < progress.total {
            progress.acked.insert(chunk_index);
            progress.notify.notify_one();
        }
        true
    }

    /// Record the receiver's `FileCompleteAck` from `peer` and release the transfer.
    pub fn record_completion(&self, peer: ClientId, file_id: &str, success: bool, detail: String) -> bool {
        let mut transfers = self.transfers.lock();
        match transfers.get(file_id) {
            None => {
                debug!(file_id, "Completion ack for unknown transfer");
                return false;
            }
            Some(progress) if progress.peer != peer => {
                warn!(client_id = peer, file_id, "Completion ack from a peer that is not the destination");
                return false;
            }
            Some(_) => {}
        }
        let Some(mut progress) = transfers.remove(file_id) else {
            return false;
        };
        drop(transfers);
        if let Some(tx) = progress.completion.take() {
            let _ = tx.send(CompletionOutcome { success, detail });
        }
        true
    }

    /// Chunk indices not yet acknowledged, ascending
    pub fn missing(&self, file_id: &str) -> Vec<u32> {
        self.transfers
            .lock()
            .get(file_id)
            .map(|p| (0..p.total).filter(|i| !p.acked.contains(i)).collect())
            .unwrap_or_default()
    }

    pub fn abandon(&self, file_id: &str) {
        self.transfers.lock().remove(file_id);
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.lock().len()
    }
}

/// A transfer whose chunks are all acknowledged and whose completion marker is sent
pub struct PendingCompletion {
    pub file_id: String,
    pub file_hash: String,
    pub total_chunks: u32,
    /// Chunks sent more than once because their ack did not arrive in time
    pub resent_chunks: usize,
    completion: Option<oneshot::Receiver<CompletionOutcome>>,
    transfers: Arc<OutgoingTransfers>,
}

impl PendingCompletion {
    /// Wait for the receiver's verdict.
    pub async fn wait(mut self, timeout: Duration) -> Result<CompletionOutcome> {
        let rx = self.completion.take().ok_or(ProtocolError::ConnectionClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.transfers.abandon(&self.file_id);
        }
    }
}

/// Sends whole files through a [`MessageSink`]
pub struct FileSender {
    peer: ClientId,
    sink: Arc<dyn MessageSink>,
    transfers: Arc<OutgoingTransfers>,
    config: TransferConfig,
    priority: Priority,
}

impl FileSender {
    /// `peer` is the id whose acks are accepted for transfers started here.
    pub fn new(
        peer: ClientId,
        sink: Arc<dyn MessageSink>,
        transfers: Arc<OutgoingTransfers>,
        config: TransferConfig,
    ) -> Self {
        Self {
            peer,
            sink,
            transfers,
            config,
            priority: Priority::High,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Send every chunk, wait for their acks and emit the completion marker.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn send<P: AsRef<Path>>(&self, path: P) -> Result<PendingCompletion> {
        let chunker = FileChunker::open(path.as_ref(), self.config.chunk_size).await?;
        let file_id = chunker.file_id().to_string();
        let (notify, completion) = self
            .transfers
            .begin(self.peer, &file_id, chunker.total_chunks());

        info!(
            file_id = %file_id,
            file_name = chunker.file_name(),
            file_size = chunker.file_size(),
            total_chunks = chunker.total_chunks(),
            "Starting file transfer"
        );

        let result = self.send_chunks(&chunker, &notify).await;
        let resent_chunks = match result {
            Ok(resent) => resent,
            Err(e) => {
                self.transfers.abandon(&file_id);
                return Err(e);
            }
        };

        let complete = CommunicationData::new(Content::FileComplete(chunker.completion()), self.priority);
        if let Err(e) = self.sink.send(complete).await {
            self.transfers.abandon(&file_id);
            return Err(e);
        }

        info!(file_id = %file_id, resent_chunks, "All chunks acknowledged, completion sent");
        Ok(PendingCompletion {
            file_id,
            file_hash: chunker.file_hash().to_string(),
            total_chunks: chunker.total_chunks(),
            resent_chunks,
            completion: Some(completion),
            transfers: self.transfers.clone(),
        })
    }

    async fn send_chunks(&self, chunker: &FileChunker, notify: &Notify) -> Result<usize> {
        let file_id = chunker.file_id();
        for index in 0..chunker.total_chunks() {
            self.send_chunk(chunker, index).await?;
        }

        let mut resent = 0;
        let mut round = 0;
        loop {
            self.wait_for_acks(file_id, notify).await;
            let missing = self.transfers.missing(file_id);
            if missing.is_empty() {
                return Ok(resent);
            }
            if round >= self.config.max_resend_rounds {
                warn!(file_id, missing = missing.len(), "Giving up on unacknowledged chunks");
                return Err(ProtocolError::TransferIncomplete {
                    file_id: file_id.to_string(),
                    missing: missing.len(),
                });
            }
            round += 1;
            warn!(file_id, round, missing = missing.len(), "Re-sending unacknowledged chunks");
            for index in missing {
                self.send_chunk(chunker, index).await?;
                resent += 1;
            }
        }
    }

    async fn send_chunk(&self, chunker: &FileChunker, index: u32) -> Result<()> {
        let chunk = chunker.chunk(index).await?;
        let data = CommunicationData::new(Content::FileChunk(chunk), self.priority)
            .with_seq(u64::from(index));
        self.sink.send(data).await
    }

    /// Block until every chunk is acked or `ack_timeout` passes without completion.
    async fn wait_for_acks(&self, file_id: &str, notify: &Notify) {
        let deadline = tokio::time::Instant::now() + self.config.ack_timeout;
        while !self.transfers.missing(file_id).is_empty() {
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Receiving,
    Reassembling,
    Verified,
    Failed,
}

#[derive(Debug, Clone)]
struct StagedChunk {
    path: PathBuf,
    len: usize,
}

struct SessionInner {
    state: TransferState,
    chunks: BTreeMap<u32, StagedChunk>,
}

/// Receiver-side bookkeeping for one in-progress transfer
pub struct FileTransferSession {
    client_id: ClientId,
    file_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    staging_dir: PathBuf,
    destination: PathBuf,
    inner: tokio::sync::Mutex<SessionInner>,
}

impl FileTransferSession {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn state(&self) -> TransferState {
        self.inner.lock().await.state
    }

    pub async fn received_chunks(&self) -> usize {
        self.inner.lock().await.chunks.len()
    }
}

/// Called with the client id and final path of every verified file
pub type CompletionCallback = Arc<dyn Fn(ClientId, PathBuf) + Send + Sync>;

type SessionKey = (ClientId, String);

/// Receiving end of the file-transfer protocol
pub struct FileReceiver {
    output_root: PathBuf,
    staging_dir_name: String,
    sessions: Mutex<HashMap<SessionKey, Arc<FileTransferSession>>>,
    on_complete: Option<CompletionCallback>,
    metrics: Arc<Metrics>,
}

impl FileReceiver {
    pub fn new<P: Into<PathBuf>>(output_root: P, config: &TransferConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            output_root: output_root.into(),
            staging_dir_name: config.staging_dir_name.clone(),
            sessions: Mutex::new(HashMap::new()),
            on_complete: None,
            metrics,
        }
    }

    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, client_id: ClientId, file_id: &str) -> Option<Arc<FileTransferSession>> {
        self.sessions
            .lock()
            .get(&(client_id, file_id.to_string()))
            .cloned()
    }

    fn open_session(&self, client_id: ClientId, chunk: &FileChunk) -> Arc<FileTransferSession> {
        let key = (client_id, chunk.file_id.clone());
        let mut sessions = self.sessions.lock();
        sessions
            .entry(key)
            .or_insert_with(|| {
                let client_dir = client_output_dir(&self.output_root, client_id);
                let file_name = sanitize_file_name(&chunk.file_name, &chunk.file_id);
                info!(
                    client_id,
                    file_id = %chunk.file_id,
                    file_name = %file_name,
                    file_size = chunk.file_size,
                    total_chunks = chunk.total_chunks,
                    "Opened transfer session"
                );
                Arc::new(FileTransferSession {
                    client_id,
                    file_id: chunk.file_id.clone(),
                    staging_dir: client_dir.join(&self.staging_dir_name).join(&chunk.file_id),
                    destination: client_dir.join(&file_name),
                    file_name,
                    file_size: chunk.file_size,
                    total_chunks: chunk.total_chunks,
                    inner: tokio::sync::Mutex::new(SessionInner {
                        state: TransferState::Receiving,
                        chunks: BTreeMap::new(),
                    }),
                })
            })
            .clone()
    }

    /// Verify and stage one chunk. Returns `true` when the chunk was accepted and
    /// should be acknowledged; rejected chunks are dropped without an ack.
    #[instrument(skip(self, chunk), fields(file_id = %chunk.file_id, chunk_index = chunk.chunk_index))]
    pub async fn handle_chunk(&self, client_id: ClientId, chunk: FileChunk) -> Result<bool> {
        if sha256_hex(&chunk.chunk_data) != chunk.chunk_hash {
            warn!(client_id, "Chunk failed hash verification, dropped");
            self.metrics.chunk_rejected();
            return Ok(false);
        }
        if !is_safe_file_id(&chunk.file_id) || chunk.chunk_index >= chunk.total_chunks {
            warn!(client_id, total_chunks = chunk.total_chunks, "Malformed chunk dropped");
            self.metrics.chunk_rejected();
            return Ok(false);
        }

        let session = self.open_session(client_id, &chunk);
        if chunk.chunk_index >= session.total_chunks {
            warn!(
                client_id,
                total_chunks = session.total_chunks,
                "Chunk index beyond session chunk count, dropped"
            );
            self.metrics.chunk_rejected();
            return Ok(false);
        }

        let mut inner = session.inner.lock().await;
        if inner.state != TransferState::Receiving {
            debug!(client_id, state = ?inner.state, "Late chunk for finished session ignored");
            return Ok(false);
        }

        tokio::fs::create_dir_all(&session.staging_dir).await?;
        let path = session
            .staging_dir
            .join(format!("{}.chunk", chunk.chunk_index));
        tokio::fs::write(&path, &chunk.chunk_data).await?;

        let replaced = inner
            .chunks
            .insert(
                chunk.chunk_index,
                StagedChunk {
                    path,
                    len: chunk.chunk_data.len(),
                },
            )
            .is_some();
        debug!(
            client_id,
            received = inner.chunks.len(),
            total_chunks = session.total_chunks,
            replaced,
            "Chunk staged"
        );
        self.metrics.chunk_accepted();
        Ok(true)
    }

    /// Finish a transfer.
    ///
    /// `Ok(None)`: no such session (duplicate or spurious completion). `Ok(Some(path))`:
    /// verified and written. Errors mean the transfer failed and its session is gone.
    #[instrument(skip(self, complete), fields(file_id = %complete.file_id))]
    pub async fn handle_complete(
        &self,
        client_id: ClientId,
        complete: FileComplete,
    ) -> Result<Option<PathBuf>> {
        let Some(session) = self.session(client_id, &complete.file_id) else {
            info!(client_id, "Completion for unknown transfer ignored");
            return Ok(None);
        };

        let mut inner = session.inner.lock().await;
        if inner.state != TransferState::Receiving {
            debug!(client_id, state = ?inner.state, "Duplicate completion ignored");
            return Ok(None);
        }
        inner.state = TransferState::Reassembling;

        let result = self.reassemble(&session, &inner.chunks, &complete).await;
        inner.state = if result.is_ok() {
            TransferState::Verified
        } else {
            TransferState::Failed
        };
        drop(inner);

        self.sessions
            .lock()
            .remove(&(client_id, complete.file_id.clone()));
        remove_staging(&session.staging_dir).await;

        match result {
            Ok(path) => {
                self.metrics.file_completed();
                info!(
                    client_id,
                    path = %path.display(),
                    file_size = session.file_size,
                    "File transfer verified"
                );
                if let Some(callback) = &self.on_complete {
                    callback(client_id, path.clone());
                }
                Ok(Some(path))
            }
            Err(e) => {
                self.metrics.file_failed();
                error!(client_id, error = %e, "File transfer failed");
                Err(e)
            }
        }
    }

    async fn reassemble(
        &self,
        session: &FileTransferSession,
        chunks: &BTreeMap<u32, StagedChunk>,
        complete: &FileComplete,
    ) -> Result<PathBuf> {
        let _timer = Timer::start("reassemble");
        if complete.total_chunks != session.total_chunks {
            return Err(ProtocolError::InvalidOperation(format!(
                "{}: session has {}, completion declares {}",
                constants::ERR_CHUNK_COUNT,
                session.total_chunks,
                complete.total_chunks
            )));
        }

        if let Some(parent) = session.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&session.destination).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        for index in 0..session.total_chunks {
            let staged = chunks.get(&index).ok_or_else(|| {
                ProtocolError::InvalidOperation(format!(
                    "{} {index} of {}",
                    constants::ERR_MISSING_CHUNK,
                    session.total_chunks
                ))
            })?;
            let data = tokio::fs::read(&staged.path).await?;
            if data.len() != staged.len {
                return Err(ProtocolError::InvalidOperation(format!(
                    "staged chunk {index} changed size on disk"
                )));
            }
            hasher.update(&data);
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let actual = format!("{:x}", hasher.finalize());
        if actual != complete.file_hash {
            if let Err(e) = tokio::fs::remove_file(&session.destination).await {
                warn!(path = %session.destination.display(), error = %e, "Failed to delete corrupt file");
            }
            return Err(ProtocolError::IntegrityFailure {
                file_id: session.file_id.clone(),
                reason: format!(
                    "{}: expected {}, computed {actual}",
                    constants::ERR_FILE_HASH,
                    complete.file_hash
                ),
            });
        }

        debug!(
            client_id = session.client_id,
            file_name = %session.file_name,
            written,
            "Reassembled file"
        );
        Ok(session.destination.clone())
    }

    /// Drop every session belonging to `client_id` along with its staged chunks.
    pub async fn on_client_disconnected(&self, client_id: ClientId) {
        let dropped: Vec<_> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<_> = sessions
                .keys()
                .filter(|(id, _)| *id == client_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k))
                .collect()
        };

        for session in &dropped {
            let mut inner = session.inner.lock().await;
            inner.state = TransferState::Failed;
            inner.chunks.clear();
            drop(inner);
            remove_staging(&session.staging_dir).await;
        }
        if !dropped.is_empty() {
            info!(client_id, sessions = dropped.len(), "Dropped transfer sessions of disconnected client");
        }
    }
}

async fn remove_staging(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove staging directory"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn receiver(root: &Path) -> FileReceiver {
        FileReceiver::new(root, &TransferConfig::default(), Arc::new(Metrics::new()))
    }

    async fn chunks_of(path: &Path, chunk_size: usize) -> (FileChunker, Vec<FileChunk>) {
        let chunker = FileChunker::open(path, chunk_size).await.unwrap();
        let mut chunks = Vec::new();
        for i in 0..chunker.total_chunks() {
            chunks.push(chunker.chunk(i).await.unwrap());
        }
        (chunker, chunks)
    }

    #[tokio::test]
    async fn test_chunker_splits_and_hashes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data = pattern(3 * MIB + MIB / 2);
        std::fs::write(&path, &data).unwrap();

        let (chunker, chunks) = chunks_of(&path, MIB).await;
        assert_eq!(chunker.total_chunks(), 4);
        assert_eq!(chunker.file_hash(), sha256_hex(&data));
        assert_eq!(chunks[3].chunk_data.len(), MIB / 2);
        assert_eq!(chunks[0].chunk_hash, sha256_hex(&data[..MIB]));
        assert!(Uuid::parse_str(chunker.file_id()).is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_with_duplicate_reassembles() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("report.bin");
        let data = pattern(3 * MIB + MIB / 2);
        std::fs::write(&path, &data).unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let seen = completed.clone();
        let rx = receiver(out.path()).with_completion_callback(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let (chunker, chunks) = chunks_of(&path, MIB).await;
        for i in [2usize, 0, 3, 0, 1] {
            assert!(rx.handle_chunk(1, chunks[i].clone()).await.unwrap());
        }

        let written = rx
            .handle_complete(1, chunker.completion())
            .await
            .unwrap()
            .expect("session exists");
        assert_eq!(written, out.path().join("client_1").join("report.bin"));
        assert_eq!(std::fs::read(&written).unwrap(), data);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(rx.active_sessions(), 0);
        assert!(!out
            .path()
            .join("client_1")
            .join(".staging")
            .join(chunker.file_id())
            .exists());
    }

    #[tokio::test]
    async fn test_bad_chunk_is_dropped_and_missing_chunk_fails() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("a.bin");
        std::fs::write(&path, pattern(2500)).unwrap();
        let (chunker, mut chunks) = chunks_of(&path, 1000).await;

        chunks[1].chunk_data[0] ^= 0xFF;
        let rx = receiver(out.path());
        assert!(rx.handle_chunk(4, chunks[0].clone()).await.unwrap());
        assert!(!rx.handle_chunk(4, chunks[1].clone()).await.unwrap());
        assert!(rx.handle_chunk(4, chunks[2].clone()).await.unwrap());
        assert_eq!(
            rx.session(4, chunker.file_id()).unwrap().received_chunks().await,
            2
        );

        let result = rx.handle_complete(4, chunker.completion()).await;
        assert!(matches!(result, Err(ProtocolError::InvalidOperation(_))));
        assert_eq!(rx.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_whole_file_mismatch_deletes_file() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("b.bin");
        std::fs::write(&path, pattern(100)).unwrap();
        let (chunker, chunks) = chunks_of(&path, 64).await;

        let rx = receiver(out.path());
        for chunk in chunks {
            rx.handle_chunk(2, chunk).await.unwrap();
        }
        let mut complete = chunker.completion();
        complete.file_hash = sha256_hex(b"something else");

        let result = rx.handle_complete(2, complete).await;
        assert!(matches!(result, Err(ProtocolError::IntegrityFailure { .. })));
        assert!(!out.path().join("client_2").join("b.bin").exists());
    }

    #[tokio::test]
    async fn test_unknown_completion_is_ignored() {
        let out = TempDir::new().unwrap();
        let rx = receiver(out.path());
        let complete = FileComplete {
            file_id: "nope".into(),
            file_name: "x".into(),
            file_size: 0,
            total_chunks: 1,
            file_hash: String::new(),
        };
        assert_eq!(rx.handle_complete(1, complete).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_index_beyond_total_and_path_traversal() {
        let out = TempDir::new().unwrap();
        let rx = receiver(out.path());
        let data = b"payload".to_vec();
        let mut chunk = FileChunk {
            file_id: "abc-1".into(),
            file_name: "../../etc/passwd".into(),
            file_size: data.len() as u64,
            chunk_index: 1,
            total_chunks: 1,
            chunk_hash: sha256_hex(&data),
            chunk_data: data.clone(),
        };
        assert!(!rx.handle_chunk(1, chunk.clone()).await.unwrap());

        chunk.chunk_index = 0;
        assert!(rx.handle_chunk(1, chunk).await.unwrap());
        let complete = FileComplete {
            file_id: "abc-1".into(),
            file_name: "../../etc/passwd".into(),
            file_size: data.len() as u64,
            total_chunks: 1,
            file_hash: sha256_hex(&data),
        };
        let path = rx.handle_complete(1, complete).await.unwrap().unwrap();
        assert_eq!(path, out.path().join("client_1").join("passwd"));
    }

    #[tokio::test]
    async fn test_disconnect_drops_sessions() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("c.bin");
        std::fs::write(&path, pattern(300)).unwrap();
        let (chunker, chunks) = chunks_of(&path, 100).await;

        let rx = receiver(out.path());
        rx.handle_chunk(8, chunks[0].clone()).await.unwrap();
        rx.handle_chunk(9, chunks[0].clone()).await.unwrap();
        assert_eq!(rx.active_sessions(), 2);

        rx.on_client_disconnected(8).await;
        assert_eq!(rx.active_sessions(), 1);
        assert!(rx.session(8, chunker.file_id()).is_none());
        assert!(!out.path().join("client_8").join(".staging").join(chunker.file_id()).exists());
    }

    /// Sink that feeds a receiver directly and acks what it accepts
    struct LoopbackSink {
        receiver: Arc<FileReceiver>,
        transfers: Arc<OutgoingTransfers>,
        drop_first_of: Mutex<HashSet<u32>>,
    }

    impl MessageSink for LoopbackSink {
        fn send(&self, data: CommunicationData) -> BoxFuture<'_, Result<()>> {
            async move {
                match data.content {
                    Content::FileChunk(chunk) => {
                        // Lose the first copy of selected chunks
                        if self.drop_first_of.lock().remove(&chunk.chunk_index) {
                            return Ok(());
                        }
                        let (id, idx) = (chunk.file_id.clone(), chunk.chunk_index);
                        if self.receiver.handle_chunk(1, chunk).await? {
                            self.transfers.record_ack(1, &id, idx);
                        }
                    }
                    Content::FileComplete(complete) => {
                        let id = complete.file_id.clone();
                        let result = self.receiver.handle_complete(1, complete).await;
                        self.transfers
                            .record_completion(1, &id, result.is_ok(), String::new());
                    }
                    _ => {}
                }
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_sender_resends_unacked_chunks() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("d.bin");
        let data = pattern(5000);
        std::fs::write(&path, &data).unwrap();

        let transfers = Arc::new(OutgoingTransfers::new());
        let rx = Arc::new(receiver(out.path()));
        let sink = Arc::new(LoopbackSink {
            receiver: rx.clone(),
            transfers: transfers.clone(),
            drop_first_of: Mutex::new([1u32, 3].into_iter().collect()),
        });
        let config = TransferConfig {
            chunk_size: 1000,
            ack_timeout: Duration::from_millis(50),
            ..TransferConfig::default()
        };

        let pending = FileSender::new(1, sink, transfers.clone(), config)
            .send(&path)
            .await
            .unwrap();
        assert_eq!(pending.total_chunks, 5);
        assert_eq!(pending.resent_chunks, 2);

        let outcome = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(std::fs::read(out.path().join("client_1").join("d.bin")).unwrap(), data);
        assert_eq!(transfers.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acks_from_other_peers_are_ignored() {
        let transfers = OutgoingTransfers::new();
        let (_notify, mut completion) = transfers.begin(4, "xfer", 2);

        assert!(!transfers.record_ack(5, "xfer", 0));
        assert_eq!(transfers.missing("xfer"), vec![0, 1]);
        assert!(transfers.record_ack(4, "xfer", 0));
        assert_eq!(transfers.missing("xfer"), vec![1]);

        assert!(!transfers.record_completion(5, "xfer", true, "forged".into()));
        assert_eq!(transfers.in_flight(), 1);
        assert!(completion.try_recv().is_err());

        assert!(transfers.record_completion(4, "xfer", true, "x.bin".into()));
        assert_eq!(
            completion.try_recv().unwrap(),
            CompletionOutcome {
                success: true,
                detail: "x.bin".into()
            }
        );
        assert_eq!(transfers.in_flight(), 0);
    }

    #[test]
    fn test_stored_file_name_hides_directories() {
        let path = Path::new("/srv/received/client_3/report.csv");
        assert_eq!(stored_file_name(path), "report.csv");
    }
}
