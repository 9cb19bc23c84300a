//! Companion client for a tiered link server, over plain TCP or TLS.
//!
//! A background reader task owns the read half: it answers the server's `Welcome`,
//! feeds chunk acknowledgements to the file sender, optionally stores files the server
//! pushes, and hands everything else to [`Client::recv`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{TransferConfig, TransportConfig};
use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{ClientId, CommunicationData, Content, Priority};
use crate::service::registry::BoxedWriter;
use crate::service::transfer::{
    stored_file_name, FileReceiver, FileSender, MessageSink, OutgoingTransfers, PendingCompletion,
};
use crate::transport::tls::TlsClientConfig;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};

/// Peer id under which files pushed by the server are stored
pub const SERVER_PEER_ID: ClientId = 0;

/// Connection options for [`Client`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    /// How long to wait for the server's `Welcome`
    pub welcome_timeout: Duration,
    /// Upper bound for a single frame write
    pub send_timeout: Duration,
    /// Accept files pushed by the server into this directory
    pub download_root: Option<PathBuf>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            transfer: TransferConfig::default(),
            welcome_timeout: DEFAULT_TIMEOUT,
            send_timeout: DEFAULT_TIMEOUT,
            download_root: None,
        }
    }
}

/// Write side shared by the client API, the reader task and file transfers
struct Link {
    writer: Mutex<BoxedWriter>,
    codec: PacketCodec,
    send_timeout: Duration,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Link {
    /// A write interrupted after it started would leave a partial frame on the stream,
    /// so it ends the connection.
    async fn write(&self, data: &CommunicationData) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.codec.encode(data)?;
        let mut writer = tokio::time::timeout(self.send_timeout, self.writer.lock())
            .await
            .map_err(|_| ProtocolError::Timeout)?;

        let written = tokio::time::timeout(self.send_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => {
                self.metrics.frame_sent(frame.len() as u64);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Write failed, closing connection");
                self.cancel.cancel();
                Err(ProtocolError::Io(e))
            }
            Err(_) => {
                warn!("Write timed out mid-frame, closing connection");
                self.cancel.cancel();
                Err(ProtocolError::Timeout)
            }
        }
    }
}

impl MessageSink for Link {
    fn send(&self, data: CommunicationData) -> BoxFuture<'_, Result<()>> {
        async move { self.write(&data).await }.boxed()
    }
}

/// A connected client
pub struct Client {
    link: Arc<Link>,
    id: watch::Receiver<ClientId>,
    inbox: mpsc::UnboundedReceiver<CommunicationData>,
    transfers: Arc<OutgoingTransfers>,
    options: ClientOptions,
    next_seq: AtomicU64,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect over plain TCP with default options.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_options(addr, ClientOptions::default()).await
    }

    #[instrument(skip(options))]
    pub async fn connect_with_options(addr: &str, options: ClientOptions) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, options).await
    }

    /// Connect over TLS with default options.
    pub async fn connect_tls(addr: &str, tls: &TlsClientConfig) -> Result<Self> {
        Self::connect_tls_with_options(addr, tls, ClientOptions::default()).await
    }

    #[instrument(skip(tls, options))]
    pub async fn connect_tls_with_options(
        addr: &str,
        tls: &TlsClientConfig,
        options: ClientOptions,
    ) -> Result<Self> {
        let stream = with_timeout_error(tls.connect(addr), options.welcome_timeout).await?;
        Self::from_stream(stream, options).await
    }

    /// Run the protocol over an established stream and wait for the server's `Welcome`.
    pub async fn from_stream<S>(stream: S, options: ClientOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let link = Arc::new(Link {
            writer: Mutex::new(Box::new(write_half)),
            codec: PacketCodec::from_config(&options.transport),
            send_timeout: options.send_timeout,
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        });

        let (id_tx, id_rx) = watch::channel(0);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let transfers = Arc::new(OutgoingTransfers::new());
        let receiver = options
            .download_root
            .as_ref()
            .map(|root| FileReceiver::new(root.clone(), &options.transfer, metrics.clone()));

        let reader = tokio::spawn(
            ReaderTask {
                link: link.clone(),
                id: id_tx,
                inbox: inbox_tx,
                transfers: transfers.clone(),
                receiver,
                metrics,
                cancel: cancel.clone(),
            }
            .run(read_half),
        );

        let mut client = Self {
            link,
            id: id_rx,
            inbox,
            transfers,
            next_seq: AtomicU64::new(1),
            cancel,
            reader: Some(reader),
            options,
        };
        let id = client.wait_for_welcome().await?;
        info!(client_id = id, "Connected");
        Ok(client)
    }

    async fn wait_for_welcome(&mut self) -> Result<ClientId> {
        let timeout = self.options.welcome_timeout;
        with_timeout_error(
            async {
                self.id
                    .changed()
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                Ok(*self.id.borrow_and_update())
            },
            timeout,
        )
        .await
    }

    /// Id most recently assigned by the server
    pub fn client_id(&self) -> ClientId {
        *self.id.borrow()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.link.metrics
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Write one message as is.
    pub async fn send(&self, data: CommunicationData) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.link.write(&data).await
    }

    /// Send a text message and return its sequence number.
    pub async fn send_message<S: Into<String>>(&self, message: S, priority: Priority) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send(CommunicationData::normal(message, priority).with_seq(seq))
            .await?;
        Ok(seq)
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(CommunicationData::heartbeat()).await
    }

    /// Next message from the server, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<CommunicationData> {
        self.inbox.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<CommunicationData> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Ask the server to move this connection back to `previous` and replay whatever
    /// was queued for it. Returns the id the server settled on, which is the current
    /// one when the request was refused.
    #[instrument(skip(self))]
    pub async fn reconnect_as(&mut self, previous: ClientId) -> Result<ClientId> {
        self.id.borrow_and_update();
        self.send(CommunicationData::reconnect(previous)).await?;
        let assigned = self.wait_for_welcome().await?;
        if assigned == previous {
            info!(client_id = assigned, "Previous id resumed");
        } else {
            warn!(client_id = assigned, previous, "Server refused previous id");
        }
        Ok(assigned)
    }

    /// Send a file to the server and return once every chunk is acknowledged.
    pub async fn send_file<P: AsRef<Path>>(&self, path: P, priority: Priority) -> Result<PendingCompletion> {
        let sink: Arc<dyn MessageSink> = self.link.clone();
        FileSender::new(
            SERVER_PEER_ID,
            sink,
            self.transfers.clone(),
            self.options.transfer.clone(),
        )
        .with_priority(priority)
        .send(path)
        .await
    }

    /// Shut the connection down and wait for the reader task.
    pub async fn close(mut self) {
        self.cancel.cancel();
        {
            let mut writer = self.link.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Writer shutdown failed");
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReaderTask {
    link: Arc<Link>,
    id: watch::Sender<ClientId>,
    inbox: mpsc::UnboundedSender<CommunicationData>,
    transfers: Arc<OutgoingTransfers>,
    receiver: Option<FileReceiver>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl ReaderTask {
    async fn run<R: AsyncRead + Send + Unpin>(self, reader: R) {
        let mut frames = FramedRead::new(reader, self.link.codec.frame_codec());
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(Ok(packet))) => {
                    self.metrics.frame_received(packet.frame_len() as u64);
                    match self.link.codec.decode_packet(&packet) {
                        Ok(data) => self.route(data).await,
                        Err(e) => {
                            self.metrics.frame_rejected(&e);
                            warn!(error = %e, "Undecodable payload dropped");
                        }
                    }
                }
                Some(Ok(Err(e))) => {
                    self.metrics.frame_rejected(&e);
                    warn!(error = %e, "Invalid frame dropped");
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Transport error");
                    break;
                }
                None => {
                    debug!("Server closed the connection");
                    break;
                }
            }
        }
        self.cancel.cancel();
        if let Some(receiver) = &self.receiver {
            receiver.on_client_disconnected(SERVER_PEER_ID).await;
        }
    }

    async fn route(&self, data: CommunicationData) {
        match data.content {
            Content::Welcome { client_id } => {
                self.id.send_replace(client_id);
            }
            Content::ChunkAck {
                ref file_id,
                chunk_index,
            } => {
                self.transfers.record_ack(SERVER_PEER_ID, file_id, chunk_index);
            }
            Content::FileCompleteAck {
                ref file_id,
                success,
                ref detail,
            } => {
                self.transfers
                    .record_completion(SERVER_PEER_ID, file_id, success, detail.clone());
            }
            Content::FileChunk(_) | Content::FileComplete(_) if self.receiver.is_some() => {
                self.receive_file_traffic(data).await;
            }
            _ => {
                trace!(info_type = %data.info_type(), "Delivering to inbox");
                let _ = self.inbox.send(data);
            }
        }
    }

    async fn receive_file_traffic(&self, data: CommunicationData) {
        let Some(receiver) = &self.receiver else {
            return;
        };
        let reply = match data.content {
            Content::FileChunk(chunk) => {
                let (file_id, index) = (chunk.file_id.clone(), chunk.chunk_index);
                match receiver.handle_chunk(SERVER_PEER_ID, chunk).await {
                    Ok(true) => Some(CommunicationData::chunk_ack(file_id, index)),
                    Ok(false) => None,
                    Err(e) => {
                        warn!(%file_id, chunk_index = index, error = %e, "Chunk rejected");
                        None
                    }
                }
            }
            Content::FileComplete(complete) => {
                let file_id = complete.file_id.clone();
                match receiver.handle_complete(SERVER_PEER_ID, complete).await {
                    Ok(Some(path)) => Some(CommunicationData::file_complete_ack(
                        file_id,
                        true,
                        stored_file_name(&path),
                    )),
                    Ok(None) => None,
                    Err(e) => Some(CommunicationData::file_complete_ack(file_id, false, e.to_string())),
                }
            }
            _ => None,
        };
        if let Some(reply) = reply {
            if let Err(e) = self.link.write(&reply).await {
                warn!(error = %e, "Failed to answer file traffic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn test_welcome_timeout() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let options = ClientOptions {
            welcome_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };
        let result = Client::from_stream(client_side, options).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_welcome_assigns_id_and_inbox_receives() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let codec = PacketCodec::default();

        let welcome = codec.encode(&CommunicationData::welcome(7)).unwrap();
        server_side.write_all(&welcome).await.unwrap();
        let mut client = Client::from_stream(client_side, ClientOptions::default())
            .await
            .unwrap();
        assert_eq!(client.client_id(), 7);

        let note = codec
            .encode(&CommunicationData::normal("hello", Priority::Low))
            .unwrap();
        server_side.write_all(&note).await.unwrap();
        let received = client.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            received.content,
            Content::Normal {
                message: "hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_server_ends_inbox() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let codec = PacketCodec::default();
        server_side
            .write_all(&codec.encode(&CommunicationData::welcome(1)).unwrap())
            .await
            .unwrap();
        let mut client = Client::from_stream(client_side, ClientOptions::default())
            .await
            .unwrap();
        drop(server_side);
        assert!(matches!(
            client.recv_timeout(Duration::from_secs(1)).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.send_message("late", Priority::High).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_write_ends_connection() {
        let (client_side, mut server_side) = tokio::io::duplex(16);
        let codec = PacketCodec::default();
        let welcome = codec.encode(&CommunicationData::welcome(3)).unwrap();
        let options = ClientOptions {
            send_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };

        let (written, connected) = tokio::join!(
            server_side.write_all(&welcome),
            Client::from_stream(client_side, options)
        );
        written.unwrap();
        let mut client = connected.unwrap();

        let result = client.send_message("y".repeat(200), Priority::Medium).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_message("after", Priority::High).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            client.recv_timeout(Duration::from_secs(1)).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
