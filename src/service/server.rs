//! # Server
//!
//! Owns every moving part of a running instance:
//!
//! - plain and (optionally) TLS accept loops;
//! - one read task per connection feeding the incoming tier pools;
//! - the six {incoming, outgoing} x {High, Medium, Low} worker pools;
//! - the heartbeat monitor and the optional periodic monitoring report.
//!
//! All of it hangs off one [`CancellationToken`]; [`Server::stop`] cancels it, drains
//! the pools and closes every connection.
//!
//! ```no_run
//! use tiered_link::config::NetworkConfig;
//! use tiered_link::service::server::Server;
//! use std::sync::Arc;
//!
//! # async fn run() -> tiered_link::error::Result<()> {
//! let mut server = Server::new(NetworkConfig::default())?
//!     .on_message(Arc::new(|client_id, message| {
//!         println!("{client_id}: {message}");
//!     }));
//! server.start(true).await?;
//! // ...
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::codec::PacketCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{ClientId, CommunicationData, Content, InfoType, Priority};
use crate::service::delivery::{Delivery, OutgoingEnvelope, Outbound};
use crate::service::pool::{Direction, Processor, TierPools, TierQueues};
use crate::service::registry::{ClientHandle, ConnectionRegistry, TransportKind};
use crate::service::transfer::{
    stored_file_name, CompletionCallback, FileReceiver, FileSender, OutgoingTransfers,
    PendingCompletion,
};
use crate::transport::tls::TlsServerConfig;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{cancellable_sleep, with_timeout_error};

/// Called with the sender id and text of every `Normal` message
pub type MessageCallback = Arc<dyn Fn(ClientId, String) + Send + Sync>;

/// A decoded message waiting in an incoming tier
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub client_id: ClientId,
    pub data: CommunicationData,
    pub received_at: Instant,
}

/// State shared by the accept loops, read tasks and handlers of a running server
struct ServerCore {
    config: NetworkConfig,
    registry: Arc<ConnectionRegistry>,
    codec: PacketCodec,
    delivery: Arc<Delivery>,
    receiver: Arc<FileReceiver>,
    transfers: Arc<OutgoingTransfers>,
    incoming: TierQueues<IncomingMessage>,
    on_message: Option<MessageCallback>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

struct Running {
    core: Arc<ServerCore>,
    incoming: TierPools<IncomingMessage>,
    outgoing: TierPools<OutgoingEnvelope>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    tls_local_addr: Option<SocketAddr>,
}

/// The tiered link server
pub struct Server {
    config: NetworkConfig,
    tls: Option<TlsServerConfig>,
    on_message: Option<MessageCallback>,
    on_file: Option<CompletionCallback>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    transfers: Arc<OutgoingTransfers>,
    monitoring_interval_ms: Arc<AtomicU64>,
    running: Option<Running>,
}

impl Server {
    /// Validate `config` and build a stopped server. A TLS identity is picked up from
    /// `cert_path`/`key_path` when `tls_address` is set.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate_strict()?;

        let tls = match (
            &config.server.tls_address,
            &config.server.cert_path,
            &config.server.key_path,
        ) {
            (Some(_), Some(cert), Some(key)) => Some(TlsServerConfig::new(cert.clone(), key.clone())),
            _ => None,
        };

        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new(config.server.output_root.clone())),
            metrics: Arc::new(Metrics::new()),
            transfers: Arc::new(OutgoingTransfers::new()),
            monitoring_interval_ms: Arc::new(AtomicU64::new(
                config.server.monitoring_interval.as_millis() as u64,
            )),
            config,
            tls,
            on_message: None,
            on_file: None,
            running: None,
        })
    }

    /// Serve TLS with this identity on `server.tls_address`.
    pub fn with_tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn on_message(mut self, callback: MessageCallback) -> Self {
        self.on_message = Some(callback);
        self
    }

    pub fn on_file_received(mut self, callback: CompletionCallback) -> Self {
        self.on_file = Some(callback);
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listeners and start every background task.
    #[instrument(skip(self), fields(address = %self.config.server.address))]
    pub async fn start(&mut self, enable_monitoring: bool) -> Result<()> {
        if self.running.is_some() {
            return Err(ProtocolError::InvalidOperation(
                constants::ERR_SERVER_RUNNING.to_string(),
            ));
        }

        let acceptor = match &self.tls {
            Some(tls) => {
                if self.config.server.tls_address.is_none() {
                    return Err(ProtocolError::ConfigError(
                        constants::ERR_TLS_ADDRESS.to_string(),
                    ));
                }
                Some(tls.acceptor()?)
            }
            None => None,
        };

        let listener = TcpListener::bind(&self.config.server.address).await?;
        let local_addr = listener.local_addr()?;
        let tls_listener = match (&acceptor, &self.config.server.tls_address) {
            (Some(_), Some(addr)) => Some(TcpListener::bind(addr).await?),
            _ => None,
        };
        let tls_local_addr = tls_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let shutdown = CancellationToken::new();
        let codec = PacketCodec::from_config(&self.config.transport);

        let incoming = TierPools::new(
            Direction::Incoming,
            &self.config.pools,
            &shutdown,
            self.metrics.clone(),
        );
        let outgoing = TierPools::new(
            Direction::Outgoing,
            &self.config.pools,
            &shutdown,
            self.metrics.clone(),
        );

        let delivery = Arc::new(Delivery::new(
            self.registry.clone(),
            codec.clone(),
            self.config.retry.clone(),
            self.config.server.send_timeout,
            outgoing.queues(),
            shutdown.clone(),
            self.metrics.clone(),
        ));

        let mut receiver = FileReceiver::new(
            self.config.server.output_root.clone(),
            &self.config.transfer,
            self.metrics.clone(),
        );
        if let Some(callback) = &self.on_file {
            receiver = receiver.with_completion_callback(callback.clone());
        }

        let core = Arc::new(ServerCore {
            config: self.config.clone(),
            registry: self.registry.clone(),
            codec,
            delivery: delivery.clone(),
            receiver: Arc::new(receiver),
            transfers: self.transfers.clone(),
            incoming: incoming.queues(),
            on_message: self.on_message.clone(),
            metrics: self.metrics.clone(),
            shutdown: shutdown.clone(),
            connections: Mutex::new(Vec::new()),
        });

        outgoing.start(delivery.processor())?;
        incoming.start(incoming_processor(build_dispatcher(&core)?))?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(core.clone(), listener, None)));
        if let (Some(listener), Some(acceptor)) = (tls_listener, acceptor) {
            tasks.push(tokio::spawn(accept_loop(core.clone(), listener, Some(acceptor))));
        }
        tasks.push(tokio::spawn(heartbeat_monitor(core.clone())));
        if enable_monitoring {
            tasks.push(tokio::spawn(monitoring_task(
                core.clone(),
                self.monitoring_interval_ms.clone(),
            )));
        }

        info!(
            %local_addr,
            tls_addr = ?tls_local_addr,
            monitoring = enable_monitoring,
            "Server started"
        );

        self.running = Some(Running {
            core,
            incoming,
            outgoing,
            tasks,
            local_addr,
            tls_local_addr,
        });
        Ok(())
    }

    /// Cancel everything, drain the pools and close all connections.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Stopping server");
        let core = running.core;
        core.shutdown.cancel();

        futures::join!(running.incoming.shutdown(), running.outgoing.shutdown());

        for handle in self.registry.disconnect_all() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle.shutdown()).await;
        }

        let mut tasks = running.tasks;
        tasks.extend(std::mem::take(&mut *core.connections.lock()));
        let wait_all = futures::future::join_all(tasks);
        if tokio::time::timeout(self.config.server.shutdown_timeout, wait_all)
            .await
            .is_err()
        {
            warn!("Shutdown timeout elapsed with tasks still running");
        }

        let pending = core.delivery.resume_queues().total();
        if pending > 0 {
            warn!(pending, "Undelivered messages discarded at shutdown");
        }
        info!("Server stopped");
    }

    fn core(&self) -> Result<&Arc<ServerCore>> {
        self.running
            .as_ref()
            .map(|r| &r.core)
            .ok_or_else(|| ProtocolError::InvalidOperation("server is not running".to_string()))
    }

    /// Queue `data` for `client_id`. Offline clients get it on reconnect.
    pub fn send(&self, client_id: ClientId, data: CommunicationData, priority: Priority) -> Result<()> {
        self.core()?.delivery.enqueue(client_id, data, priority)
    }

    /// Queue a text message.
    pub fn send_message<S: Into<String>>(
        &self,
        client_id: ClientId,
        message: S,
        priority: Priority,
    ) -> Result<()> {
        self.send(client_id, CommunicationData::normal(message, priority), priority)
    }

    /// Send a file to a client and return once every chunk is acknowledged.
    pub async fn send_file<P: AsRef<Path>>(
        &self,
        client_id: ClientId,
        path: P,
        priority: Priority,
    ) -> Result<PendingCompletion> {
        let core = self.core()?;
        if !self.registry.contains(client_id) {
            return Err(ProtocolError::ClientNotConnected(client_id));
        }
        let sink = Arc::new(Outbound::new(core.delivery.clone(), client_id));
        FileSender::new(client_id, sink, self.transfers.clone(), self.config.transfer.clone())
            .with_priority(priority)
            .send(path)
            .await
    }

    /// Drop a client's connection. Returns `false` if it was not connected.
    pub fn disconnect(&self, client_id: ClientId) -> bool {
        self.registry.remove(client_id).is_some()
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.registry.ids()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.tls_local_addr)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Messages waiting in `client_id`'s resume queue
    pub fn pending_resume(&self, client_id: ClientId) -> usize {
        self.running
            .as_ref()
            .map_or(0, |r| r.core.delivery.pending_resume(client_id))
    }

    /// Change the monitoring report interval; takes effect after the current wait.
    pub fn set_monitoring_interval(&self, interval: Duration) {
        self.monitoring_interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Relaxed);
    }
}

fn incoming_processor(dispatcher: Dispatcher) -> Processor<IncomingMessage> {
    Arc::new(move |message: IncomingMessage| {
        let dispatcher = dispatcher.clone();
        async move {
            trace!(
                client_id = message.client_id,
                queued_ms = message.received_at.elapsed().as_millis() as u64,
                "Dequeued incoming message"
            );
            dispatcher.dispatch(message.client_id, message.data).await
        }
        .boxed()
    })
}

/// One handler per message kind the server accepts.
fn build_dispatcher(core: &Arc<ServerCore>) -> Result<Dispatcher> {
    let dispatcher = Dispatcher::new();

    let c = core.clone();
    dispatcher.register(InfoType::Heartbeat, move |client_id, _| {
        let c = c.clone();
        async move {
            c.registry.touch(client_id);
            c.delivery
                .enqueue(client_id, CommunicationData::heartbeat(), Priority::High)
        }
        .boxed()
    })?;

    let c = core.clone();
    dispatcher.register(InfoType::Normal, move |client_id, data| {
        let c = c.clone();
        async move {
            let (seq_num, priority) = (data.seq_num, data.priority);
            if let Content::Normal { message } = data.content {
                debug!(client_id, seq_num, %priority, "Normal message received");
                if let Some(callback) = &c.on_message {
                    callback(client_id, message);
                }
            }
            c.delivery.enqueue(
                client_id,
                CommunicationData::acknowledgement(seq_num, priority),
                priority,
            )
        }
        .boxed()
    })?;

    let c = core.clone();
    dispatcher.register(InfoType::FileChunk, move |client_id, data| {
        let c = c.clone();
        async move {
            let Content::FileChunk(chunk) = data.content else {
                return Err(ProtocolError::UnexpectedMessage);
            };
            let (file_id, index) = (chunk.file_id.clone(), chunk.chunk_index);
            if c.receiver.handle_chunk(client_id, chunk).await? {
                c.delivery.enqueue(
                    client_id,
                    CommunicationData::chunk_ack(file_id, index),
                    Priority::High,
                )?;
            }
            Ok(())
        }
        .boxed()
    })?;

    let c = core.clone();
    dispatcher.register(InfoType::FileComplete, move |client_id, data| {
        let c = c.clone();
        async move {
            let Content::FileComplete(complete) = data.content else {
                return Err(ProtocolError::UnexpectedMessage);
            };
            let file_id = complete.file_id.clone();
            let ack = match c.receiver.handle_complete(client_id, complete).await {
                Ok(Some(path)) => Some(CommunicationData::file_complete_ack(
                    file_id,
                    true,
                    stored_file_name(&path),
                )),
                Ok(None) => None,
                Err(e) => Some(CommunicationData::file_complete_ack(file_id, false, e.to_string())),
            };
            match ack {
                Some(ack) => c.delivery.enqueue(client_id, ack, Priority::High),
                None => Ok(()),
            }
        }
        .boxed()
    })?;

    let c = core.clone();
    dispatcher.register(InfoType::ChunkAck, move |client_id, data| {
        let c = c.clone();
        async move {
            if let Content::ChunkAck {
                file_id,
                chunk_index,
            } = data.content
            {
                trace!(client_id, %file_id, chunk_index, "Chunk acknowledged");
                c.transfers.record_ack(client_id, &file_id, chunk_index);
            }
            Ok(())
        }
        .boxed()
    })?;

    let c = core.clone();
    dispatcher.register(InfoType::FileCompleteAck, move |client_id, data| {
        let c = c.clone();
        async move {
            if let Content::FileCompleteAck {
                file_id,
                success,
                detail,
            } = data.content
            {
                if success {
                    info!(client_id, %file_id, "Client confirmed file");
                } else {
                    error!(client_id, %file_id, %detail, "Client rejected file");
                }
                c.transfers.record_completion(client_id, &file_id, success, detail);
            }
            Ok(())
        }
        .boxed()
    })?;

    dispatcher.register(InfoType::Acknowledgement, |client_id, data| {
        async move {
            trace!(client_id, ack_num = data.ack_num, "Acknowledgement received");
            Ok(())
        }
        .boxed()
    })?;

    // Welcome is server-only and Reconnect never leaves the read path
    for kind in [InfoType::Welcome, InfoType::Reconnect] {
        dispatcher.register(kind, move |client_id, _| {
            async move {
                debug!(client_id, info_type = %kind, "Ignoring server-only message from client");
                Ok(())
            }
            .boxed()
        })?;
    }

    Ok(dispatcher)
}

async fn accept_loop(core: Arc<ServerCore>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    let kind = if acceptor.is_some() {
        TransportKind::Tls
    } else {
        TransportKind::Plain
    };
    loop {
        let accepted = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, ?kind, "Accept error");
                continue;
            }
        };

        if core.registry.len() >= core.config.server.max_connections {
            warn!(%peer, "Max connections reached, rejecting");
            continue;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn_core = core.clone();
        let acceptor = acceptor.clone();
        let task = tokio::spawn(async move {
            match acceptor {
                None => serve_connection(conn_core, stream, peer, TransportKind::Plain).await,
                Some(acceptor) => accept_tls(conn_core, acceptor, stream, peer).await,
            }
        });

        let mut connections = core.connections.lock();
        connections.retain(|t| !t.is_finished());
        connections.push(task);
    }
    debug!(?kind, "Accept loop stopped");
}

async fn accept_tls(core: Arc<ServerCore>, acceptor: TlsAcceptor, stream: TcpStream, peer: SocketAddr) {
    let handshake = with_timeout_error(
        async { acceptor.accept(stream).await.map_err(ProtocolError::from) },
        core.config.server.send_timeout,
    );
    match handshake.await {
        Ok(tls_stream) => serve_connection(core, tls_stream, peer, TransportKind::Tls).await,
        Err(e) => {
            core.metrics.tls_handshake_failed();
            warn!(%peer, error = %e, "TLS handshake failed");
        }
    }
}

/// Register a connection, greet it and run its read loop until either side hangs up.
#[instrument(skip_all, fields(%peer, ?kind))]
async fn serve_connection<S>(core: Arc<ServerCore>, stream: S, peer: SocketAddr, kind: TransportKind)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let id = core.registry.next_id();
    let cancel = core.shutdown.child_token();
    let handle = core
        .registry
        .register_with_id(id, kind, Some(peer), Box::new(write_half), cancel.clone());
    core.metrics.connection_established();
    info!(client_id = id, "Client connected");

    if let Err(e) = core.delivery.send_direct(&handle, &CommunicationData::welcome(id)).await {
        warn!(client_id = id, error = %e, "Failed to send welcome");
    } else {
        core.delivery.flush_resume(id);
        read_loop(&core, &handle, read_half, &cancel).await;
    }

    let client_id = handle.id();
    core.registry.remove_if_same(client_id, &handle);
    let _ = tokio::time::timeout(Duration::from_millis(500), handle.shutdown()).await;
    core.receiver.on_client_disconnected(client_id).await;
    core.metrics.connection_closed();
    info!(
        client_id,
        connected_ms = handle.connected_for().as_millis() as u64,
        "Client disconnected"
    );
}

async fn read_loop<R>(core: &Arc<ServerCore>, handle: &Arc<ClientHandle>, reader: R, cancel: &CancellationToken)
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FramedRead::new(reader, core.codec.frame_codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Ok(packet))) => {
                let frame_len = packet.frame_len();
                match core.codec.decode_packet(&packet) {
                    Ok(data) => on_frame(core, handle, data, frame_len).await,
                    Err(e) => {
                        core.metrics.frame_rejected(&e);
                        warn!(client_id = handle.id(), error = %e, "Undecodable payload dropped");
                    }
                }
            }
            Some(Ok(Err(e))) => {
                core.metrics.frame_rejected(&e);
                warn!(client_id = handle.id(), error = %e, "Invalid frame dropped");
            }
            Some(Err(e)) => {
                debug!(client_id = handle.id(), error = %e, "Transport error");
                break;
            }
            None => {
                debug!(client_id = handle.id(), "Connection closed by peer");
                break;
            }
        }
    }
}

async fn on_frame(core: &Arc<ServerCore>, handle: &Arc<ClientHandle>, data: CommunicationData, frame_len: usize) {
    handle.touch();
    handle.record_received(frame_len, data.is_file_traffic());
    core.metrics.frame_received(frame_len as u64);

    if let Content::Reconnect { client_id } = data.content {
        reclaim_id(core, handle, client_id).await;
        return;
    }

    let priority = data.priority;
    let message = IncomingMessage {
        client_id: handle.id(),
        data,
        received_at: Instant::now(),
    };
    if let Err(e) = core.incoming.enqueue(priority, message) {
        error!(client_id = handle.id(), error = %e, "Incoming queue closed");
    }
}

/// Move a connection back to the id it had before, then replay what it missed.
async fn reclaim_id(core: &Arc<ServerCore>, handle: &Arc<ClientHandle>, previous: ClientId) {
    let current = handle.id();
    let assigned = if previous == current {
        current
    } else if !core.registry.is_issued(previous) {
        warn!(client_id = current, previous, "Reconnect to an id never issued refused");
        current
    } else {
        match core.registry.rekey(current, previous) {
            Ok(_) => {
                core.receiver.on_client_disconnected(current).await;
                info!(from = current, client_id = previous, "Client resumed previous id");
                previous
            }
            Err(e) => {
                warn!(client_id = current, previous, error = %e, "Reconnect refused");
                current
            }
        }
    };

    if let Err(e) = core
        .delivery
        .send_direct(handle, &CommunicationData::welcome(assigned))
        .await
    {
        warn!(client_id = assigned, error = %e, "Failed to send welcome");
        return;
    }
    core.delivery.flush_resume(assigned);
}

async fn heartbeat_monitor(core: Arc<ServerCore>) {
    let timeout = core.config.server.heartbeat_timeout;
    let interval = core.config.server.heartbeat_check_interval;
    while cancellable_sleep(interval, &core.shutdown).await {
        for client_id in core.registry.stale_clients(timeout) {
            warn!(
                client_id,
                timeout_ms = timeout.as_millis() as u64,
                "Heartbeat timeout, disconnecting client"
            );
            core.registry.remove(client_id);
        }
    }
}

async fn monitoring_task(core: Arc<ServerCore>, interval_ms: Arc<AtomicU64>) {
    loop {
        let interval = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
        if !cancellable_sleep(interval, &core.shutdown).await {
            break;
        }
        core.metrics.log_metrics();
        info!(
            clients = core.registry.len(),
            incoming_queued = core.incoming.total_depth(),
            resume_pending = core.delivery.resume_queues().total(),
            sessions = core.receiver.active_sessions(),
            transfers_in_flight = core.transfers.in_flight(),
            "Server status"
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn test_config() -> NetworkConfig {
        NetworkConfig::default_with_overrides(|c| {
            c.server.address = "127.0.0.1:0".to_string();
            c.server.output_root = std::env::temp_dir().join("tiered-link-server-unit");
        })
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let mut server = Server::new(test_config()).unwrap();
        assert!(server.local_addr().is_none());
        server.start(false).await.unwrap();
        assert!(server.local_addr().is_some());
        assert!(matches!(
            server.start(false).await,
            Err(ProtocolError::InvalidOperation(_))
        ));
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_send_requires_running_server() {
        let server = Server::new(test_config()).unwrap();
        let result = server.send_message(1, "hi", Priority::Low);
        assert!(matches!(result, Err(ProtocolError::InvalidOperation(_))));
        assert_eq!(server.pending_resume(1), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = "not an address".to_string();
        });
        assert!(matches!(
            Server::new(config),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_send_is_parked() {
        let mut server = Server::new(test_config()).unwrap();
        server.start(false).await.unwrap();
        server.send_message(42, "later", Priority::High).unwrap();
        for _ in 0..200 {
            if server.pending_resume(42) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.pending_resume(42), 1);
        server.stop().await;
    }
}
