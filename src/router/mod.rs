//! Inter-container message router.
//!
//! The router owns the container's secured listening endpoint and one
//! [`Channel`] per reachable peer container.  Routing is container
//! granular: every role of a container shares its link.  Outbound links
//! leave behind a [`ReconnectionInfo`] so a dropped link can be redialed
//! without asking the application layer again.
//!
//! Locking: the routing table, the reconnection table and the set of open
//! channels each have their own lock, and none of them is held across a dial
//! or a write.

pub mod channel;
pub mod frame;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use rustls::pki_types::ServerName;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

pub use channel::Channel;
use frame::{ControlFrame, Decoded};

use crate::certificate::{CertificateStore, RoleCertificate};
use crate::error::{is_transient_io, NetworkError};
use crate::message::Message;
use crate::tls::{Credentials, TlsConfig};
use crate::types::{params, Operation, QualifiedName};

/// Wait before redialing a container whose link went down.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(15);

/// Wait once for a busy socket to drain before writing anyway.
pub const WRITE_DRAIN_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on establishing the TCP connection of an outbound link.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the TLS handshake, on both the dialing and accepting side.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a certificate request waits for the peer's answer.
pub const CERTIFICATE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ports below this bound are well-known and refused by [`Router::listen`].
pub const FIRST_UNRESERVED_PORT: u16 = 1024;

/// Capacity of the channel feeding inbound messages to the dispatch core.
const INBOUND_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name of the local container.
    pub container: String,
    pub bind_ip: IpAddr,
    pub reconnect_backoff: Duration,
    pub write_drain_delay: Duration,
}

impl RouterConfig {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reconnect_backoff: RECONNECT_BACKOFF,
            write_drain_delay: WRITE_DRAIN_DELAY,
        }
    }
}

/// Everything needed to redial a container without application input.
#[derive(Debug, Clone)]
pub struct ReconnectionInfo {
    pub container: String,
    pub host: String,
    pub port: u16,
    pub alias: String,
    pub credential: TlsConfig,
}

/// Dial parameters carried inside a `SeedConnectionRequestInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRequest {
    pub host: String,
    pub port: u16,
    pub alias: String,
}

impl SeedRequest {
    pub fn from_message(message: &Message) -> Result<Self, NetworkError> {
        let host = message
            .parameter_str(params::HOST)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NetworkError::InvalidSeed("missing host".into()))?;
        let port = message
            .parameter(params::PORT)
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| NetworkError::InvalidSeed("missing or invalid port".into()))?;
        let alias = message
            .parameter_str(params::CERTIFICATE_ALIAS)
            .ok_or_else(|| NetworkError::InvalidSeed("missing certificate alias".into()))?;
        Ok(Self {
            host: host.to_owned(),
            port,
            alias: alias.to_owned(),
        })
    }

    /// Builds the seed message from `sender` to a role of the seed container.
    pub fn to_message(&self, sender: QualifiedName, recipient: QualifiedName) -> Message {
        Message::builder(sender, recipient, Operation::SeedConnectionRequestInfo)
            .parameter(params::HOST, self.host.clone())
            .parameter(params::PORT, self.port)
            .parameter(params::CERTIFICATE_ALIAS, self.alias.clone())
            .build()
    }
}

struct PendingCertificate {
    channel: u64,
    waiter: oneshot::Sender<Option<RoleCertificate>>,
}

pub struct Router {
    config: RouterConfig,
    credentials: Arc<Credentials>,
    certificates: Arc<CertificateStore>,
    /// Remote container name -> link used to reach it.
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    reconnection: RwLock<HashMap<String, ReconnectionInfo>>,
    /// Every live link by id, bound to a container or not.
    open: SyncMutex<HashMap<u64, Arc<Channel>>>,
    /// Outstanding certificate requests by id, with the link they went out on.
    pending_certificates: SyncMutex<HashMap<u64, PendingCertificate>>,
    next_id: AtomicU64,
    inbound_tx: mpsc::Sender<Message>,
    listener: SyncMutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Router {
    /// Creates the router and the receiver on which inbound messages are
    /// handed to the dispatch core.
    pub fn new(
        config: RouterConfig,
        credentials: Arc<Credentials>,
        certificates: Arc<CertificateStore>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let router = Arc::new(Self {
            config,
            credentials,
            certificates,
            channels: RwLock::new(HashMap::new()),
            reconnection: RwLock::new(HashMap::new()),
            open: SyncMutex::new(HashMap::new()),
            pending_certificates: SyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbound_tx,
            listener: SyncMutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        (router, inbound_rx)
    }

    pub fn container(&self) -> &str {
        &self.config.container
    }

    /// Binds the secured listener.  Port 0 picks an ephemeral port.
    pub async fn listen(self: &Arc<Self>, port: u16) -> Result<SocketAddr, NetworkError> {
        if port != 0 && port < FIRST_UNRESERVED_PORT {
            return Err(NetworkError::ReservedPort(port));
        }
        let acceptor = self.credentials.default_config()?.acceptor();
        let listener = TcpListener::bind((self.config.bind_ip, port)).await?;
        let local = listener.local_addr()?;
        info!("Container {} listening on {}", self.config.container, local);

        let router = Arc::clone(self);
        let handle = tokio::spawn(async move { router.accept_loop(listener, acceptor).await });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            let (tcp, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.is_shut_down() {
                        return;
                    }
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let router = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => {
                        match router.install_stream(TlsStream::Server(stream), addr, None).await {
                            Ok(channel) => debug!("Accepted channel {} from {}", channel.id(), addr),
                            Err(e) => debug!("Dropping link from {}: {}", addr, e),
                        }
                    }
                    Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", addr, e),
                    Err(_) => warn!("TLS handshake with {} timed out", addr),
                }
            });
        }
    }

    /// Dials `remote`, records the link and the reconnection info for it.
    pub async fn open_channel(
        self: &Arc<Self>,
        remote: &str,
        host: &str,
        port: u16,
        alias: &str,
    ) -> Result<Arc<Channel>, NetworkError> {
        let credential = self.credentials.get(alias)?;
        let info = ReconnectionInfo {
            container: remote.to_owned(),
            host: host.to_owned(),
            port,
            alias: alias.to_owned(),
            credential,
        };
        self.dial(info).await
    }

    async fn dial(self: &Arc<Self>, info: ReconnectionInfo) -> Result<Arc<Channel>, NetworkError> {
        if self.is_shut_down() {
            return Err(NetworkError::ShutDown);
        }
        let stream = match self.connect(&info).await {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_transient() {
                    info!("Container {} at {}:{} unreachable: {}", info.container, info.host, info.port, e);
                } else {
                    warn!("Dialing {} at {}:{} failed: {}", info.container, info.host, info.port, e);
                }
                return Err(e);
            }
        };
        let addr = stream.get_ref().0.peer_addr()?;
        let channel = self
            .install_stream(TlsStream::Client(stream), addr, Some(info.container.clone()))
            .await?;

        let (winner, replaced) = {
            let mut table = self.channels.write().await;
            match table.get(&info.container) {
                Some(existing) if existing.is_bound() && !Arc::ptr_eq(existing, &channel) => {
                    (Some(Arc::clone(existing)), None)
                }
                _ => (None, table.insert(info.container.clone(), Arc::clone(&channel))),
            }
        };
        let container = info.container.clone();
        self.reconnection
            .write()
            .await
            .insert(container.clone(), info.clone());

        if let Some(existing) = winner {
            debug!("Concurrent dial to {} lost, reusing channel {}", container, existing.id());
            self.evict(&channel).await;
            return Ok(existing);
        }
        if let Some(stale) = replaced {
            self.evict(&stale).await;
        }
        info!(
            "Opened channel {} to {} at {}:{}",
            channel.id(),
            container,
            info.host,
            info.port
        );
        Ok(channel)
    }

    async fn connect(
        &self,
        info: &ReconnectionInfo,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, NetworkError> {
        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((info.host.as_str(), info.port)))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: "TCP connect".into(),
            })??;
        // The peer must present a certificate naming the container we meant to reach.
        let server_name = ServerName::try_from(info.container.clone())
            .map_err(|e| NetworkError::Handshake(format!("invalid container name: {e}")))?;
        timeout(
            TLS_HANDSHAKE_TIMEOUT,
            info.credential.connector().connect(server_name, tcp),
        )
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "TLS handshake".into(),
        })?
        .map_err(|e| NetworkError::Handshake(e.to_string()))
    }

    /// Tracks a freshly handshaken link and starts its reader.  `remote` is
    /// the verified server name of a dialed link.
    ///
    /// Fails with [`NetworkError::ShutDown`] when the router was shut down
    /// while the handshake was in flight; the link is closed.
    async fn install_stream(
        self: &Arc<Self>,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        remote: Option<String>,
    ) -> Result<Arc<Channel>, NetworkError> {
        let peer_certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .cloned();
        let (read, write) = tokio::io::split(stream);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channel = Channel::new(id, addr, peer_certificate, Box::new(write));
        if let Some(remote) = remote {
            channel = channel.with_identity(remote);
        }
        let channel = Arc::new(channel);
        self.open.lock().insert(id, Arc::clone(&channel));

        let router = Arc::clone(self);
        let reader_channel = Arc::clone(&channel);
        let handle = tokio::spawn(async move {
            let frames = FramedRead::new(read, frame::codec());
            router.read_loop(reader_channel, frames).await;
        });
        channel.attach_reader(handle);

        // Shutdown drains `open` after raising the flag, so a link inserted
        // too late is caught here.
        if self.is_shut_down() {
            self.retire(&channel).await;
            return Err(NetworkError::ShutDown);
        }
        Ok(channel)
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        channel: Arc<Channel>,
        mut frames: FramedRead<R, LengthDelimitedCodec>,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            match frames.next().await {
                Some(Ok(bytes)) => match frame::decode(&bytes) {
                    Ok(Decoded::Control(frame)) => self.on_control_frame(&channel, frame).await,
                    Ok(Decoded::Foreign(tag)) => {
                        debug!("Skipping frame for protocol {:#04x} on channel {}", tag, channel.id());
                    }
                    Err(e) => warn!("Malformed frame from {}: {}", channel.peer_addr(), e),
                },
                Some(Err(e)) => {
                    channel.detach_reader();
                    self.on_reader_error(&channel, &e).await;
                    return;
                }
                None => {
                    info!("Channel {} to {} closed by peer", channel.id(), channel.peer_addr());
                    channel.detach_reader();
                    self.evict(&channel).await;
                    return;
                }
            }
        }
    }

    async fn on_control_frame(self: &Arc<Self>, channel: &Arc<Channel>, frame: ControlFrame) {
        match frame {
            ControlFrame::Message(message) => self.on_inbound_message(channel, message).await,
            ControlFrame::CertificateRequest {
                request_id,
                subject,
            } => {
                let certificate = self.certificates.certificate_for(&subject);
                if certificate.is_none() {
                    debug!("Peer asked for unknown certificate {}", subject);
                }
                let response = ControlFrame::CertificateResponse {
                    request_id,
                    certificate,
                };
                if let Err(e) = channel.send(&response).await {
                    self.on_send_failure(channel, &e).await;
                }
            }
            ControlFrame::CertificateResponse {
                request_id,
                certificate,
            } => {
                let pending = {
                    let mut pending = self.pending_certificates.lock();
                    let asked_on = pending.get(&request_id).map(|entry| entry.channel);
                    match asked_on {
                        Some(id) if id == channel.id() => pending.remove(&request_id),
                        Some(_) => {
                            warn!(
                                "Certificate response {} arrived on foreign channel {}",
                                request_id,
                                channel.id()
                            );
                            None
                        }
                        None => {
                            debug!("Late certificate response {}", request_id);
                            None
                        }
                    }
                };
                if let Some(entry) = pending {
                    let _ = entry.waiter.send(certificate);
                }
            }
        }
    }

    /// Binds the sender's container to the link it used, so replies travel
    /// back over the same socket, then hands the message to the dispatch core.
    ///
    /// Messages whose sender container is not the one the link
    /// authenticated as are dropped.
    pub async fn on_inbound_message(&self, channel: &Arc<Channel>, message: Message) {
        let sender_container = message.sender().container();
        if !channel.authenticate(sender_container) {
            warn!(
                "Dropping {} from {}: channel {} is not authenticated as {}",
                message.operation(),
                message.sender(),
                channel.id(),
                sender_container
            );
            return;
        }
        if sender_container != self.config.container {
            let mut table = self.channels.write().await;
            let rebind = table
                .get(sender_container)
                .map_or(true, |bound| !Arc::ptr_eq(bound, channel));
            if rebind {
                debug!("Binding {} to channel {}", sender_container, channel.id());
                table.insert(sender_container.to_owned(), Arc::clone(channel));
            }
        }
        if self.inbound_tx.send(message).await.is_err() {
            warn!("Dispatch core is gone, dropping inbound message");
        }
    }

    /// Transient causes are only logged; anything else evicts and closes
    /// the link.
    pub async fn on_connection_error(&self, channel: &Arc<Channel>, cause: &std::io::Error) {
        if is_transient_io(cause) {
            info!("Transient error on channel {} ({}): {}", channel.id(), channel.peer_addr(), cause);
            return;
        }
        warn!(
            "Channel {} to {} failed: {}; evicting",
            channel.id(),
            channel.remote().unwrap_or_else(|| channel.peer_addr().to_string()),
            cause
        );
        self.evict(channel).await;
    }

    /// The reader stopped on a read error, so the link is closed either way.
    /// A transient cause leaves the routing entry in place, down, so the
    /// next send redials it.
    async fn on_reader_error(&self, channel: &Arc<Channel>, cause: &std::io::Error) {
        if is_transient_io(cause) {
            info!("Channel {} ({}) lost: {}", channel.id(), channel.peer_addr(), cause);
            self.retire(channel).await;
        } else {
            self.on_connection_error(channel, cause).await;
        }
    }

    async fn on_send_failure(&self, channel: &Arc<Channel>, err: &NetworkError) {
        match err {
            NetworkError::Io(cause) => self.on_connection_error(channel, cause).await,
            other => {
                warn!("Write on channel {} failed: {}; evicting", channel.id(), other);
                self.evict(channel).await;
            }
        }
    }

    async fn evict(&self, channel: &Arc<Channel>) {
        self.channels
            .write()
            .await
            .retain(|_, bound| !Arc::ptr_eq(bound, channel));
        self.retire(channel).await;
    }

    /// Stops tracking and closes a link without touching the routing table.
    async fn retire(&self, channel: &Arc<Channel>) {
        self.open.lock().remove(&channel.id());
        channel.close().await;
    }

    /// Delivers a message whose recipient lives in another container.
    ///
    /// Returns `Ok` without sending when the link is known to be down and
    /// cannot be redialed; the drop is logged.
    pub async fn dispatch(self: &Arc<Self>, message: &Message) -> Result<(), NetworkError> {
        if self.is_shut_down() {
            return Err(NetworkError::ShutDown);
        }
        let container = message.recipient().container();
        let channel = match self.resolve(container, Some(message)).await? {
            Some(channel) => channel,
            None => return Ok(()),
        };
        self.write(&channel, &ControlFrame::Message(message.clone()))
            .await
    }

    /// Finds the link for `container`, redialing or seeding as allowed.
    async fn resolve(
        self: &Arc<Self>,
        container: &str,
        message: Option<&Message>,
    ) -> Result<Option<Arc<Channel>>, NetworkError> {
        let existing = self.channels.read().await.get(container).cloned();
        let reconnect = self.reconnection_info(container).await;

        match (existing, reconnect) {
            (Some(channel), _) if channel.is_bound() => Ok(Some(channel)),
            (Some(_), None) => {
                warn!(
                    "Link to {} is down and was never dialed from here; {} undeliverable",
                    container,
                    message.map_or("request", |m| m.operation().as_str())
                );
                Ok(None)
            }
            (_, Some(info)) => self.redial(info).await.map(Some),
            (None, None) => match message {
                Some(m) if *m.operation() == Operation::SeedConnectionRequestInfo => {
                    let seed = SeedRequest::from_message(m)?;
                    info!("Seeding link to {} at {}:{}", container, seed.host, seed.port);
                    self.open_channel(container, &seed.host, seed.port, &seed.alias)
                        .await
                        .map(Some)
                }
                _ => Err(NetworkError::NoRoute {
                    container: container.to_owned(),
                }),
            },
        }
    }

    async fn redial(self: &Arc<Self>, info: ReconnectionInfo) -> Result<Arc<Channel>, NetworkError> {
        warn!(
            "Link to {} is down, redialing {}:{} in {:?}",
            info.container, info.host, info.port, self.config.reconnect_backoff
        );
        sleep(self.config.reconnect_backoff).await;
        self.dial(info).await
    }

    async fn write(&self, channel: &Arc<Channel>, frame: &ControlFrame) -> Result<(), NetworkError> {
        if channel.is_connected() && !channel.is_writable() {
            debug!("Channel {} busy, waiting for it to drain", channel.id());
            sleep(self.config.write_drain_delay).await;
        }
        match channel.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.on_send_failure(channel, &e).await;
                Err(e)
            }
        }
    }

    /// Obtains a role certificate from the container hosting `subject`.
    pub async fn fetch_certificate(
        self: &Arc<Self>,
        subject: &QualifiedName,
    ) -> Result<RoleCertificate, NetworkError> {
        let unavailable = || NetworkError::CertificateUnavailable {
            subject: subject.clone(),
        };
        if subject.is_in_container(&self.config.container) {
            return self.certificates.certificate_for(subject).ok_or_else(unavailable);
        }

        let channel = self
            .resolve(subject.container(), None)
            .await?
            .ok_or_else(unavailable)?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_certificates.lock().insert(
            request_id,
            PendingCertificate {
                channel: channel.id(),
                waiter: tx,
            },
        );

        let request = ControlFrame::CertificateRequest {
            request_id,
            subject: subject.clone(),
        };
        if let Err(e) = self.write(&channel, &request).await {
            self.pending_certificates.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(CERTIFICATE_FETCH_TIMEOUT, rx).await {
            Ok(Ok(Some(certificate))) if certificate.subject() == subject => Ok(certificate),
            Ok(Ok(_)) | Ok(Err(_)) => Err(unavailable()),
            Err(_) => {
                self.pending_certificates.lock().remove(&request_id);
                Err(NetworkError::Timeout {
                    operation: format!("certificate fetch for {subject}"),
                })
            }
        }
    }

    pub async fn is_connected(&self, container: &str) -> bool {
        self.channels
            .read()
            .await
            .get(container)
            .is_some_and(|c| c.is_bound())
    }

    pub async fn reconnection_info(&self, container: &str) -> Option<ReconnectionInfo> {
        self.reconnection.read().await.get(container).cloned()
    }

    pub async fn connected_containers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.is_bound())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Closes the listener and every tracked link.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.channels.write().await.clear();
        let open: Vec<Arc<Channel>> = self.open.lock().drain().map(|(_, c)| c).collect();
        for channel in open {
            channel.close().await;
        }
        self.pending_certificates.lock().clear();
        info!("Router for {} shut down", self.config.container);
    }
}
