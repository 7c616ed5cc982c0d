//! One secured link to a peer container.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use log::debug;
use parking_lot::Mutex as SyncMutex;
use rustls::pki_types::CertificateDer;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use super::frame::{self, ControlFrame};
use crate::error::NetworkError;
use crate::tls;

/// Upper bound on a single frame write.
pub const FRAME_SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A link to a peer container.
///
/// Writes are serialized by the writer lock so concurrent dispatchers never
/// interleave bytes.  The read half is driven by a task owned by the
/// router; the channel only keeps its handle so closing stops it.
///
/// The remote container identity is fixed once: at dial time from the
/// verified server name, or for accepted links from the first sender the
/// client certificate names.
pub struct Channel {
    id: u64,
    peer_addr: SocketAddr,
    identity: OnceLock<String>,
    peer_certificate: Option<CertificateDer<'static>>,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    bound: AtomicBool,
    connected: AtomicBool,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        peer_certificate: Option<CertificateDer<'static>>,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            id,
            peer_addr,
            identity: OnceLock::new(),
            peer_certificate,
            writer: Mutex::new(FramedWrite::new(writer, frame::codec())),
            bound: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            reader: SyncMutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Pins the identity of a dialed link, already verified as the TLS
    /// server name.
    #[must_use]
    pub(crate) fn with_identity(self, container: impl Into<String>) -> Self {
        let _ = self.identity.set(container.into());
        self
    }

    /// Authenticated remote container name, if known yet.
    pub fn remote(&self) -> Option<String> {
        self.identity.get().cloned()
    }

    /// True when `container` may speak over this link.
    ///
    /// Once the identity is pinned only that container is accepted.  Until
    /// then the peer certificate must name `container`, which then becomes
    /// the identity.
    pub fn authenticate(&self, container: &str) -> bool {
        if let Some(identity) = self.identity.get() {
            return identity == container;
        }
        let Some(certificate) = &self.peer_certificate else {
            return false;
        };
        if !tls::certificate_names(certificate, container) {
            return false;
        }
        self.identity.get_or_init(|| container.to_owned()) == container
    }

    /// The socket is open and has not failed.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire) && self.connected.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// No other writer currently holds the socket.
    pub fn is_writable(&self) -> bool {
        self.is_connected() && self.writer.try_lock().is_ok()
    }

    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock() = Some(handle);
    }

    /// Called by the reader itself before it tears the link down, so
    /// closing does not abort the task doing the closing.
    pub(crate) fn detach_reader(&self) {
        self.reader.lock().take();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Writes one control frame.
    pub async fn send(&self, frame: &ControlFrame) -> Result<(), NetworkError> {
        let bytes = frame::encode(frame)?;
        let mut writer = self.writer.lock().await;
        let result = timeout(FRAME_SEND_TIMEOUT, writer.send(bytes))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: "frame send".into(),
            })
            .and_then(|sent| sent.map_err(NetworkError::from));
        if result.is_err() {
            self.mark_disconnected();
        }
        result
    }

    /// Marks the link dead, stops its reader and flushes a close to the peer.
    pub async fn close(&self) {
        self.bound.store(false, Ordering::Release);
        self.mark_disconnected();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let mut writer = self.writer.lock().await;
        match timeout(Duration::from_secs(1), SinkExt::<Bytes>::close(&mut *writer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Channel {} close failed: {}", self.id, e),
            Err(_) => debug!("Channel {} close timed out", self.id),
        }
    }

    #[cfg(test)]
    pub(crate) async fn lock_writer(
        &self,
    ) -> tokio::sync::MutexGuard<'_, FramedWrite<BoxedWriter, LengthDelimitedCodec>> {
        self.writer.lock().await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("remote", &self.remote())
            .field("bound", &self.is_bound())
            .finish()
    }
}
