//! Socket connectors
//!
//! A connector produces a brand-new socket session each time it is asked,
//! either by accepting the next peer on a listener or by dialing out. Session
//! loops call it again after every recoverable failure.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio_util::codec::Framed;

use super::{FrameCodec, MessageTransport, TransportError};

/// Source of byte-stream socket sessions
pub trait Connector: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next session
    fn connect(&mut self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Human-readable endpoint for log lines
    fn describe(&self) -> String;
}

/// Source of message-transport sessions
pub trait TransportConnector: Send {
    type Transport: MessageTransport + 'static;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;

    fn describe(&self) -> String;
}

/// Wraps every byte-stream session of the inner connector in [`FrameCodec`]
#[derive(Debug)]
pub struct Framing<C> {
    inner: C,
    codec: FrameCodec,
}

impl<C: Connector> Framing<C> {
    pub fn new(inner: C, codec: FrameCodec) -> Self {
        Self { inner, codec }
    }
}

impl<C: Connector> TransportConnector for Framing<C> {
    type Transport = Framed<C::Stream, FrameCodec>;

    async fn connect(&mut self) -> Result<Self::Transport, TransportError> {
        let stream = self.inner.connect().await?;
        Ok(Framed::new(stream, self.codec))
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Listens on a Unix socket and accepts one peer per session
#[derive(Debug)]
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixAcceptor {
    pub fn bind<P: AsRef<Path>>(socket_path: P) -> Result<Self, TransportError> {
        let path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::Connection(format!(
                    "Failed to create socket directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Remove existing socket file if it exists
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::Connection(format!(
                    "Another relay is already listening at socket: {}",
                    path.display()
                ))
            } else {
                TransportError::Connection(format!("Failed to bind socket: {}", e))
            }
        })?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&path)
                .map_err(|e| {
                    TransportError::Connection(format!("Failed to read socket metadata: {}", e))
                })?
                .permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(&path, permissions).map_err(|e| {
                TransportError::Connection(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for UnixAcceptor {
    type Stream = UnixStream;

    async fn connect(&mut self) -> Result<UnixStream, TransportError> {
        let (stream, _) = self.listener.accept().await?;
        log::info!("Accepted socket peer on {}", self.path.display());
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("listener at {}", self.path.display())
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            log::warn!("Failed to remove socket file {}: {}", self.path.display(), e);
        }
    }
}

/// Dials a Unix socket for every session
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            path: socket_path.as_ref().to_path_buf(),
        }
    }
}

impl Connector for UnixDialer {
    type Stream = UnixStream;

    async fn connect(&mut self) -> Result<UnixStream, TransportError> {
        UnixStream::connect(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::Connection(format!(
                "Relay is not accepting connections at {}. Is 'playbridge relay' running?",
                self.path.display()
            )),
            std::io::ErrorKind::NotFound => TransportError::Connection(format!(
                "Relay socket not found at {}. Start it with 'playbridge relay'.",
                self.path.display()
            )),
            _ => TransportError::Connection(format!(
                "Failed to connect to relay at {}: {}",
                self.path.display(),
                e
            )),
        })
    }

    fn describe(&self) -> String {
        format!("socket at {}", self.path.display())
    }
}

/// Dials a TCP address for every session
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpDialer {
    type Stream = TcpStream;

    async fn connect(&mut self) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            TransportError::Connection(format!("Failed to connect to {}: {}", self.addr, e))
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Reconnect delay schedule: one step for the first attempt, two steps for
/// attempts two and three, five steps after that
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    step: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(step: Duration) -> Self {
        Self { step, attempt: 0 }
    }

    /// Failed attempts since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        match self.attempt {
            0..=1 => self.step,
            2..=3 => self.step * 2,
            _ => self.step * 5,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Retry policy for opening sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconnect {
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl Reconnect {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` consecutive failures
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn succeeded(&mut self) {
        self.backoff.reset();
    }

    /// Record a failed attempt and sleep before the next one, or give up
    pub async fn failed(&mut self, error: TransportError, target: &str) -> Result<(), TransportError> {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();

        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return Err(TransportError::GaveUp {
                target: target.to_string(),
                attempts: attempt,
                last: error.to_string(),
            });
        }

        log::warn!(
            "Could not reach {} (attempt {}): {}; retrying in {:?}",
            target,
            attempt,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let mut retry = Reconnect::new(Backoff::new(Duration::from_millis(1))).with_max_attempts(2);
        let first = retry
            .failed(TransportError::Connection("down".to_string()), "test")
            .await;
        assert!(first.is_ok());

        let second = retry
            .failed(TransportError::Connection("still down".to_string()), "test")
            .await;
        match second {
            Err(TransportError::GaveUp { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(last.contains("still down"));
            }
            other => panic!("expected GaveUp, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unix_acceptor_and_dialer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.sock");

        let mut acceptor = UnixAcceptor::bind(&path).unwrap();
        let mut dialer = UnixDialer::new(&path);

        let (accepted, dialed) = tokio::join!(acceptor.connect(), dialer.connect());
        let mut accepted = accepted.unwrap();
        let mut dialed = dialed.unwrap();

        dialed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(acceptor);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dialer_reports_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialer = UnixDialer::new(dir.path().join("missing.sock"));
        match dialer.connect().await {
            Err(TransportError::Connection(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }
}
