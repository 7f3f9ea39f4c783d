//! Byte relay between stdio and a socket session
//!
//! Two pumps run per session and share one cancellation token: local→remote
//! copies stdin into the socket, remote→local copies the socket into stdout.
//! A socket failure ends the session and a new one is opened while stdio stays
//! untouched; stdio closing ends the relay for good.

mod framed;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::transport::{Connector, Reconnect, TransportError};

pub use framed::FramedRelay;

const CHUNK_SIZE: usize = 4096;

/// How one pump finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Local stdio is gone; nothing left to relay for
    Terminal,
    /// The socket failed; a new session may be opened
    Recoverable,
    /// Stopped because the other pump ended the session
    Cancelled,
}

/// Decide what follows a session from its two pump outcomes
pub fn session_verdict(outcomes: [PumpOutcome; 2]) -> PumpOutcome {
    if outcomes.contains(&PumpOutcome::Terminal) {
        PumpOutcome::Terminal
    } else if outcomes.contains(&PumpOutcome::Recoverable) {
        PumpOutcome::Recoverable
    } else {
        PumpOutcome::Cancelled
    }
}

/// Summary returned once stdio closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayExit {
    pub sessions: u64,
}

/// Stdio ↔ socket byte relay
pub struct Relay<C, I, O> {
    connector: C,
    input: I,
    output: O,
    retry: Reconnect,
}

impl<C, I, O> Relay<C, I, O>
where
    C: Connector,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(connector: C, input: I, output: O) -> Self {
        Self {
            connector,
            input,
            output,
            retry: Reconnect::default(),
        }
    }

    pub fn with_reconnect(mut self, retry: Reconnect) -> Self {
        self.retry = retry;
        self
    }

    /// Relay until local stdio closes.
    ///
    /// Fails only when the retry policy gives up on opening a socket session.
    pub async fn run(mut self) -> Result<RelayExit, TransportError> {
        let mut sessions = 0u64;

        loop {
            let socket = match self.connector.connect().await {
                Ok(socket) => {
                    self.retry.succeeded();
                    socket
                }
                Err(e) => {
                    self.retry.failed(e, &self.connector.describe()).await?;
                    continue;
                }
            };

            sessions += 1;
            log::info!("Session {} opened via {}", sessions, self.connector.describe());

            let outcomes = run_session(socket, &mut self.input, &mut self.output).await;
            log::debug!("Session {} pumps finished: {:?}", sessions, outcomes);

            match session_verdict(outcomes) {
                PumpOutcome::Terminal => {
                    log::info!("Local stdio closed, relay exiting after {} sessions", sessions);
                    return Ok(RelayExit { sessions });
                }
                _ => log::warn!("Session {} lost its socket, reconnecting", sessions),
            }
        }
    }
}

/// Run both pumps over one socket until either ends the session
pub async fn run_session<S, I, O>(socket: S, input: &mut I, output: &mut O) -> [PumpOutcome; 2]
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (mut remote_read, mut remote_write) = tokio::io::split(socket);
    let cancel = CancellationToken::new();

    let (outbound, inbound) = tokio::join!(
        pump_local_to_remote(input, &mut remote_write, &cancel),
        pump_remote_to_local(&mut remote_read, output, &cancel),
    );

    if let Err(e) = remote_write.shutdown().await {
        log::debug!("Socket shutdown after session: {}", e);
    }
    [outbound, inbound]
}

async fn pump_local_to_remote<I, W>(input: &mut I, remote: &mut W, cancel: &CancellationToken) -> PumpOutcome
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let count = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            read = input.read(&mut chunk) => match read {
                Ok(count) => count,
                Err(e) => {
                    log::error!("Failed to read local input: {}", e);
                    cancel.cancel();
                    return PumpOutcome::Terminal;
                }
            },
        };

        if count == 0 {
            log::info!("Local input reached end of stream");
            cancel.cancel();
            return PumpOutcome::Terminal;
        }

        // A chunk that started writing is finished before cancellation is seen again
        if let Err(e) = write_chunk(remote, &chunk[..count]).await {
            log::warn!("Failed to write to socket: {}", e);
            cancel.cancel();
            return PumpOutcome::Recoverable;
        }
    }
}

async fn pump_remote_to_local<R, O>(remote: &mut R, output: &mut O, cancel: &CancellationToken) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let count = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            read = remote.read(&mut chunk) => match read {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("Failed to read from socket: {}", e);
                    cancel.cancel();
                    return PumpOutcome::Recoverable;
                }
            },
        };

        if count == 0 {
            log::info!("Socket peer closed the session");
            cancel.cancel();
            return PumpOutcome::Recoverable;
        }

        if let Err(e) = write_chunk(output, &chunk[..count]).await {
            log::error!("Failed to write local output: {}", e);
            cancel.cancel();
            return PumpOutcome::Terminal;
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
