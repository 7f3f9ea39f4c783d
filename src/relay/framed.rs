//! Frame-aware relay
//!
//! Same session rules as the byte relay, but both sides are read as
//! length-prefixed frames so a reconnect never splits a frame: a frame is
//! either delivered whole to one session or not at all.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use futures::stream::{SplitSink, SplitStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{PumpOutcome, RelayExit, session_verdict};
use crate::transport::{FrameCodec, MessageTransport, Reconnect, TransportConnector, TransportError};

/// Stdio ↔ transport relay that forwards whole frames
pub struct FramedRelay<C, I, O> {
    connector: C,
    input: FramedRead<I, FrameCodec>,
    output: FramedWrite<O, FrameCodec>,
    retry: Reconnect,
}

impl<C, I, O> FramedRelay<C, I, O>
where
    C: TransportConnector,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(connector: C, input: I, output: O, codec: FrameCodec) -> Self {
        Self {
            connector,
            input: FramedRead::new(input, codec),
            output: FramedWrite::new(output, codec),
            retry: Reconnect::default(),
        }
    }

    pub fn with_reconnect(mut self, retry: Reconnect) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(mut self) -> Result<RelayExit, TransportError> {
        let mut sessions = 0u64;

        loop {
            let transport = match self.connector.connect().await {
                Ok(transport) => {
                    self.retry.succeeded();
                    transport
                }
                Err(e) => {
                    self.retry.failed(e, &self.connector.describe()).await?;
                    continue;
                }
            };

            sessions += 1;
            log::info!("Framed session {} opened via {}", sessions, self.connector.describe());

            let (mut sink, mut stream) = transport.split();
            let cancel = CancellationToken::new();
            let outcomes = tokio::join!(
                forward_local(&mut self.input, &mut sink, &cancel),
                forward_remote(&mut stream, &mut self.output, &cancel),
            );

            if let Err(e) = sink.close().await {
                log::debug!("Transport close after session: {}", e);
            }

            if session_verdict([outcomes.0, outcomes.1]) == PumpOutcome::Terminal {
                log::info!("Local stdio closed, framed relay exiting after {} sessions", sessions);
                return Ok(RelayExit { sessions });
            }
            log::warn!("Framed session {} lost its transport, reconnecting", sessions);
        }
    }
}

async fn forward_local<I, T>(
    input: &mut FramedRead<I, FrameCodec>,
    sink: &mut SplitSink<T, Bytes>,
    cancel: &CancellationToken,
) -> PumpOutcome
where
    I: AsyncRead + Unpin,
    T: MessageTransport,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            frame = input.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                if let Err(e) = sink.send(frame).await {
                    log::warn!("Failed to forward frame to transport: {}", e);
                    cancel.cancel();
                    return PumpOutcome::Recoverable;
                }
            }
            Some(Err(e)) => {
                log::error!("Failed to read frame from local input: {}", e);
                cancel.cancel();
                return PumpOutcome::Terminal;
            }
            None => {
                log::info!("Local input reached end of stream");
                cancel.cancel();
                return PumpOutcome::Terminal;
            }
        }
    }
}

async fn forward_remote<O, T>(
    stream: &mut SplitStream<T>,
    output: &mut FramedWrite<O, FrameCodec>,
    cancel: &CancellationToken,
) -> PumpOutcome
where
    O: AsyncWrite + Unpin,
    T: MessageTransport,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                if let Err(e) = output.send(frame).await {
                    log::error!("Failed to write frame to local output: {}", e);
                    cancel.cancel();
                    return PumpOutcome::Terminal;
                }
            }
            Some(Err(e)) => {
                log::warn!("Transport read failed: {}", e);
                cancel.cancel();
                return PumpOutcome::Recoverable;
            }
            None => {
                log::info!("Transport peer closed the session");
                cancel.cancel();
                return PumpOutcome::Recoverable;
            }
        }
    }
}
