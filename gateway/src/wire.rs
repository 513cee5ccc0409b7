//! Upstream TCP connection with reconnect/backoff.
//!
//! The wire is newline-delimited JSON in both directions: one line out per
//! command, one line in per frame. Reconnection follows the original
//! factory's schedule — 15s initial delay, doubling up to a 60s cap, reset
//! to 15s on the next successful connect.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::frame::InboundFrame;
use crate::Result;

/// Upstream never sends a line longer than this; exceeding it is fatal
/// (`RtxClient.lineLengthExceeded`).
pub const MAX_LINE_LENGTH: usize = 0x100_0000;

const INITIAL_DELAY: Duration = Duration::from_secs(15);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Delivered to the dispatcher for every inbound frame, plus disconnect
/// notification (`None` stands in for the original's null-sender signal).
pub enum WireEvent {
    Frame(InboundFrame),
    Disconnected,
    /// The session hit a condition `lineLengthExceeded` treats as
    /// unrecoverable rather than an ordinary drop: reconnect-with-backoff
    /// would just repeat it. The caller should force a disconnect.
    Fatal(String),
}

/// Owns the upstream socket and exposes a line-send handle plus an inbound
/// event stream. Reconnects internally; callers never see a dead socket,
/// only a `Disconnected` event followed eventually by frames resuming.
pub struct WireClient {
    host: String,
    port: u16,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl WireClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self { host: host.into(), port, outbound_tx, outbound_rx: Some(outbound_rx) }
    }

    /// A cloneable handle for sending outbound lines from anywhere in the
    /// engine without holding a reference to the client itself.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> { self.outbound_tx.clone() }

    /// Runs the connect/reconnect loop, forwarding inbound frames (and
    /// disconnect notices) to `events`. Does not return under normal
    /// operation; returns an error only if the event channel closes.
    #[instrument(skip(self, events))]
    pub async fn run(mut self, events: mpsc::UnboundedSender<WireEvent>) -> Result<()> {
        let mut outbound_rx = self.outbound_rx.take().expect("run() called once");
        let mut delay = INITIAL_DELAY;

        loop {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    info!(host = %self.host, port = self.port, "connected to upstream");
                    delay = INITIAL_DELAY;
                    let (read_half, write_half) = stream.into_split();
                    if serve_session(read_half, write_half, &mut outbound_rx, &events).await? {
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(%err, host = %self.host, port = self.port, delay_secs = delay.as_secs(), "connect failed, backing off");
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_DELAY);
        }
    }
}

/// Drives one connected session: reads frames into `events`, writes queued
/// outbound lines. Returns `Ok(true)` if the caller should stop entirely
/// (event channel closed or outbound channel dropped), `Ok(false)` if the
/// session just ended and the caller should reconnect.
async fn serve_session<R, W>(
    read_half: R,
    write_half: W,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<WireEvent>,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        tokio::select! {
            line = read_line_bounded(&mut reader) => {
                match line {
                    Ok(Some(line)) => {
                        match InboundFrame::parse(&line) {
                            Ok(frame) => {
                                if events.send(WireEvent::Frame(frame)).is_err() {
                                    return Ok(true);
                                }
                            }
                            Err(err) => warn!(%err, "malformed inbound frame"),
                        }
                    }
                    Ok(None) => {
                        warn!("upstream closed connection");
                        break;
                    }
                    Err(err) if is_line_length_exceeded(&err) => {
                        error!(%err, "line length exceeded, forcing disconnect");
                        let _ = events.send(WireEvent::Fatal(err.to_string()));
                        return Ok(true);
                    }
                    Err(err) => {
                        error!(%err, "fatal read error");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(line) => {
                        if let Err(err) = writer.write_all(line.as_bytes()).await {
                            error!(%err, "write failed");
                            break;
                        }
                        let _ = writer.write_u8(b'\n').await;
                        let _ = writer.flush().await;
                    }
                    None => return Ok(true),
                }
            }
        }
    }
    let _ = events.send(WireEvent::Disconnected);
    Ok(false)
}

fn is_line_length_exceeded(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::InvalidData && err.to_string().contains("line length exceeded")
}

async fn read_line_bounded<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "line length exceeded"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn serve_session_parses_frames_and_writes_outbound() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(local);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        outbound_tx.send("connect c1 LOGIN;rtx".to_string()).unwrap();
        drop(outbound_tx);

        let session = tokio::spawn(async move {
            serve_session(read_half, write_half, &mut outbound_rx, &events_tx).await
        });

        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"connect c1 LOGIN;rtx\n");

        peer.write_all(br#"{"type":"ack","id":"c1","data":"CONNECTION PENDING"}"#).await.unwrap();
        peer.write_all(b"\n").await.unwrap();
        drop(peer);

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, WireEvent::Frame(_)));
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_line_bounded_rejects_oversized_line() {
        let mut data = vec![b'a'; MAX_LINE_LENGTH + 1];
        data.push(b'\n');
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let err = read_line_bounded(&mut reader).await.unwrap_err();
        assert!(is_line_length_exceeded(&err));
    }

    #[tokio::test]
    async fn oversized_line_stops_session_with_fatal_event() {
        let (mut peer, local) = tokio::io::duplex(1 << 20);
        let (read_half, write_half) = tokio::io::split(local);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        drop(outbound_tx);

        let session = tokio::spawn(async move { serve_session(read_half, write_half, &mut outbound_rx, &events_tx).await });

        let writer = tokio::spawn(async move {
            let mut oversized = vec![b'a'; MAX_LINE_LENGTH + 1];
            oversized.push(b'\n');
            let _ = peer.write_all(&oversized).await;
        });

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, WireEvent::Fatal(_)));
        assert!(session.await.unwrap().unwrap());
        let _ = writer.await;
    }
}
