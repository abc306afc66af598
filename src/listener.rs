//! TCP ingest listener
//!
//! Accepts persistent connections carrying newline-framed RFC5424 lines.
//! Each connection gets its own reader task. A parse failure leaves the
//! connection open; a read error or shutdown closes it. Lines longer
//! than the configured cap are skipped in place (the reader advances
//! past the newline and resumes) so one oversized message cannot wedge
//! a connection.

use crate::batcher::WriteError;
use crate::ingest::{IngestError, IngestService};
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    /// Cap on concurrent connections; excess accepts are closed
    /// immediately.
    pub max_connections: usize,
    /// Per-line byte cap enforced at the framing layer.
    pub max_line_length: usize,
}

/// One framing step.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    /// The line exceeded the cap; its bytes were discarded up to and
    /// including the newline.
    TooLong,
    Eof,
}

/// Bind and serve until the shutdown signal fires.
pub async fn run(
    config: ListenerConfig,
    service: Arc<IngestService>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding syslog listener on {}", config.bind))?;
    tracing::info!("syslog listener on {}", config.bind);
    serve(listener, config, service, shutdown).await
}

pub(crate) async fn serve(
    listener: TcpListener,
    config: ListenerConfig,
    service: Arc<IngestService>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(config.max_connections));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            tracing::warn!(%peer, "connection limit reached, closing");
                            continue;
                        };
                        tracing::debug!(%peer, "connection accepted");
                        let service = service.clone();
                        let shutdown = shutdown.clone();
                        let max_line_length = config.max_line_length;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, service, max_line_length, shutdown)
                                .await;
                            tracing::debug!(%peer, "connection closed");
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        // Accept errors are transient; the listener carries on
                        tracing::warn!("accept error: {e}");
                    }
                }
            }
        }
    }

    // Wait for the reader tasks to observe the signal and release their
    // permits before reporting the listener stopped.
    let all = config.max_connections.min(u32::MAX as usize) as u32;
    let _ = permits.acquire_many_owned(all).await;
    tracing::info!("syslog listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<IngestService>,
    max_line_length: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader, &mut buf, max_line_length) => frame,
        };
        match frame {
            Ok(Frame::Line(line)) => {
                if line.is_empty() {
                    continue; // blank lines between messages are ignored
                }
                match service.process_line(&line) {
                    Ok(()) => {}
                    Err(IngestError::Parse(e)) => {
                        // The connection stays open across bad lines
                        tracing::debug!(%peer, "parse failure: {e}");
                    }
                    Err(IngestError::Write(WriteError::QueueFull)) => {
                        tracing::warn!(%peer, "write queue full, dropping line");
                    }
                    Err(IngestError::Write(e)) => {
                        tracing::debug!(%peer, "write rejected ({e}), closing connection");
                        break;
                    }
                }
            }
            Ok(Frame::TooLong) => {
                service.note_rejected_line();
                tracing::debug!(%peer, "line exceeded {max_line_length} bytes, skipped");
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                tracing::debug!(%peer, "read error: {e}");
                break;
            }
        }
    }
}

/// Read one newline-delimited frame, capping the accumulated line at
/// `max_len` bytes. Over-long input is discarded through its newline so
/// the next frame starts clean. A final unterminated line counts as a
/// line.
async fn read_frame<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_len: usize,
) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut overflowed = false;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF
            if overflowed {
                return Ok(Frame::TooLong);
            }
            if buf.is_empty() {
                return Ok(Frame::Eof);
            }
            let line = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            return Ok(Frame::Line(line));
        }

        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if !overflowed {
                    buf.extend_from_slice(&chunk[..pos]);
                }
                reader.consume(pos + 1);
                if overflowed || buf.len() > max_len {
                    buf.clear();
                    return Ok(Frame::TooLong);
                }
                let line = String::from_utf8_lossy(buf).into_owned();
                buf.clear();
                return Ok(Frame::Line(line));
            }
            None => {
                let taken = chunk.len();
                if !overflowed {
                    buf.extend_from_slice(chunk);
                    if buf.len() > max_len {
                        overflowed = true;
                        buf.clear();
                    }
                }
                reader.consume(taken);
            }
        }
    }
}
