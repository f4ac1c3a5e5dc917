//! Per-connection bidirectional frame queues.
//!
//! A [`Framer`] owns a split TCP stream and two bounded channels: frames
//! decoded from the socket flow out through `inbound`, and frames handed
//! to `outbound` are encoded and written to the socket. The reader and
//! writer each run in their own task so a slow peer on one direction
//! never blocks the other. `peer_closed` and `bad_frame_seen` let the
//! owning [`crate::session::Session`] distinguish a graceful close from
//! a protocol violation without inspecting the channels directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::wire::{self, Frame, WireError};

/// Outbound queues deeper than this indicate a stuck writer; see
/// [`crate::engine`]'s delivery timeout, which is what actually trips
/// first in practice.
pub const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct Flags {
    pub peer_closed: AtomicBool,
    pub bad_frame_seen: AtomicBool,
}

pub struct Framer {
    pub inbound: mpsc::Receiver<Frame>,
    pub outbound: mpsc::Sender<Frame>,
    pub flags: Arc<Flags>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl Framer {
    /// Split `stream` and spawn its reader and writer tasks.
    pub fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let flags = Arc::new(Flags::default());

        let reader_task = tokio::spawn(read_loop(read_half, inbound_tx, flags.clone()));
        let writer_task = tokio::spawn(write_loop(write_half, outbound_rx, flags.clone()));

        Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            flags,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
        }
    }

    /// Best-effort drain of anything still queued to the writer, then
    /// tear down both tasks: replacing `outbound` drops the last live
    /// sender so the writer finishes draining and shuts down on its
    /// own, while the reader is aborted outright since there's nothing
    /// left to read it into.
    pub async fn close(&mut self) {
        self.outbound = mpsc::channel(1).0;
        if let Some(reader_task) = self.reader_task.take() {
            reader_task.abort();
        }
        if let Some(writer_task) = self.writer_task.take() {
            let _ = writer_task.await;
        }
    }
}

impl Drop for Framer {
    fn drop(&mut self) {
        if let Some(reader_task) = &self.reader_task {
            reader_task.abort();
        }
        if let Some(writer_task) = &self.writer_task {
            writer_task.abort();
        }
    }
}

async fn read_loop<R>(mut read: ReadHalf<R>, inbound_tx: mpsc::Sender<Frame>, flags: Arc<Flags>)
where
    R: AsyncRead,
{
    loop {
        match wire::read_frame(&mut read).await {
            Ok(Some(frame)) => {
                if inbound_tx.send(frame).await.is_err() {
                    debug!("session dropped inbound receiver, stopping reader");
                    return;
                }
            }
            Ok(None) => {
                debug!("peer closed connection cleanly");
                flags.peer_closed.store(true, Ordering::Relaxed);
                return;
            }
            Err(WireError::Malformed(reason)) => {
                warn!(reason, "malformed frame from peer");
                flags.bad_frame_seen.store(true, Ordering::Relaxed);
                return;
            }
            Err(WireError::UnknownTag(tag)) => {
                warn!(tag, "unknown frame tag from peer");
                flags.bad_frame_seen.store(true, Ordering::Relaxed);
                return;
            }
            Err(WireError::Io(err)) => {
                debug!(error = %err, "socket error reading frame");
                flags.peer_closed.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut write: WriteHalf<W>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    flags: Arc<Flags>,
) where
    W: AsyncWrite,
{
    use tokio::io::AsyncWriteExt;

    while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = wire::write_frame(&mut write, &frame).await {
            debug!(error = %err, "failed writing frame, dropping connection");
            flags.peer_closed.store(true, Ordering::Relaxed);
            return;
        }
    }
    let _ = write.shutdown().await;
}
