use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use cipher_relay_frame::StreamId;
use tokio::sync::mpsc;

use crate::control::{CloseReason, Destination};
use crate::error::{PeerError, Result};
use crate::mux::{lock, Multiplexer, ReadOutcome, StreamPhase, StreamShared};

/// One logical stream on a transport connection.
///
/// Dropping a handle whose stream is not fully closed aborts it with
/// `CloseReason::Reset`.
pub struct StreamHandle {
    mux: Arc<Multiplexer>,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub(crate) fn new(mux: Arc<Multiplexer>, shared: Arc<StreamShared>) -> Self {
        Self { mux, shared }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Destination carried by the stream's OPEN frame.
    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    pub fn phase(&self) -> StreamPhase {
        lock(&self.shared.state).phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == StreamPhase::Closed
    }

    /// Next chunk from the remote, in send order. `None` once the remote has
    /// closed its direction and everything buffered has been read.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.mux.try_read(&self.shared)? {
                ReadOutcome::Chunk(chunk) => return Ok(Some(chunk)),
                ReadOutcome::Eof => return Ok(None),
                ReadOutcome::Pending => notified.await,
            }
        }
    }

    /// Send as much of `data` as the window allows without waiting.
    pub fn try_write(&self, data: &[u8]) -> Result<usize> {
        self.mux.send_on(&self.shared, data)
    }

    /// Send all of `data`, waiting for credit whenever the window is empty.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.mux.send_on(&self.shared, data) {
                Ok(sent) => data = &data[sent..],
                Err(PeerError::WindowExhausted(_)) => notified.await,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Half-close: no more data from this side. Reads continue until the
    /// remote closes too.
    pub fn close(&self) {
        self.mux.half_close(&self.shared);
    }

    /// Abort both directions immediately.
    pub fn abort(&self, reason: CloseReason) {
        self.mux.abort_stream(&self.shared, reason);
    }

    /// Confirm an incoming stream once its destination is connected.
    pub fn accept_open(&self) -> Result<()> {
        self.mux.accept_open(&self.shared)
    }

    /// Decline an incoming stream.
    pub fn refuse(&self, reason: CloseReason) {
        self.mux.abort_stream(&self.shared, reason);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.mux.abort_stream(&self.shared, CloseReason::Reset);
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Streams opened by the remote, in arrival order.
#[derive(Debug)]
pub struct IncomingStreams {
    rx: mpsc::UnboundedReceiver<StreamHandle>,
}

impl IncomingStreams {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StreamHandle>) -> Self {
        Self { rx }
    }

    /// Next incoming stream, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<StreamHandle> {
        self.rx.recv().await
    }
}
