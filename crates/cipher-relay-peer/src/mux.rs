//! Stream multiplexer.
//!
//! Maps logical streams onto one transport connection. The multiplexer owns
//! every stream's state; handles only reach it through the methods here.
//!
//! Per-stream lifecycle:
//!
//! ```text
//! PENDING_OPEN --ACK--> OPEN --CLOSE sent--> LOCAL_CLOSING  --CLOSE received--> CLOSED
//!                            --CLOSE recv--> REMOTE_CLOSING --CLOSE sent-----> CLOSED
//! any state --abort (non-normal CLOSE) or connection failure--> CLOSED
//! ```
//!
//! Flow control is credit based: a receiver grants its window with ACK
//! frames and tops it up as its consumer drains buffered data.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use cipher_relay_frame::{Frame, FrameKind, StreamId};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::control::{
    decode_credit, encode_credit, CloseReason, Destination, PING_REPLY, PING_REQUEST,
};
use crate::error::{PeerError, Result};
use crate::stream::{IncomingStreams, StreamHandle};

/// Per-connection multiplexing and liveness settings.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest DATA payload per frame. Larger writes are segmented.
    pub max_frame_payload: usize,
    /// Receive window granted to the peer for each stream.
    pub initial_window: u32,
    /// How long `open_stream` waits for the remote's ACK.
    pub open_timeout: Duration,
    /// Maximum concurrent streams on one connection.
    pub max_streams: usize,
    /// Interval between keepalive PINGs.
    pub keepalive_interval: Duration,
    /// A connection with no inbound traffic for this long is dead.
    pub idle_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 16 * 1024,
            initial_window: 256 * 1024,
            open_timeout: Duration::from_secs(10),
            max_streams: 256,
            keepalive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Which side of the connection opens streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opens streams (the local relay).
    Initiator,
    /// Accepts streams (the remote relay).
    Responder,
}

/// Lifecycle phase of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    PendingOpen,
    Open,
    LocalClosing,
    RemoteClosing,
    Closed,
}

pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    pub(crate) destination: Destination,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) notify: Notify,
}

pub(crate) struct StreamState {
    pub(crate) phase: StreamPhase,
    send_window: u64,
    recv_buf: VecDeque<Bytes>,
    /// Bytes the peer may still send before our next credit.
    recv_allowance: u64,
    /// Bytes consumed locally but not yet credited back.
    pending_credit: u64,
    local_closed: bool,
    remote_closed: bool,
    failure: Option<PeerError>,
    open_tx: Option<oneshot::Sender<Result<()>>>,
}

impl StreamState {
    fn new(recv_allowance: u64, open_tx: Option<oneshot::Sender<Result<()>>>) -> Self {
        Self {
            phase: StreamPhase::PendingOpen,
            send_window: 0,
            recv_buf: VecDeque::new(),
            recv_allowance,
            pending_credit: 0,
            local_closed: false,
            remote_closed: false,
            failure: None,
            open_tx,
        }
    }
}

pub(crate) enum ReadOutcome {
    Chunk(Bytes),
    Eof,
    Pending,
}

struct StreamTable {
    streams: HashMap<StreamId, Arc<StreamShared>>,
    next_id: StreamId,
    failed: Option<PeerError>,
}

impl StreamTable {
    /// Next free id, skipping ids still in use after wraparound.
    fn allocate_id(&mut self) -> Option<StreamId> {
        for _ in 0..=self.streams.len() {
            let id = self.next_id;
            self.next_id = if id == StreamId::MAX { 1 } else { id + 1 };
            if !self.streams.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stream table and flow control for one transport connection.
pub struct Multiplexer {
    role: MuxRole,
    config: MuxConfig,
    outbound: mpsc::UnboundedSender<Frame>,
    incoming: Mutex<Option<mpsc::UnboundedSender<StreamHandle>>>,
    table: Mutex<StreamTable>,
}

impl Multiplexer {
    /// Create an initiator multiplexer. Plaintext frames to transmit are
    /// queued on `outbound` in submission order.
    pub fn initiator(config: MuxConfig, outbound: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(Self::new(MuxRole::Initiator, config, outbound, None))
    }

    /// Create a responder multiplexer and the queue of streams the peer opens.
    pub fn responder(
        config: MuxConfig,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> (Arc<Self>, IncomingStreams) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Arc::new(Self::new(MuxRole::Responder, config, outbound, Some(tx)));
        (mux, IncomingStreams::new(rx))
    }

    fn new(
        role: MuxRole,
        config: MuxConfig,
        outbound: mpsc::UnboundedSender<Frame>,
        incoming: Option<mpsc::UnboundedSender<StreamHandle>>,
    ) -> Self {
        Self {
            role,
            config,
            outbound,
            incoming: Mutex::new(incoming),
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                next_id: 1,
                failed: None,
            }),
        }
    }

    pub fn role(&self) -> MuxRole {
        self.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Number of streams currently tracked (any phase but CLOSED).
    pub fn active_streams(&self) -> usize {
        lock(&self.table).streams.len()
    }

    /// True once the connection under this multiplexer has failed.
    pub fn is_failed(&self) -> bool {
        lock(&self.table).failed.is_some()
    }

    /// Open a stream to `destination` and wait for the remote to accept it.
    ///
    /// Other streams keep flowing while this waits. On timeout the stream is
    /// removed and the remote is told with CLOSE(Timeout).
    pub async fn open_stream(self: &Arc<Self>, destination: Destination) -> Result<StreamHandle> {
        if self.role != MuxRole::Initiator {
            return Err(PeerError::ConnectionUnavailable(
                "responder side cannot open streams".to_string(),
            ));
        }
        let payload = destination.encode()?;
        let (tx, mut rx) = oneshot::channel();

        let shared = {
            let mut table = lock(&self.table);
            if let Some(err) = &table.failed {
                return Err(PeerError::ConnectionUnavailable(err.to_string()));
            }
            if table.streams.len() >= self.config.max_streams {
                return Err(PeerError::ConnectionUnavailable(format!(
                    "stream limit {} reached",
                    self.config.max_streams
                )));
            }
            let id = table.allocate_id().ok_or_else(|| {
                PeerError::ConnectionUnavailable("stream ids exhausted".to_string())
            })?;
            let shared = Arc::new(StreamShared {
                id,
                destination,
                state: Mutex::new(StreamState::new(
                    u64::from(self.config.initial_window),
                    Some(tx),
                )),
                notify: Notify::new(),
            });
            table.streams.insert(id, shared.clone());
            // Queued under the table lock so the id is registered before any reply.
            self.emit(Frame::new(FrameKind::Open, id, payload));
            shared
        };
        debug!(stream_id = shared.id, destination = %shared.destination, "stream open requested");

        // Dropping the handle aborts the stream if this future is cancelled.
        let handle = StreamHandle::new(self.clone(), shared.clone());
        let timeout = self.config.open_timeout;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(Ok(()))) => Ok(handle),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(PeerError::ConnectionClosed),
            Err(_) => {
                let still_pending = {
                    let mut st = lock(&shared.state);
                    if st.phase == StreamPhase::PendingOpen {
                        st.phase = StreamPhase::Closed;
                        st.open_tx = None;
                        st.failure = Some(PeerError::OpenTimeout(timeout));
                        true
                    } else {
                        false
                    }
                };
                if still_pending {
                    self.remove(&shared);
                    self.emit(Frame::new(
                        FrameKind::Close,
                        shared.id,
                        CloseReason::Timeout.encode(),
                    ));
                    debug!(stream_id = shared.id, ?timeout, "stream open timed out");
                    return Err(PeerError::OpenTimeout(timeout));
                }
                // The outcome landed just as the timer fired.
                match rx.try_recv() {
                    Ok(Ok(())) => Ok(handle),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(PeerError::OpenTimeout(timeout)),
                }
            }
        }
    }

    /// Queue up to the available send window of `data` as DATA frames.
    ///
    /// Returns the number of bytes accepted, or `WindowExhausted` when the
    /// window is zero.
    pub fn send(&self, stream_id: StreamId, data: &[u8]) -> Result<usize> {
        let shared = self
            .lookup(stream_id)
            .ok_or(PeerError::StreamClosed(stream_id))?;
        self.send_on(&shared, data)
    }

    pub(crate) fn send_on(&self, shared: &StreamShared, data: &[u8]) -> Result<usize> {
        let mut st = lock(&shared.state);
        if let Some(err) = &st.failure {
            return Err(err.clone());
        }
        match st.phase {
            StreamPhase::Open | StreamPhase::RemoteClosing => {}
            _ => return Err(PeerError::StreamClosed(shared.id)),
        }
        if data.is_empty() {
            return Ok(0);
        }
        if st.send_window == 0 {
            return Err(PeerError::WindowExhausted(shared.id));
        }

        let accepted = data.len().min(usize::try_from(st.send_window).unwrap_or(usize::MAX));
        for chunk in data[..accepted].chunks(self.config.max_frame_payload.max(1)) {
            self.emit(Frame::new(
                FrameKind::Data,
                shared.id,
                Bytes::copy_from_slice(chunk),
            ));
        }
        st.send_window -= accepted as u64;
        trace!(stream_id = shared.id, accepted, window = st.send_window, "data queued");
        Ok(accepted)
    }

    /// Take the next buffered chunk, crediting the peer once enough has been consumed.
    pub(crate) fn try_read(&self, shared: &StreamShared) -> Result<ReadOutcome> {
        let mut st = lock(&shared.state);
        if let Some(chunk) = st.recv_buf.pop_front() {
            st.pending_credit += chunk.len() as u64;
            let threshold = u64::from((self.config.initial_window / 4).max(1));
            if !st.remote_closed && st.pending_credit >= threshold {
                let credit = u32::try_from(st.pending_credit).unwrap_or(u32::MAX);
                st.pending_credit -= u64::from(credit);
                st.recv_allowance += u64::from(credit);
                self.emit(Frame::new(FrameKind::Ack, shared.id, encode_credit(credit)));
            }
            return Ok(ReadOutcome::Chunk(chunk));
        }
        if let Some(err) = &st.failure {
            return Err(err.clone());
        }
        if st.remote_closed {
            return Ok(ReadOutcome::Eof);
        }
        if st.phase == StreamPhase::Closed {
            return Err(PeerError::StreamClosed(shared.id));
        }
        Ok(ReadOutcome::Pending)
    }

    /// Route one inbound plaintext frame.
    ///
    /// Frames for unknown streams are dropped. An `Err` is a protocol
    /// violation and ends the whole connection.
    pub fn on_frame_received(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Ping => self.on_ping(&frame.payload),
            FrameKind::Open => self.on_open(frame),
            FrameKind::Data => {
                if let Some(shared) = self.lookup_or_drop(&frame) {
                    self.on_data(&shared, frame.payload);
                }
                Ok(())
            }
            FrameKind::Close => {
                let reason = CloseReason::decode(&frame.payload)?;
                if let Some(shared) = self.lookup_or_drop(&frame) {
                    self.on_close(&shared, reason);
                }
                Ok(())
            }
            FrameKind::Ack => {
                let credit = decode_credit(&frame.payload)?;
                if let Some(shared) = self.lookup_or_drop(&frame) {
                    self.on_ack(&shared, credit);
                }
                Ok(())
            }
        }
    }

    fn on_ping(&self, payload: &[u8]) -> Result<()> {
        match payload {
            [PING_REQUEST] => {
                self.emit(Frame::new(FrameKind::Ping, 0, vec![PING_REPLY]));
                Ok(())
            }
            [PING_REPLY] => Ok(()),
            _ => Err(PeerError::MalformedFrame(format!(
                "bad ping payload ({} bytes)",
                payload.len()
            ))),
        }
    }

    fn on_open(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let id = frame.stream_id;
        if self.role == MuxRole::Initiator {
            warn!(stream_id = id, "peer tried to open a stream on the initiator side");
            self.emit_close(id, CloseReason::Refused);
            return Ok(());
        }

        let destination = match Destination::decode(&frame.payload) {
            Ok(destination) => destination,
            Err(err) => {
                warn!(stream_id = id, %err, "refusing stream with bad destination");
                self.emit_close(id, CloseReason::Refused);
                return Ok(());
            }
        };

        let shared = {
            let mut table = lock(&self.table);
            if table.failed.is_some() {
                return Ok(());
            }
            if table.streams.contains_key(&id) {
                return Err(PeerError::MalformedFrame(format!(
                    "duplicate OPEN for stream {id}"
                )));
            }
            if table.streams.len() >= self.config.max_streams {
                drop(table);
                debug!(stream_id = id, "stream limit reached, refusing open");
                self.emit_close(id, CloseReason::Refused);
                return Ok(());
            }
            let shared = Arc::new(StreamShared {
                id,
                destination,
                state: Mutex::new(StreamState::new(0, None)),
                notify: Notify::new(),
            });
            table.streams.insert(id, shared.clone());
            shared
        };
        debug!(stream_id = id, destination = %shared.destination, "incoming stream");

        let handle = StreamHandle::new(self.clone(), shared);
        let rejected = match lock(&self.incoming).as_ref() {
            Some(tx) => tx.send(handle).err().map(|err| err.0),
            None => Some(handle),
        };
        if let Some(handle) = rejected {
            handle.refuse(CloseReason::Refused);
        }
        Ok(())
    }

    fn on_data(&self, shared: &Arc<StreamShared>, payload: Bytes) {
        let mut st = lock(&shared.state);
        let len = payload.len() as u64;

        if st.remote_closed || st.phase == StreamPhase::Closed {
            warn!(stream_id = shared.id, "data after close, resetting stream");
            self.terminate(shared.id, &mut st, PeerError::StreamClosed(shared.id), Some(CloseReason::Reset));
        } else if len > st.recv_allowance {
            warn!(
                stream_id = shared.id,
                len,
                allowance = st.recv_allowance,
                "peer exceeded receive window, resetting stream"
            );
            self.terminate(shared.id, &mut st, PeerError::StreamClosed(shared.id), Some(CloseReason::Reset));
        } else {
            st.recv_allowance -= len;
            if !payload.is_empty() {
                st.recv_buf.push_back(payload);
            }
            drop(st);
            shared.notify.notify_waiters();
            return;
        }

        drop(st);
        shared.notify.notify_waiters();
        self.remove(shared);
    }

    fn on_close(&self, shared: &Arc<StreamShared>, reason: CloseReason) {
        let mut st = lock(&shared.state);
        let mut closed = false;

        if st.phase == StreamPhase::PendingOpen {
            let failure = PeerError::RemoteRefused {
                stream_id: shared.id,
                reason,
            };
            self.terminate(shared.id, &mut st, failure, None);
            closed = true;
        } else if reason.is_abort() {
            let failure = match reason {
                CloseReason::PeerUnreachable => {
                    PeerError::PeerUnreachable(format!("remote lost stream {}", shared.id))
                }
                _ => PeerError::StreamClosed(shared.id),
            };
            self.terminate(shared.id, &mut st, failure, None);
            closed = true;
        } else if st.phase != StreamPhase::Closed {
            st.remote_closed = true;
            if st.local_closed {
                st.phase = StreamPhase::Closed;
                closed = true;
            } else {
                st.phase = StreamPhase::RemoteClosing;
            }
        }
        debug!(stream_id = shared.id, %reason, phase = ?st.phase, "close received");

        drop(st);
        shared.notify.notify_waiters();
        if closed {
            self.remove(shared);
        }
    }

    fn on_ack(&self, shared: &StreamShared, credit: u32) {
        let mut st = lock(&shared.state);
        match st.phase {
            StreamPhase::PendingOpen if self.role == MuxRole::Initiator => {
                st.phase = StreamPhase::Open;
                st.send_window = st.send_window.saturating_add(u64::from(credit));
                // Grant our own receive window now that the stream exists.
                self.emit(Frame::new(
                    FrameKind::Ack,
                    shared.id,
                    encode_credit(self.config.initial_window),
                ));
                if let Some(tx) = st.open_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                debug!(stream_id = shared.id, credit, "stream open acknowledged");
            }
            StreamPhase::Open | StreamPhase::LocalClosing | StreamPhase::RemoteClosing => {
                st.send_window = st.send_window.saturating_add(u64::from(credit));
                trace!(stream_id = shared.id, credit, window = st.send_window, "credit received");
            }
            _ => {
                debug!(stream_id = shared.id, phase = ?st.phase, "ignoring ack");
                return;
            }
        }
        drop(st);
        shared.notify.notify_waiters();
    }

    /// Responder side: the destination is connected, confirm the open.
    pub(crate) fn accept_open(&self, shared: &StreamShared) -> Result<()> {
        let mut st = lock(&shared.state);
        if st.phase != StreamPhase::PendingOpen {
            return Err(st
                .failure
                .clone()
                .unwrap_or(PeerError::StreamClosed(shared.id)));
        }
        st.phase = StreamPhase::Open;
        st.recv_allowance = u64::from(self.config.initial_window);
        self.emit(Frame::new(
            FrameKind::Ack,
            shared.id,
            encode_credit(self.config.initial_window),
        ));
        drop(st);
        shared.notify.notify_waiters();
        Ok(())
    }

    /// Send CLOSE and release the stream. Closing an unknown or already
    /// closed stream is a no-op.
    ///
    /// `CloseReason::Normal` half-closes: the stream stays readable until the
    /// remote closes its direction too. Any other reason aborts both directions.
    pub fn close_stream(&self, stream_id: StreamId, reason: CloseReason) {
        if let Some(shared) = self.lookup(stream_id) {
            if reason.is_abort() {
                self.abort_stream(&shared, reason);
            } else {
                self.half_close(&shared);
            }
        }
    }

    pub(crate) fn half_close(&self, shared: &Arc<StreamShared>) {
        let mut st = lock(&shared.state);
        let mut closed = false;
        let phase = st.phase;
        match phase {
            StreamPhase::Closed | StreamPhase::LocalClosing => return,
            StreamPhase::PendingOpen => {
                drop(st);
                self.abort_stream(shared, CloseReason::Reset);
                return;
            }
            StreamPhase::Open | StreamPhase::RemoteClosing => {
                st.local_closed = true;
                self.emit_close(shared.id, CloseReason::Normal);
                if st.remote_closed {
                    st.phase = StreamPhase::Closed;
                    closed = true;
                } else {
                    st.phase = StreamPhase::LocalClosing;
                }
            }
        }
        drop(st);
        shared.notify.notify_waiters();
        if closed {
            self.remove(shared);
        }
    }

    pub(crate) fn abort_stream(&self, shared: &Arc<StreamShared>, reason: CloseReason) {
        let send = if self.is_failed() { None } else { Some(reason) };
        let mut st = lock(&shared.state);
        if st.phase == StreamPhase::Closed {
            return;
        }
        self.terminate(shared.id, &mut st, PeerError::StreamClosed(shared.id), send);
        debug!(stream_id = shared.id, %reason, "stream aborted");
        drop(st);
        shared.notify.notify_waiters();
        self.remove(shared);
    }

    /// Fail every stream with `err` and refuse new ones. Used when the
    /// connection dies; no frames are sent.
    pub fn fail_all(&self, err: PeerError) {
        let streams: Vec<Arc<StreamShared>> = {
            let mut table = lock(&self.table);
            if table.failed.is_none() {
                table.failed = Some(err.clone());
            }
            table.streams.drain().map(|(_, shared)| shared).collect()
        };
        lock(&self.incoming).take();

        if !streams.is_empty() {
            debug!(count = streams.len(), %err, "failing all streams");
        }
        for shared in streams {
            let mut st = lock(&shared.state);
            if st.phase != StreamPhase::Closed {
                self.terminate(shared.id, &mut st, err.clone(), None);
            }
            drop(st);
            shared.notify.notify_waiters();
        }
    }

    /// Queue a keepalive PING request.
    pub fn send_ping(&self) {
        self.emit(Frame::new(FrameKind::Ping, 0, vec![PING_REQUEST]));
    }

    fn terminate(
        &self,
        id: StreamId,
        st: &mut StreamState,
        failure: PeerError,
        send: Option<CloseReason>,
    ) {
        st.phase = StreamPhase::Closed;
        st.recv_buf.clear();
        if st.failure.is_none() {
            st.failure = Some(failure.clone());
        }
        if let Some(tx) = st.open_tx.take() {
            let _ = tx.send(Err(failure));
        }
        if let Some(reason) = send {
            self.emit_close(id, reason);
        }
    }

    fn lookup(&self, stream_id: StreamId) -> Option<Arc<StreamShared>> {
        lock(&self.table).streams.get(&stream_id).cloned()
    }

    fn lookup_or_drop(&self, frame: &Frame) -> Option<Arc<StreamShared>> {
        let found = self.lookup(frame.stream_id);
        if found.is_none() {
            debug!(
                stream_id = frame.stream_id,
                kind = %frame.kind,
                "dropping frame for unknown stream"
            );
        }
        found
    }

    fn remove(&self, shared: &Arc<StreamShared>) {
        let mut table = lock(&self.table);
        if let Some(current) = table.streams.get(&shared.id) {
            if Arc::ptr_eq(current, shared) {
                table.streams.remove(&shared.id);
            }
        }
    }

    fn emit_close(&self, id: StreamId, reason: CloseReason) {
        self.emit(Frame::new(FrameKind::Close, id, reason.encode()));
    }

    fn emit(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            trace!("connection writer gone, frame dropped");
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.role)
            .field("active_streams", &self.active_streams())
            .finish_non_exhaustive()
    }
}
