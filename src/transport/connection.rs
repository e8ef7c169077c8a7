//! # Peer Connection
//!
//! One non-blocking TCP socket with its buffers, send queue and a private
//! task queue.
//!
//! ## Lifecycle
//! ```text
//! Init -> Connecting (outbound) -> Connected -> Handshaked -> Closed
//!                                  ^ inbound connections start here
//! ```
//! `Closed` is terminal. [`PeerConnection::close`] may be called from any
//! thread any number of times; only the first call has an effect and its
//! reason sticks.
//!
//! ## Ordering
//! Every callback touching the socket or buffers runs as a [`ConnTask`] on
//! the connection's [`TaskQueue`], drained on the shared worker pool. Tasks
//! of one connection never overlap, so the buffers are never contended.
//! Readiness registration changes are sent to the event loop thread as
//! operations; this type never touches the poll handle itself.
//!
//! ## Buffers
//! Reads and writes go through local buffers of `buffer_size` bytes. When a
//! single envelope does not fit, the connection borrows a pooled buffer of
//! the maximum envelope size and returns it once the backlog fits in the
//! local buffer again.

use crate::core::codec::{EncodeStatus, Frame};
use crate::core::endpoint::Endpoint;
use crate::error::constants;
use crate::protocol::message::{Direction, Protocol, WireMessage};
use crate::reputation::record::PeerEvent;
use crate::transport::connection_table::Keyed;
use crate::transport::event_loop::{LoopOp, NodeContext};
use crate::transport::task_queue::TaskQueue;
use bytes::{Buf, BytesMut};
use crossbeam::queue::SegQueue;
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, error, instrument, trace, warn};

/// Largest single socket read
const READ_CHUNK: usize = 64 * 1024;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    Connecting = 1,
    Connected = 2,
    Handshaked = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Handshaked,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Outbound connect failed or timed out
    Connect,
    Read,
    /// Remote closed its side
    ReadEof,
    Write,
    /// Readiness registration failed
    KeyRegistration,
    /// Handshake violated or not finished in time
    Handshake,
    /// A handler asked for the close
    Handler,
    LocalDisconnect,
    /// Bad length, checksum or payload
    Framing,
    /// Message larger than every available buffer
    Resource,
}

impl CloseReason {
    /// Failures that count against the endpoint's reputation
    pub fn is_connect_phase(&self) -> bool {
        matches!(self, CloseReason::Connect | CloseReason::Handshake)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Connect => "connect failed",
            CloseReason::Read => "read error",
            CloseReason::ReadEof => "remote closed",
            CloseReason::Write => "write error",
            CloseReason::KeyRegistration => "registration failed",
            CloseReason::Handshake => "handshake failed",
            CloseReason::Handler => "closed by handler",
            CloseReason::LocalDisconnect => "local disconnect",
            CloseReason::Framing => "framing error",
            CloseReason::Resource => "message too large",
        };
        f.write_str(s)
    }
}

/// Work item run on a connection's task queue
pub enum ConnTask {
    /// Outbound socket became ready while connecting
    Connect,
    Read,
    Write,
    /// Inbound connection registered with the loop
    Accepted,
    ConnectTimeout,
    HandshakeTimeout,
    Disconnect,
}

impl fmt::Debug for ConnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnTask::Connect => "Connect",
            ConnTask::Read => "Read",
            ConnTask::Write => "Write",
            ConnTask::Accepted => "Accepted",
            ConnTask::ConnectTimeout => "ConnectTimeout",
            ConnTask::HandshakeTimeout => "HandshakeTimeout",
            ConnTask::Disconnect => "Disconnect",
        };
        f.write_str(name)
    }
}

enum Fill {
    /// Buffer reached its limit; the socket may hold more
    Full,
    WouldBlock,
    Eof,
}

enum Flush {
    Drained,
    Pending,
}

/// Socket-side buffers, only touched from the connection's own tasks
struct IoBuffers<M> {
    read: BytesMut,
    read_pooled: bool,
    spare_read: Option<BytesMut>,
    write: BytesMut,
    write_pooled: bool,
    spare_write: Option<BytesMut>,
    /// Message popped from the send queue that did not fit yet
    head: Option<M>,
}

impl<M> IoBuffers<M> {
    fn new(local_size: usize) -> Self {
        Self {
            read: BytesMut::with_capacity(local_size),
            read_pooled: false,
            spare_read: None,
            write: BytesMut::with_capacity(local_size),
            write_pooled: false,
            spare_write: None,
            head: None,
        }
    }
}

/// Swap a local buffer for a pooled one, carrying its contents over
fn borrow_pooled(current: &mut BytesMut, spare: &mut Option<BytesMut>, pooled: BytesMut) {
    let mut local = std::mem::replace(current, pooled);
    current.extend_from_slice(&local);
    local.clear();
    *spare = Some(local);
}

/// Swap a pooled buffer back for a local one once its contents fit
fn return_pooled(
    current: &mut BytesMut,
    spare: &mut Option<BytesMut>,
    local_size: usize,
) -> BytesMut {
    let mut local = spare
        .take()
        .unwrap_or_else(|| BytesMut::with_capacity(local_size));
    local.clear();
    local.extend_from_slice(current);
    std::mem::replace(current, local)
}

/// A connection to one remote endpoint
pub struct PeerConnection<P: Protocol> {
    id: u64,
    endpoint: Endpoint,
    direction: Direction,
    nonce: u64,
    stream: Arc<TcpStream>,
    state: AtomicU8,
    closed: AtomicBool,
    established: AtomicBool,
    version: AtomicU32,
    close_reason: OnceLock<CloseReason>,
    send_queue: SegQueue<P::Message>,
    write_pending: AtomicBool,
    tasks: TaskQueue<ConnTask>,
    /// Locked only from tasks of this connection, which never overlap, so
    /// the lock is never contended. `Drop` reaches it through `get_mut`.
    buffers: Mutex<IoBuffers<P::Message>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    session: P::Session,
    node: Arc<NodeContext<P>>,
}

impl<P: Protocol> fmt::Debug for PeerConnection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("version", &self.version())
            .field("queued", &self.queued_sends())
            .finish()
    }
}

impl<P: Protocol> Keyed for PeerConnection<P> {
    fn id(&self) -> u64 {
        self.id
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl<P: Protocol> PeerConnection<P> {
    pub(crate) fn new(
        node: &Arc<NodeContext<P>>,
        id: u64,
        stream: TcpStream,
        endpoint: Endpoint,
        direction: Direction,
    ) -> Arc<Self> {
        let session = node.protocol().new_session(direction, &endpoint);
        Arc::new(Self {
            id,
            endpoint,
            direction,
            nonce: rand::random(),
            stream: Arc::new(stream),
            state: AtomicU8::new(ConnectionState::Init as u8),
            closed: AtomicBool::new(false),
            established: AtomicBool::new(false),
            version: AtomicU32::new(0),
            close_reason: OnceLock::new(),
            send_queue: SegQueue::new(),
            write_pending: AtomicBool::new(false),
            tasks: TaskQueue::new(),
            buffers: Mutex::new(IoBuffers::new(node.config().transport.buffer_size)),
            timers: Mutex::new(Vec::new()),
            session,
            node: Arc::clone(node),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Random value identifying this connection in handshakes
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Negotiated protocol version, 0 until the peer's version is accepted
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Record the negotiated version. Returns false if one was already set.
    pub fn set_version(&self, version: u32) -> bool {
        self.version
            .compare_exchange(0, version, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_handshaked(&self) -> bool {
        self.state() == ConnectionState::Handshaked
    }

    /// Reason given to the first [`close`](Self::close) call
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn session(&self) -> &P::Session {
        &self.session
    }

    /// Shared node state
    pub fn node(&self) -> &Arc<NodeContext<P>> {
        &self.node
    }

    pub fn protocol(&self) -> &P {
        self.node.protocol()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Leave `Init` for `state` once the connection is in the table.
    /// Returns false if it already left `Init`.
    pub(crate) fn begin(&self, state: ConnectionState) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Init as u8,
                state as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Mark the socket as connected and count it
    pub(crate) fn mark_established(&self) {
        if !self.established.swap(true, Ordering::SeqCst) {
            self.node.metrics().connection_opened();
        }
    }

    /// Mark the handshake finished and cancel its timeout
    pub fn complete_handshake(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Handshaked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.cancel_timers();
            self.node.metrics().handshake_success();
            debug!(conn_id = self.id, endpoint = %self.endpoint, version = self.version(), "Handshake complete");
        }
    }

    /// Queue a message for sending.
    ///
    /// Never blocks and never reports delivery. Messages go out in the order
    /// they were queued, each one whole. Sends on a closed connection are
    /// dropped.
    pub fn send(self: &Arc<Self>, message: P::Message) {
        if self.is_closed() {
            trace!(conn_id = self.id, command = message.command(), "Dropping send on closed connection");
            return;
        }
        self.send_queue.push(message);
        // Connect completion re-arms write interest if the queue is non-empty.
        if self.state() >= ConnectionState::Connected {
            self.submit(ConnTask::Write);
        }
    }

    /// Close from the connection's own task queue, after already queued work
    pub fn disconnect(self: &Arc<Self>) {
        self.submit(ConnTask::Disconnect);
    }

    /// Number of messages waiting in the send queue
    pub fn queued_sends(&self) -> usize {
        self.send_queue.len()
    }

    pub(crate) fn submit(self: &Arc<Self>, task: ConnTask) {
        if self.is_closed() {
            return;
        }
        if self.tasks.push(task) {
            let conn = Arc::clone(self);
            self.node.spawn(move || conn.drain_tasks());
        }
    }

    fn drain_tasks(self: &Arc<Self>) {
        self.tasks
            .drain(|| self.is_closed(), |task| self.run_task(task));
    }

    fn run_task(self: &Arc<Self>, task: ConnTask) {
        trace!(conn_id = self.id, task = ?task, "Running connection task");
        match task {
            ConnTask::Connect => self.on_connect_ready(),
            ConnTask::Read => self.on_readable(),
            ConnTask::Write => self.on_writable(),
            ConnTask::Accepted => self.on_accepted(),
            ConnTask::ConnectTimeout => {
                if self.state() == ConnectionState::Connecting {
                    debug!(conn_id = self.id, endpoint = %self.endpoint, "Connect timed out");
                    self.close(CloseReason::Connect);
                }
            }
            ConnTask::HandshakeTimeout => {
                if !self.is_handshaked() {
                    debug!(conn_id = self.id, endpoint = %self.endpoint, "Handshake timed out");
                    self.close(CloseReason::Handshake);
                }
            }
            ConnTask::Disconnect => self.close(CloseReason::LocalDisconnect),
        }
    }

    /// Translate a readiness event into tasks
    pub(crate) fn on_ready(self: &Arc<Self>, readable: bool, writable: bool) {
        if self.state() == ConnectionState::Connecting {
            if readable || writable {
                self.submit(ConnTask::Connect);
            }
            return;
        }
        if readable {
            self.submit(ConnTask::Read);
        }
        if writable {
            self.submit(ConnTask::Write);
        }
    }

    /// Fire `task` after `delay` unless the connection closes first
    pub(crate) fn arm_timer(self: &Arc<Self>, delay: Duration, task: fn() -> ConnTask) {
        let weak = Arc::downgrade(self);
        let handle = self.node.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                conn.submit(task());
            }
        });
        self.timers.lock().push(handle);
        if self.is_closed() {
            self.cancel_timers();
        }
    }

    fn cancel_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }

    /// Ask the loop to re-arm readiness for this connection
    fn rearm(&self) {
        if self.is_closed() {
            return;
        }
        let mut interest = Interest::READABLE;
        if self.state() == ConnectionState::Connecting
            || self.write_pending.load(Ordering::SeqCst)
            || !self.send_queue.is_empty()
        {
            interest |= Interest::WRITABLE;
        }
        self.node.push_op(LoopOp::Reregister {
            id: self.id,
            interest,
        });
    }

    fn on_connect_ready(self: &Arc<Self>) {
        if self.state() != ConnectionState::Connecting {
            return;
        }
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Connect failed");
                self.close(CloseReason::Connect);
                return;
            }
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                self.rearm();
                return;
            }
            Err(e) => {
                debug!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Connect failed");
                self.close(CloseReason::Connect);
                return;
            }
        }

        if self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.mark_established();
        debug!(conn_id = self.id, endpoint = %self.endpoint, "Outbound connection established");
        if !self.node.protocol().on_connected(self) {
            self.close(CloseReason::Handler);
            return;
        }
        self.rearm();
    }

    fn on_accepted(self: &Arc<Self>) {
        if !self.node.protocol().on_connected(self) {
            self.close(CloseReason::Handler);
            return;
        }
        self.rearm();
    }

    fn on_readable(self: &Arc<Self>) {
        if self.is_closed() || self.state() < ConnectionState::Connected {
            return;
        }
        let local_size = self.node.config().transport.buffer_size;
        let pool = self.node.buffer_pool();
        let mut codec = *self.node.codec();

        let mut guard = self.buffers.lock();
        let bufs = &mut *guard;
        let end = loop {
            let limit = if bufs.read_pooled {
                pool.buffer_size()
            } else {
                local_size
            };
            let fill = match self.fill(&mut bufs.read, limit) {
                Ok(fill) => fill,
                Err(e) => {
                    debug!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Read failed");
                    break Some(CloseReason::Read);
                }
            };

            let mut decoded = 0usize;
            loop {
                match codec.decode(&mut bufs.read) {
                    Ok(Some(frame)) => {
                        decoded += 1;
                        if !self.dispatch(frame) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.node.metrics().framing_error();
                        warn!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Rejecting envelope");
                        self.close(CloseReason::Framing);
                        return;
                    }
                }
            }

            match fill {
                Fill::WouldBlock => break None,
                Fill::Eof => break Some(CloseReason::ReadEof),
                Fill::Full if decoded > 0 => continue,
                Fill::Full if bufs.read_pooled => {
                    error!(
                        conn_id = self.id,
                        endpoint = %self.endpoint,
                        buffered = bufs.read.len(),
                        "Incoming message exceeds pooled buffer"
                    );
                    break Some(CloseReason::Resource);
                }
                Fill::Full => {
                    trace!(conn_id = self.id, "Borrowing pooled read buffer");
                    borrow_pooled(&mut bufs.read, &mut bufs.spare_read, pool.acquire());
                    bufs.read_pooled = true;
                    self.node.metrics().pooled_buffer_borrow();
                }
            }
        };

        if bufs.read_pooled && bufs.read.len() <= local_size {
            let pooled = return_pooled(&mut bufs.read, &mut bufs.spare_read, local_size);
            bufs.read_pooled = false;
            pool.release(pooled);
        }
        drop(guard);

        match end {
            Some(reason) => self.close(reason),
            None => self.rearm(),
        }
    }

    /// Read from the socket until the buffer reaches `limit`, would block, or hits EOF
    fn fill(&self, buf: &mut BytesMut, limit: usize) -> io::Result<Fill> {
        loop {
            let len = buf.len();
            if len >= limit {
                return Ok(Fill::Full);
            }
            buf.resize(limit.min(len + READ_CHUNK), 0);
            let result = (&*self.stream).read(&mut buf[len..]);
            match result {
                Ok(0) => {
                    buf.truncate(len);
                    return Ok(Fill::Eof);
                }
                Ok(n) => buf.truncate(len + n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buf.truncate(len);
                    return Ok(Fill::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => buf.truncate(len),
                Err(e) => {
                    buf.truncate(len);
                    return Err(e);
                }
            }
        }
    }

    /// Decode and handle one frame. Returns false once the connection is closed.
    #[instrument(level = "trace", skip_all, fields(conn_id = self.id, command = %frame.command))]
    fn dispatch(self: &Arc<Self>, frame: Frame) -> bool {
        let protocol = self.node.protocol();
        let registry = protocol.registry();
        self.node.metrics().message_received(frame.wire_len() as u64);

        let version = self.version();
        if version == 0 && !registry.is_handshake(&frame.command) {
            self.node.metrics().protocol_error();
            warn!(
                conn_id = self.id,
                endpoint = %self.endpoint,
                command = %frame.command,
                "{}",
                constants::ERR_PRE_HANDSHAKE
            );
            self.close(CloseReason::Handshake);
            return false;
        }

        let command = frame.command.clone();
        let message = match registry.decode(frame, version) {
            Ok(message) => message,
            Err(e) => {
                self.node.metrics().framing_error();
                warn!(conn_id = self.id, endpoint = %self.endpoint, command = %command, error = %e, "Undecodable payload");
                self.close(CloseReason::Framing);
                return false;
            }
        };

        if registry.handle(&message, self) == Some(false) {
            self.node.metrics().protocol_error();
            debug!(conn_id = self.id, endpoint = %self.endpoint, command = %command, "Handler closed connection");
            self.close(CloseReason::Handler);
            return false;
        }
        !self.is_closed()
    }

    fn on_writable(self: &Arc<Self>) {
        if self.is_closed() || self.state() < ConnectionState::Connected {
            return;
        }
        let result = {
            let mut guard = self.buffers.lock();
            let result = self.flush(&mut guard);
            let pending = !guard.write.is_empty() || guard.head.is_some();
            self.write_pending.store(pending, Ordering::SeqCst);
            result
        };
        match result {
            Ok(()) => self.rearm(),
            Err(reason) => self.close(reason),
        }
    }

    /// Serialize queued messages and write until the socket would block
    fn flush(&self, bufs: &mut IoBuffers<P::Message>) -> Result<(), CloseReason> {
        let local_size = self.node.config().transport.buffer_size;
        let pool = self.node.buffer_pool();
        loop {
            self.serialize_pending(bufs, local_size)?;
            if bufs.write.is_empty() {
                break;
            }
            match self.write_out(&mut bufs.write) {
                Ok(Flush::Drained) => {
                    if bufs.head.is_none() && self.send_queue.is_empty() {
                        break;
                    }
                }
                Ok(Flush::Pending) => break,
                Err(e) => {
                    debug!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Write failed");
                    return Err(CloseReason::Write);
                }
            }
        }
        if bufs.write_pooled && bufs.write.len() <= local_size && bufs.head.is_none() {
            let pooled = return_pooled(&mut bufs.write, &mut bufs.spare_write, local_size);
            bufs.write_pooled = false;
            pool.release(pooled);
        }
        Ok(())
    }

    /// Move whole envelopes from the send queue into the write buffer while they fit
    fn serialize_pending(
        &self,
        bufs: &mut IoBuffers<P::Message>,
        local_size: usize,
    ) -> Result<(), CloseReason> {
        let pool = self.node.buffer_pool();
        let codec = self.node.codec();
        let version = self.version();
        loop {
            let Some(message) = bufs.head.take().or_else(|| self.send_queue.pop()) else {
                return Ok(());
            };
            let limit = if bufs.write_pooled {
                pool.buffer_size()
            } else {
                local_size
            };
            match codec.encode_message(&message, version, &mut bufs.write, limit) {
                Ok(EncodeStatus::Written(n)) => {
                    self.node.metrics().message_sent(n as u64);
                }
                Ok(EncodeStatus::Insufficient { required }) => {
                    if !bufs.write.is_empty() {
                        bufs.head = Some(message);
                        return Ok(());
                    }
                    if bufs.write_pooled || required > pool.buffer_size() {
                        error!(
                            conn_id = self.id,
                            endpoint = %self.endpoint,
                            required,
                            "Outgoing message exceeds pooled buffer"
                        );
                        return Err(CloseReason::Resource);
                    }
                    trace!(conn_id = self.id, required, "Borrowing pooled write buffer");
                    borrow_pooled(&mut bufs.write, &mut bufs.spare_write, pool.acquire());
                    bufs.write_pooled = true;
                    self.node.metrics().pooled_buffer_borrow();
                    bufs.head = Some(message);
                }
                Err(e) => {
                    error!(conn_id = self.id, endpoint = %self.endpoint, error = %e, "Cannot encode outgoing message");
                    return Err(CloseReason::Resource);
                }
            }
        }
    }

    fn write_out(&self, buf: &mut BytesMut) -> io::Result<Flush> {
        while !buf.is_empty() {
            match (&*self.stream).write(&buf[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }

    /// Close the connection. Idempotent; callable from any thread.
    pub fn close(&self, reason: CloseReason) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _ = self.close_reason.set(reason);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.cancel_timers();
        debug!(conn_id = self.id, endpoint = %self.endpoint, direction = %self.direction, %reason, "Closing connection");

        if reason == CloseReason::Handshake {
            self.node.metrics().handshake_failed();
        }
        // Inbound endpoints carry the remote's ephemeral port; nothing to record.
        if reason.is_connect_phase() && self.direction == Direction::Outbound {
            self.node.metrics().connect_failure();
            self.node
                .reputation()
                .notify(self.endpoint, PeerEvent::ConnectFail);
        }

        self.node.protocol().on_closed(self, reason);

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(conn_id = self.id, error = %e, "Socket shutdown failed");
        }
        self.node.push_op(LoopOp::Deregister {
            id: self.id,
            endpoint: self.endpoint,
            stream: Arc::clone(&self.stream),
            established: self.is_established(),
        });
    }

    /// Mark a connection that never entered the table as closed, without side effects
    pub(crate) fn discard(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.cancel_timers();
    }
}

impl<P: Protocol> Drop for PeerConnection<P> {
    fn drop(&mut self) {
        let pool = self.node.buffer_pool();
        let bufs = self.buffers.get_mut();
        if bufs.read_pooled {
            pool.release(std::mem::take(&mut bufs.read));
        }
        if bufs.write_pooled {
            pool.release(std::mem::take(&mut bufs.write));
        }
    }
}
