//! # Event Loop
//!
//! One dedicated thread owns the `mio` poll handle. It waits for readiness,
//! turns each event into a task on the owning connection's queue, and applies
//! registration changes requested by other threads.
//!
//! ## Cross-thread registration changes
//! Worker threads never re-register or deregister sockets themselves. They
//! push a [`LoopOp`] and wake the loop, which applies queued operations after
//! every wait. New sockets may be registered from any thread while holding
//! the read side of the fairness guard; the loop takes the write side for an
//! instant before each wait, so a registration in progress completes before
//! the loop blocks again.
//!
//! ## Admission
//! The loop keeps up to `max_outbound` outbound connections. Whenever a
//! connection goes away, a new endpoint is learned, or the admission interval
//! passes, it asks the reputation store for candidates and dials them.
//!
//! ## Shutdown
//! [`Node::shutdown`] stops the loop, closes every connection, waits for
//! in-flight tasks with a doubling back-off, shuts the worker pool down,
//! writes the reputation snapshot and releases the data directory lock.

use crate::config::NodeConfig;
use crate::core::codec::EnvelopeCodec;
use crate::core::endpoint::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Direction, Protocol};
use crate::reputation::record::PeerEvent;
use crate::reputation::store::{NotifyOutcome, ReputationStore};
use crate::transport::connection::{CloseReason, ConnTask, ConnectionState, PeerConnection};
use crate::transport::connection_table::ConnectionTable;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::lock_file::LockFile;
use crate::utils::metrics::Metrics;
use crate::utils::time::{Clock, SystemClock};
use crossbeam::queue::SegQueue;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, instrument, trace, warn};

const WAKER: Token = Token(usize::MAX);
const LISTENER: Token = Token(usize::MAX - 1);

/// Readiness events handled per wait
const EVENTS_CAPACITY: usize = 1024;

/// Interval between admission passes when nothing else triggers one
const ADMISSION_INTERVAL: Duration = Duration::from_secs(1);

/// Checks of the in-flight task count before shutdown proceeds anyway
const SHUTDOWN_ATTEMPTS: u32 = 5;

/// Registration change applied on the loop thread
pub enum LoopOp {
    Reregister {
        id: u64,
        interest: Interest,
    },
    /// Remove a closed connection; the stream keeps its descriptor open until then
    Deregister {
        id: u64,
        endpoint: Endpoint,
        stream: Arc<TcpStream>,
        established: bool,
    },
    Admit,
}

impl fmt::Debug for LoopOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopOp::Reregister { id, interest } => f
                .debug_struct("Reregister")
                .field("id", id)
                .field("interest", interest)
                .finish(),
            LoopOp::Deregister { id, endpoint, .. } => f
                .debug_struct("Deregister")
                .field("id", id)
                .field("endpoint", endpoint)
                .finish(),
            LoopOp::Admit => f.write_str("Admit"),
        }
    }
}

/// Decrements the in-flight task count when the task ends or is dropped unrun
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by the loop thread, worker tasks and the [`Node`] handle
pub struct NodeContext<P: Protocol> {
    config: NodeConfig,
    protocol: Arc<P>,
    codec: EnvelopeCodec,
    table: ConnectionTable<PeerConnection<P>>,
    reputation: Arc<ReputationStore>,
    pool: BufferPool,
    metrics: Arc<Metrics>,
    ops: SegQueue<LoopOp>,
    waker: Waker,
    registry: Registry,
    guard: RwLock<()>,
    runtime: Handle,
    next_id: AtomicU64,
    fatal: Mutex<Option<ProtocolError>>,
    running: AtomicBool,
    admit_pending: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
}

impl<P: Protocol> fmt::Debug for NodeContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("connections", &self.table.len())
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<P: Protocol> NodeContext<P> {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Listening address, if the node accepts connections
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection(&self, id: u64) -> Option<Arc<PeerConnection<P>>> {
        self.table.get(id)
    }

    pub fn connection_to(&self, endpoint: &Endpoint) -> Option<Arc<PeerConnection<P>>> {
        self.table.get_by_endpoint(endpoint)
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection<P>>> {
        self.table.values()
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Whether one of our own connections uses `nonce`
    pub fn has_local_nonce(&self, nonce: u64) -> bool {
        self.table.any(|c| c.nonce() == nonce)
    }

    /// Feed an advertised endpoint to the reputation store.
    ///
    /// A previously unknown endpoint triggers an admission pass. Endpoints
    /// that cannot be dialed are ignored.
    pub fn learn(&self, endpoint: Endpoint) -> NotifyOutcome {
        if endpoint.is_unroutable() {
            trace!(%endpoint, "Ignoring unroutable endpoint");
            return NotifyOutcome::Unchanged;
        }
        let claimed = endpoint.timestamp().unwrap_or(0);
        let outcome = self
            .reputation
            .notify(endpoint, PeerEvent::PeerNotify { claimed });
        if outcome == NotifyOutcome::New {
            trace!(%endpoint, "Learned new endpoint");
            self.request_admission();
        }
        outcome
    }

    pub(crate) fn push_op(&self, op: LoopOp) {
        self.ops.push(op);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake event loop");
        }
    }

    pub(crate) fn request_admission(&self) {
        if !self.admit_pending.swap(true, Ordering::SeqCst) {
            self.push_op(LoopOp::Admit);
        }
    }

    /// Run `work` on the worker pool, counted until it finishes
    pub(crate) fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let in_flight = InFlight::new(&self.in_flight);
        self.runtime.spawn(async move {
            let _in_flight = in_flight;
            work();
        });
    }

    /// Stop the loop with a fatal error
    fn fail(&self, err: ProtocolError) {
        error!(error = %err, "Fatal event loop error");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.running.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Open an outbound connection to `endpoint`
    #[instrument(level = "debug", skip(self, endpoint), fields(%endpoint))]
    pub fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<Arc<PeerConnection<P>>> {
        self.reputation.notify(endpoint, PeerEvent::ConnectAttempt);
        self.dial(endpoint)
    }

    /// Dial an endpoint whose attempt has already been recorded
    fn dial(self: &Arc<Self>, endpoint: Endpoint) -> Result<Arc<PeerConnection<P>>> {
        if !self.is_running() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.table.contains_endpoint(&endpoint) {
            return Err(ProtocolError::AlreadyConnected(endpoint.to_string()));
        }
        self.metrics.connect_attempt();

        let stream = match TcpStream::connect(endpoint.socket_addr()) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%endpoint, error = %e, "Connect failed immediately");
                self.metrics.connect_failure();
                self.reputation.notify(endpoint, PeerEvent::ConnectFail);
                return Err(e.into());
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = PeerConnection::new(
            self,
            id,
            stream,
            endpoint,
            Direction::Outbound,
        );
        self.insert(&conn)?;
        conn.begin(ConnectionState::Connecting);

        let fd = conn.raw_fd();
        let registered = {
            let _guard = self.guard.read();
            let result = self.registry.register(
                &mut SourceFd(&fd),
                Token(id as usize),
                Interest::READABLE | Interest::WRITABLE,
            );
            self.wake();
            result
        };
        if let Err(e) = registered {
            warn!(conn_id = id, %endpoint, error = %e, "Failed to register outbound socket");
            conn.close(CloseReason::KeyRegistration);
            return Err(e.into());
        }

        let network = &self.config.network;
        conn.arm_timer(network.connect_timeout, || ConnTask::ConnectTimeout);
        conn.arm_timer(network.handshake_timeout(), || ConnTask::HandshakeTimeout);
        debug!(conn_id = id, %endpoint, "Dialing");
        Ok(conn)
    }

    fn insert(&self, conn: &Arc<PeerConnection<P>>) -> Result<()> {
        match self.table.insert(Arc::clone(conn)) {
            Ok(()) => Ok(()),
            Err(e) => {
                conn.discard();
                if e.is_fatal() {
                    self.fail(ProtocolError::InvariantViolation(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Accept until the listener would block
    fn accept(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            let (stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            };

            let inbound = self.table.count(|c| c.direction() == Direction::Inbound);
            if inbound >= self.config.network.max_inbound {
                debug!(%addr, inbound, "Inbound limit reached, dropping connection");
                continue;
            }

            let endpoint = Endpoint::from_socket_addr(addr);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let conn = PeerConnection::new(
                self,
                id,
                stream,
                endpoint,
                Direction::Inbound,
            );
            if let Err(e) = self.insert(&conn) {
                debug!(%endpoint, error = %e, "Rejecting inbound connection");
                if e.is_fatal() {
                    return;
                }
                continue;
            }
            conn.begin(ConnectionState::Connected);
            conn.mark_established();

            let fd = conn.raw_fd();
            if let Err(e) =
                self.registry
                    .register(&mut SourceFd(&fd), Token(id as usize), Interest::READABLE)
            {
                warn!(conn_id = id, %endpoint, error = %e, "Failed to register inbound socket");
                conn.close(CloseReason::KeyRegistration);
                continue;
            }
            conn.arm_timer(self.config.network.handshake_timeout(), || {
                ConnTask::HandshakeTimeout
            });
            debug!(conn_id = id, %endpoint, "Accepted inbound connection");
            conn.submit(ConnTask::Accepted);
        }
    }

    /// Dial reputation candidates up to the outbound target
    fn admit(self: &Arc<Self>) {
        self.admit_pending.store(false, Ordering::SeqCst);
        if !self.is_running() {
            return;
        }
        let outbound = self.table.count(|c| c.direction() == Direction::Outbound);
        let want = self.config.network.max_outbound.saturating_sub(outbound);
        if want == 0 {
            return;
        }
        let connected = self.table.endpoints();
        for endpoint in self.reputation.select_candidates(&connected, want) {
            if let Err(e) = self.dial(endpoint) {
                if e.is_fatal() {
                    return;
                }
                debug!(%endpoint, error = %e, "Candidate dial failed");
            }
        }
    }

    /// Apply queued registration changes
    fn drain_ops(self: &Arc<Self>) -> Result<()> {
        let mut admit = false;
        while let Some(op) = self.ops.pop() {
            match op {
                LoopOp::Reregister { id, interest } => {
                    let Some(conn) = self.table.get(id) else {
                        continue;
                    };
                    if conn.is_closed() {
                        continue;
                    }
                    let fd = conn.raw_fd();
                    if let Err(e) =
                        self.registry
                            .reregister(&mut SourceFd(&fd), Token(id as usize), interest)
                    {
                        warn!(conn_id = id, error = %e, "Failed to re-register socket");
                        conn.close(CloseReason::KeyRegistration);
                    }
                }
                LoopOp::Deregister {
                    id,
                    endpoint,
                    stream,
                    established,
                } => {
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                        trace!(conn_id = id, error = %e, "Deregister failed");
                    }
                    drop(stream);
                    self.table.remove(id, &endpoint)?;
                    if established {
                        self.metrics.connection_closed();
                    }
                    admit = true;
                }
                LoopOp::Admit => admit = true,
            }
        }
        if admit {
            self.admit();
        }
        Ok(())
    }

    /// Body of the loop thread
    fn run(self: &Arc<Self>, mut poll: Poll, listener: Option<TcpListener>) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let poll_timeout = self.config.transport.poll_timeout;
        let save_interval = self.config.reputation.save_interval;
        let mut last_save = Instant::now();
        let mut last_admission = Instant::now();

        info!(listen = ?self.local_addr, "Event loop started");
        while self.is_running() {
            drop(self.guard.write());
            if let Err(e) = poll.poll(&mut events, Some(poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ProtocolError::EventLoop(format!("poll failed: {e}")));
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => {
                        if let Some(listener) = &listener {
                            self.accept(listener);
                        }
                    }
                    Token(token) => {
                        let Some(conn) = self.table.get(token as u64) else {
                            continue;
                        };
                        let failed = event.is_error();
                        conn.on_ready(
                            event.is_readable() || event.is_read_closed() || failed,
                            event.is_writable() || event.is_write_closed() || failed,
                        );
                    }
                }
            }

            self.drain_ops()?;

            if last_admission.elapsed() >= ADMISSION_INTERVAL {
                last_admission = Instant::now();
                self.admit();
            }
            if last_save.elapsed() >= save_interval {
                last_save = Instant::now();
                self.reputation.request_save(&self.runtime);
            }
        }

        info!(connections = self.table.len(), "Event loop stopping");
        for conn in self.table.values() {
            conn.close(CloseReason::LocalDisconnect);
        }
        let drained = self.drain_ops();
        match self.fatal.lock().take() {
            Some(err) => Err(err),
            None => drained,
        }
    }
}

/// Handle to a running node
pub struct Node<P: Protocol> {
    context: Arc<NodeContext<P>>,
    loop_thread: Option<JoinHandle<Result<()>>>,
    runtime: Option<Runtime>,
    lock: Option<LockFile>,
}

impl<P: Protocol> fmt::Debug for Node<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("context", &self.context)
            .field("stopped", &self.loop_thread.is_none())
            .finish()
    }
}

impl<P: Protocol> Node<P> {
    /// Start a node: lock the data directory, load the reputation snapshot,
    /// bind the listener and launch the event loop.
    pub fn start(config: NodeConfig, protocol: P) -> Result<Self> {
        Self::start_with_clock(config, protocol, Arc::new(SystemClock))
    }

    /// Start with a custom clock for reputation timestamps
    pub fn start_with_clock(config: NodeConfig, protocol: P, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate_strict()?;
        let lock = LockFile::acquire(config.lock_path())?;
        let metrics = Arc::new(Metrics::new());
        let reputation = Arc::new(
            ReputationStore::open(config.snapshot_path(), &config.reputation, clock)
                .with_metrics(Arc::clone(&metrics)),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.transport.worker_threads)
            .thread_name("peernet-worker")
            .enable_time()
            .build()?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = poll.registry().try_clone()?;

        let mut listener = None;
        let mut local_addr = None;
        if let Some(address) = &config.network.listen_address {
            let addr: SocketAddr = address.parse().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid listen address: '{address}'"))
            })?;
            let mut bound = TcpListener::bind(addr)?;
            registry.register(&mut bound, LISTENER, Interest::READABLE)?;
            local_addr = Some(bound.local_addr()?);
            listener = Some(bound);
        }

        let codec = EnvelopeCodec::new(protocol.magic(), config.transport.max_message_size);
        let pool = BufferPool::new(
            config.transport.buffer_pool_depth,
            config.transport.max_message_size,
        );

        let context = Arc::new(NodeContext {
            protocol: Arc::new(protocol),
            codec,
            table: ConnectionTable::new(),
            reputation,
            pool,
            metrics,
            ops: SegQueue::new(),
            waker,
            registry,
            guard: RwLock::new(()),
            runtime: runtime.handle().clone(),
            next_id: AtomicU64::new(1),
            fatal: Mutex::new(None),
            running: AtomicBool::new(true),
            admit_pending: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            local_addr,
            config,
        });

        let now = context.reputation.now();
        for seed in &context.config.network.seed_peers {
            match seed.parse::<SocketAddr>() {
                Ok(addr) => {
                    context
                        .reputation
                        .notify(Endpoint::from(addr), PeerEvent::PeerNotify { claimed: now });
                }
                Err(_) => warn!(seed = %seed, "Ignoring unparsable seed peer"),
            }
        }

        let loop_context = Arc::clone(&context);
        let loop_thread = std::thread::Builder::new()
            .name("peernet-loop".into())
            .spawn(move || {
                let result = loop_context.run(poll, listener);
                if let Err(e) = &result {
                    error!(error = %e, "Event loop terminated");
                    loop_context.running.store(false, Ordering::SeqCst);
                }
                result
            })?;

        context.request_admission();
        info!(
            listen = ?context.local_addr,
            records = context.reputation.len(),
            "Node started"
        );

        Ok(Self {
            context,
            loop_thread: Some(loop_thread),
            runtime: Some(runtime),
            lock: Some(lock),
        })
    }

    /// Shared node state
    pub fn context(&self) -> &Arc<NodeContext<P>> {
        &self.context
    }

    /// Open an outbound connection; the attempt is recorded in the reputation store
    pub fn connect(&self, endpoint: impl Into<Endpoint>) -> Result<Arc<PeerConnection<P>>> {
        self.context.connect(endpoint.into())
    }

    pub fn connection(&self, id: u64) -> Option<Arc<PeerConnection<P>>> {
        self.context.connection(id)
    }

    pub fn connection_to(&self, endpoint: impl Into<Endpoint>) -> Option<Arc<PeerConnection<P>>> {
        self.context.connection_to(&endpoint.into())
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection<P>>> {
        self.context.connections()
    }

    pub fn connection_count(&self) -> usize {
        self.context.connection_count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.context.local_addr()
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        self.context.reputation()
    }

    pub fn metrics(&self) -> &Metrics {
        self.context.metrics()
    }

    pub fn protocol(&self) -> &P {
        self.context.protocol()
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running() && self.loop_thread.is_some()
    }

    /// Stop the node and release its resources.
    ///
    /// Returns the event loop's fatal error, if it died of one. The snapshot
    /// is written and the lock released either way.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(loop_thread) = self.loop_thread.take() else {
            return Ok(());
        };
        info!("Shutting down node");
        self.context.running.store(false, Ordering::SeqCst);
        self.context.wake();
        let loop_result = loop_thread
            .join()
            .unwrap_or_else(|_| Err(ProtocolError::EventLoop("event loop thread panicked".into())));

        let mut delay = self.context.config.transport.shutdown_backoff;
        for attempt in 1..=SHUTDOWN_ATTEMPTS {
            let pending = self.context.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            warn!(pending, attempt, delay_ms = delay.as_millis() as u64, "Waiting for in-flight tasks");
            std::thread::sleep(delay);
            delay *= 2;
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.context.config.transport.shutdown_backoff);
        }

        match self.context.reputation.save_now() {
            Ok(count) => info!(records = count, "Saved reputation snapshot"),
            Err(e) => warn!(error = %e, "Final reputation save failed"),
        }

        drop(self.lock.take());
        info!("Node stopped");
        loop_result
    }
}

impl<P: Protocol> Drop for Node<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Node stopped with error");
        }
    }
}
