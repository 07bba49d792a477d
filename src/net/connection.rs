//! One live duplex channel.
//!
//! A connection owns one TCP socket split into halves. The read task decodes
//! frames: replies resolve the matching pending promise, requests go to the
//! [`TransactionHandler`] and, unless oneway, get a reply frame back. The write
//! task drains a FIFO queue, so frames leave in the order they were submitted
//! no matter which thread submitted them.

use super::{
    worker::{StopSignal, Worker, WorkerState},
    Frame, Transaction,
};
use crate::{
    config::TransportConfig, dispatcher::DispatchError, lock, types::NodeId, Error, Promise,
};
use async_bincode::{tokio::AsyncBincodeWriter, AsyncDestination};
use bincode::Options;
use futures::{future, SinkExt};
use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, Weak,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type FrameReader = BufReader<OwnedReadHalf>;
type FrameWriter = AsyncBincodeWriter<OwnedWriteHalf, Frame, AsyncDestination>;
pub(crate) type TerminateHook = Box<dyn FnOnce(ConnectionId) + Send>;

/// Receives what arrives on a connection, on that connection's read task.
pub trait TransactionHandler: Send + Sync + 'static {
    /// Runs one inbound request. For a two-way request the outcome is sent
    /// back as the reply; for a oneway request an error is only logged.
    fn on_transact(
        &self,
        context: &ConnectionContext,
        transaction: &Transaction,
    ) -> Result<Vec<u8>, DispatchError>;

    /// The peer announced its node id.
    fn on_hello(&self, _context: &ConnectionContext) {}

    /// The connection terminated; no further calls follow.
    fn on_close(&self, _context: &ConnectionContext) {}
}

/// What the transport knows about a connection.
pub struct ConnectionContext {
    id: ConnectionId,
    local_node: NodeId,
    peer_node: OnceLock<NodeId>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection: Weak<ConnectionInner>,
}

impl ConnectionContext {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Known once the peer's handshake has been read.
    pub fn peer_node(&self) -> Option<NodeId> {
        self.peer_node.get().copied()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The connection this context belongs to, while it is alive.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("local_node", &self.local_node)
            .field("peer_node", &self.peer_node())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

struct Outbound {
    frame: Frame,
    /// Settled once a oneway request has been written.
    written: Option<Promise<Vec<u8>>>,
}

struct ConnectionInner {
    context: ConnectionContext,
    config: TransportConfig,
    handler: Arc<dyn TransactionHandler>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u32, Promise<Vec<u8>>>>,
    handshake: Promise<NodeId>,
    next_correlation_id: AtomicU32,
    /// Set under the `pending` lock; no call is registered afterwards.
    closed: AtomicBool,
    closing: AtomicBool,
    terminated: AtomicBool,
    reader: Worker,
    writer: Worker,
    on_terminate: Mutex<Option<TerminateHook>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Takes over `stream`, queues the handshake and starts the read and
    /// write tasks. `on_terminate` runs once when the connection dies, for
    /// whatever reason.
    pub(crate) fn start(
        stream: TcpStream,
        local_node: NodeId,
        handler: Arc<dyn TransactionHandler>,
        config: TransportConfig,
        on_terminate: Option<TerminateHook>,
    ) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer_addr, "cannot disable nagle: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::new_cyclic(|weak| ConnectionInner {
            context: ConnectionContext {
                id,
                local_node,
                peer_node: OnceLock::new(),
                local_addr,
                peer_addr,
                connection: weak.clone(),
            },
            config,
            handler,
            outbound,
            pending: Mutex::new(HashMap::new()),
            handshake: Promise::new(),
            next_correlation_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            reader: Worker::new(format!("reader {local_addr} <<>> {peer_addr}")),
            writer: Worker::new(format!("writer {local_addr} <<>> {peer_addr}")),
            on_terminate: Mutex::new(on_terminate),
        });

        // Queued before the writer starts, so it is always the first frame.
        inner.enqueue(Frame::Hello { node: local_node }, None);

        let frames: FrameReader = BufReader::new(read_half);
        let reader = inner.clone();
        inner.reader.start(move |stop| read_loop(reader, frames, stop));

        let sink: FrameWriter = AsyncBincodeWriter::from(write_half).for_async();
        let writer = inner.clone();
        inner.writer.start(move |stop| write_loop(writer, sink, queue, stop));

        debug!(connection = id, %local_addr, %peer_addr, "connection started");
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.context.id
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.inner.context
    }

    pub fn peer_node(&self) -> Option<NodeId> {
        self.inner.context.peer_node()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.context.peer_addr
    }

    /// True once the connection stopped accepting calls.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn reader_state(&self) -> WorkerState {
        self.inner.reader.state()
    }

    pub fn writer_state(&self) -> WorkerState {
        self.inner.writer.state()
    }

    /// Resolves with the peer's node id once its handshake arrived, after the
    /// handler saw it. Rejected if the connection dies first.
    pub fn handshake(&self) -> Promise<NodeId> {
        self.inner.handshake.clone()
    }

    /// Number of two-way calls still waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Sends `transaction` to the peer.
    ///
    /// A two-way call is registered under a fresh correlation id before the
    /// frame is queued and resolves with the reply. A oneway call resolves to
    /// an empty payload as soon as the frame has been written. Failures show
    /// up as rejections, never as a promise left pending after close.
    pub fn transact(&self, transaction: Transaction) -> Promise<Vec<u8>> {
        let inner = &self.inner;
        if transaction.is_oneway() {
            let written = Promise::new();
            let frame = Frame::Request { id: 0, transaction };
            if !inner.enqueue(frame, Some(written.clone())) {
                written.reject(Error::closed());
            }
            return written;
        }

        let promise = Promise::new();
        let id = {
            let mut pending = inner.lock_pending();
            if inner.closed.load(Ordering::Acquire) {
                return Promise::rejected(Error::closed());
            }
            let id = next_correlation_id(&inner.next_correlation_id, &*pending);
            pending.insert(id, promise.clone());
            id
        };

        let weak = Arc::downgrade(inner);
        promise.on_complete(move |outcome| {
            if matches!(outcome, Err(Error::Cancelled)) {
                if let Some(inner) = weak.upgrade() {
                    inner.lock_pending().remove(&id);
                }
            }
        });

        if !inner.enqueue(Frame::Request { id, transaction }, None) {
            inner.lock_pending().remove(&id);
            promise.reject(Error::closed());
        }
        promise
    }

    /// Stops both tasks, rejects every pending call and releases the socket.
    /// Each task gets the configured shutdown timeout before it is aborted.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = self.id(), peer = %self.peer_addr(), "closing connection");
        inner.terminate(Error::closed());

        let timeout = inner.config.shutdown_timeout;
        let (reader, writer) = future::join(inner.reader.join(timeout), inner.writer.join(timeout)).await;
        if !(reader && writer) {
            error!(connection = self.id(), "cannot shut down connection");
        } else {
            debug!(connection = self.id(), "connection has been closed");
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("context", &self.inner.context)
            .field("closed", &self.is_closed())
            .field("reader", &self.inner.reader)
            .field("writer", &self.inner.writer)
            .finish()
    }
}

impl ConnectionInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, Promise<Vec<u8>>>> {
        lock(&self.pending)
    }

    fn enqueue(&self, frame: Frame, written: Option<Promise<Vec<u8>>>) -> bool {
        self.outbound.send(Outbound { frame, written }).is_ok()
    }

    fn on_frame(&self, frame: Frame) {
        let connection = self.context.id;
        match frame {
            Frame::Hello { node } => {
                if self.context.peer_node.set(node).is_err() {
                    warn!(connection, node, "ignoring repeated handshake");
                    return;
                }
                debug!(connection, peer_node = node, "handshake received");
                self.handler.on_hello(&self.context);
                self.handshake.fulfill(node);
            }
            Frame::Request { id, transaction } => {
                let result = self.handler.on_transact(&self.context, &transaction);
                if transaction.is_oneway() {
                    if let Err(e) = result {
                        warn!(
                            connection,
                            binder = transaction.target(),
                            code = transaction.code(),
                            "oneway transaction failed: {e}"
                        );
                    }
                } else if !self.enqueue(Frame::Reply { id, result }, None) {
                    debug!(connection, id, "dropping reply, connection is closing");
                }
            }
            Frame::Reply { id, result } => {
                let waiter = self.lock_pending().remove(&id);
                match waiter {
                    Some(promise) => {
                        if !promise.complete(result.map_err(Error::from)) {
                            debug!(connection, id, "discarding late reply");
                        }
                    }
                    None => debug!(connection, id, "discarding reply to unknown transaction"),
                }
            }
        }
    }

    /// Marks the connection dead: stops both tasks, rejects pending calls
    /// and runs the close hooks once. Safe to call from either task.
    fn terminate(&self, reason: Error) {
        self.reader.stop();
        self.writer.stop();

        let orphaned: Vec<_> = {
            let mut pending = self.lock_pending();
            self.closed.store(true, Ordering::Release);
            pending.drain().map(|(_, promise)| promise).collect()
        };
        for promise in orphaned {
            promise.reject(reason.clone());
        }
        self.handshake.reject(reason.clone());

        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            connection = self.context.id,
            peer = %self.context.peer_addr,
            peer_node = ?self.context.peer_node(),
            "connection terminated: {reason}"
        );
        self.handler.on_close(&self.context);
        let hook = lock(&self.on_terminate).take();
        if let Some(hook) = hook {
            hook(self.context.id);
        }
    }

    fn fail_outbound(&self, outbound: Outbound, error: &Error) {
        if let Some(written) = outbound.written {
            written.reject(error.clone());
        }
        if let Frame::Request { id, .. } = outbound.frame {
            let waiter = self.lock_pending().remove(&id);
            if let Some(promise) = waiter {
                promise.reject(error.clone());
            }
        }
    }
}

/// Next id for a two-way call. Skips 0, which oneway requests use, and ids
/// still waiting for a reply after the counter wrapped.
fn next_correlation_id<V>(counter: &AtomicU32, pending: &HashMap<u32, V>) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 && !pending.contains_key(&id) {
            return id;
        }
    }
}

/// Reads one length-prefixed frame; `None` means the peer closed cleanly.
/// The prefix is checked against `max_frame_size` before anything is
/// buffered.
async fn read_frame(frames: &mut FrameReader, max_frame_size: usize) -> Result<Option<Frame>, Error> {
    let mut prefix = [0u8; 4];
    match frames.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_size {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds the limit of {max_frame_size}"
        )));
    }
    let mut body = vec![0u8; len];
    frames.read_exact(&mut body).await?;
    bincode::options()
        .allow_trailing_bytes()
        .deserialize(&body)
        .map(Some)
        .map_err(|e| Error::Protocol(e.to_string()))
}

async fn read_loop(inner: Arc<ConnectionInner>, mut frames: FrameReader, mut stop: StopSignal) {
    let connection = inner.context.id;
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = stop.stopped() => break Error::closed(),
            frame = read_frame(&mut frames, inner.config.max_frame_size) => frame,
        };
        match frame {
            Ok(Some(frame)) => inner.on_frame(frame),
            Err(e @ Error::Protocol(_)) => {
                warn!(connection, "dropping connection after malformed frame: {e}");
                break e;
            }
            Err(e) => {
                debug!(connection, "read failed: {e}");
                break e;
            }
            Ok(None) => {
                debug!(connection, worker = inner.reader.name(), "peer closed the connection");
                break Error::Transport("connection closed by peer".to_owned());
            }
        }
    };
    inner.terminate(reason);
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut sink: FrameWriter,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    mut stop: StopSignal,
) {
    let connection = inner.context.id;
    let reason = loop {
        let outbound = tokio::select! {
            biased;
            _ = stop.stopped() => break Error::closed(),
            outbound = queue.recv() => match outbound {
                Some(outbound) => outbound,
                None => break Error::closed(),
            },
        };
        let Outbound { frame, written } = outbound;
        let request_id = match &frame {
            Frame::Request { id, .. } if *id != 0 => Some(*id),
            _ => None,
        };
        match sink.send(frame).await {
            Ok(()) => {
                if let Some(written) = written {
                    written.fulfill(Vec::new());
                }
            }
            Err(e) => {
                let error = Error::Transport(format!("write failed: {e}"));
                error!(connection, worker = inner.writer.name(), "{error}");
                if let Some(written) = written {
                    written.reject(error.clone());
                }
                if let Some(id) = request_id {
                    let waiter = inner.lock_pending().remove(&id);
                    if let Some(promise) = waiter {
                        promise.reject(error.clone());
                    }
                }
                break error;
            }
        }
    };

    queue.close();
    while let Ok(outbound) = queue.try_recv() {
        inner.fail_outbound(outbound, &reason);
    }
    if let Err(e) = sink.get_mut().shutdown().await {
        debug!(connection, "cannot shut down write half: {e}");
    }
    inner.terminate(reason);
}
