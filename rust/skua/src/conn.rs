//! The per-connection serving core.
//!
//! Each accepted socket gets a [`ServeConn`] owning three tasks: a reader
//! that parses frames, a writer that serializes every outbound frame, and
//! the dispatch loop that runs handlers. Reader and dispatcher meet at a
//! single-slot gate — the reader hands over one frame and waits for the
//! acknowledgement before parsing the next — so at most one in-flight
//! frame buffer exists per connection and backpressure reaches the peer
//! through the socket.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use skua_wire::{Cmd, Frame, FrameFlags};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::errors::{FrameError, WriteError};
use crate::framing::{FrameReader, FrameWriter, ReadTimeout, ReaderConfig, WriteFrameRequest};
use crate::mux::Handler;
use crate::server::{Server, ServerShared};
use crate::stream::{Stream, StreamTable};

/// Per-connection data handlers may read and extend.
///
/// Carries the peer's address and a single user-data slot where a handler
/// can stash one value (typically at session setup) and read it back on
/// later requests.
pub struct ConnectionInfo {
    remote_addr: SocketAddr,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl ConnectionInfo {
    fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            user_data: Mutex::new(None),
        }
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Stash a value on the connection, replacing any previous one.
    pub fn set_user_data<T: Send + Sync + 'static>(&self, value: T) {
        *self.user_data.lock().unwrap() = Some(Arc::new(value));
    }

    /// The stashed value, if one is present and is a `T`.
    pub fn user_data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let slot = self.user_data.lock().unwrap();
        slot.as_ref()?.clone().downcast::<T>().ok()
    }

    /// Clear the slot, returning whatever was stashed.
    pub fn take_user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.lock().unwrap().take()
    }
}

/// A request frame bound to its stream and connection.
///
/// Derefs to the wire [`Frame`]; the connection rides along so handlers
/// can bind identities, register close notifiers, or stash user data
/// without any ambient context.
pub struct RequestFrame {
    frame: Frame,
    stream: Arc<Stream>,
    conn: Arc<ServeConn>,
}

impl RequestFrame {
    /// The stream this frame belongs to.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// The connection this frame arrived on.
    pub fn connection(&self) -> &Arc<ServeConn> {
        &self.conn
    }
}

impl Deref for RequestFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

/// What the reader hands to the dispatch loop: one frame plus the gate to
/// acknowledge once the frame buffer may be reused.
struct InboundFrame {
    frame: Frame,
    stream: Arc<Stream>,
    gate: oneshot::Sender<()>,
}

/// The server side of one connection.
///
/// Created by the accept loop; exclusively owns the connection's streams.
/// Shared between the dispatch loop, the reader/writer tasks, and any
/// handler task spawned for a `NON_BLOCK` request.
pub struct ServeConn {
    server: Arc<ServerShared>,
    pub(crate) binding_idx: usize,
    /// Key in the server's active-connection registry.
    pub(crate) key: u64,
    info: ConnectionInfo,
    id: Mutex<Option<String>>,
    pub(crate) streams: StreamTable,
    read_timeout: ReadTimeout,
    write_tx: mpsc::Sender<WriteFrameRequest>,
    /// Taken by `serve`; present only between construction and serving.
    write_rx: Mutex<Option<mpsc::Receiver<WriteFrameRequest>>>,
    /// Connection-level cancellation: reader, writer and dispatcher exit
    /// at their next suspension point once this flips.
    done_tx: watch::Sender<bool>,
    close_notify: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    /// Flipped by the first `untrack`; later callers wait on the channel.
    pub(crate) untracked: AtomicBool,
    untracked_tx: watch::Sender<bool>,
}

impl ServeConn {
    pub(crate) fn new(
        server: Arc<ServerShared>,
        binding_idx: usize,
        key: u64,
        remote_addr: SocketAddr,
    ) -> Arc<Self> {
        let read_timeout = ReadTimeout::new(server.bindings[binding_idx].default_read_timeout);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (done_tx, _) = watch::channel(false);
        let (untracked_tx, _) = watch::channel(false);
        Arc::new(Self {
            server,
            binding_idx,
            key,
            info: ConnectionInfo::new(remote_addr),
            id: Mutex::new(None),
            streams: StreamTable::new(),
            read_timeout,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            done_tx,
            close_notify: Mutex::new(Vec::new()),
            untracked: AtomicBool::new(false),
            untracked_tx,
        })
    }

    /// A handle to the server this connection arrived on.
    pub fn server(&self) -> Server {
        Server::from_shared(self.server.clone())
    }

    /// Per-connection info: remote address and the user-data store.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// The identity bound via [`set_id`](Self::set_id), if any.
    pub fn id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    /// A handle for adjusting the reader at runtime.
    pub fn reader(&self) -> ReaderConfig {
        ReaderConfig::new(self.read_timeout.clone())
    }

    /// A fresh writer for this connection. Writers may be used from any
    /// task; the connection's writer loop serializes all submissions.
    pub fn writer(&self) -> FrameWriter {
        FrameWriter::new(self.write_tx.clone())
    }

    /// Run `f` when the connection closes. Notifiers run in registration
    /// order, exactly once, on the task that performs the teardown.
    pub fn notify_when_close(&self, f: impl FnOnce() + Send + 'static) {
        self.close_notify.lock().unwrap().push(Box::new(f));
    }

    /// Bind an identity to this connection.
    ///
    /// If another connection on the same binding already holds `id`, that
    /// connection is force-closed and fully torn down (its close notifiers
    /// included) before this call returns. Re-binding the same id on the
    /// same connection is a no-op.
    ///
    /// # Panics
    ///
    /// Panics on an empty id; that is a programming error.
    pub async fn set_id(&self, id: &str) {
        assert!(!id.is_empty(), "skua: empty connection id");
        *self.id.lock().unwrap() = Some(id.to_string());
        self.server.bind_id(self.binding_idx, self.key, id).await;
    }

    /// Close the connection.
    ///
    /// Idempotent and race-free: the first caller performs the teardown
    /// (untrack, cancel the connection context, run close notifiers);
    /// every other caller waits for that teardown and returns the same
    /// outcome.
    pub async fn close(&self) {
        let (first, mut untracked) = self.server.untrack(self);
        if !first {
            let _ = untracked.wait_for(|done| *done).await;
            return;
        }
        // send_replace stores the value even while no task subscribed yet
        self.done_tx.send_replace(true);
        let notifiers: Vec<_> = {
            let mut notify = self.close_notify.lock().unwrap();
            notify.drain(..).collect()
        };
        for f in notifiers {
            f();
        }
        self.untracked_tx.send_replace(true);
    }

    pub(crate) fn untracked_channel(&self) -> watch::Receiver<bool> {
        self.untracked_tx.subscribe()
    }

    /// Serve the connection until it closes or `parent_done` fires.
    pub(crate) async fn serve(
        self: Arc<Self>,
        socket: TcpStream,
        parent_done: watch::Receiver<bool>,
    ) {
        let binding = &self.server.bindings[self.binding_idx];
        let (read_half, write_half) = socket.into_split();
        let reader = FrameReader::new(
            read_half,
            self.read_timeout.clone(),
            binding.max_frame_size(),
        );
        let write_timeout = binding.default_write_timeout;
        let write_rx = self
            .write_rx
            .lock()
            .unwrap()
            .take()
            .expect("serve called twice");

        let (read_tx, read_rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        tasks.spawn(read_frames(self.clone(), reader, read_tx));
        tasks.spawn(write_frames(self.clone(), write_half, write_rx, write_timeout));

        // connection-level panics are caught here, once
        let served = AssertUnwindSafe(dispatch_loop(&self, read_rx, parent_done))
            .catch_unwind()
            .await;
        if let Err(panic) = served {
            error!(
                remote = %self.info.remote_addr(),
                panic = %panic_message(&*panic),
                "connection panic"
            );
        }

        self.close().await;

        while let Some(task) = tasks.join_next().await {
            if let Err(e) = task {
                if e.is_panic() {
                    error!(remote = %self.info.remote_addr(), "connection task panic");
                }
            }
        }
    }

    fn instrument(&self, cmd: Cmd, error: Option<&str>, elapsed: Duration) {
        if let Some(latency) = &self.server.bindings[self.binding_idx].latency {
            latency.observe(cmd, error, elapsed);
        }
    }
}

impl std::fmt::Debug for ServeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeConn")
            .field("remote", &self.info.remote_addr)
            .field("binding_idx", &self.binding_idx)
            .field("id", &*self.id.lock().unwrap())
            .finish_non_exhaustive()
    }
}

/// The dispatch loop: waits for frames from the reader and runs handlers.
/// Blocking requests run inline (the gate opens after the handler
/// returns), `NON_BLOCK` requests open the gate first and run on their
/// own task.
async fn dispatch_loop(
    conn: &Arc<ServeConn>,
    mut read_rx: mpsc::Receiver<InboundFrame>,
    mut parent_done: watch::Receiver<bool>,
) {
    let handler = conn.server.bindings[conn.binding_idx].handler.clone();
    let mut done = conn.done_tx.subscribe();
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        let inbound = tokio::select! {
            _ = async { let _ = done.wait_for(|done| *done).await; } => break,
            _ = async { let _ = parent_done.wait_for(|done| *done).await; } => break,
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if joined.is_err_and(|e| e.is_panic()) {
                    error!(remote = %conn.info().remote_addr(), "handler task panic");
                    conn.close().await;
                }
                continue;
            }
            inbound = read_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        let InboundFrame { frame, stream, gate } = inbound;
        let request = RequestFrame {
            frame,
            stream,
            conn: conn.clone(),
        };

        if request.flags.contains(FrameFlags::NON_BLOCK) {
            let _ = gate.send(());
            let conn = conn.clone();
            let handler = handler.clone();
            handlers.spawn(async move {
                run_handler(&conn, &handler, request).await;
            });
        } else {
            run_handler(conn, &handler, request).await;
            let _ = gate.send(());
        }
    }

    // non-blocking handlers may still be in flight; the writer loop stays
    // up until close() so their responses drain normally
    while let Some(joined) = handlers.join_next().await {
        if joined.is_err_and(|e| e.is_panic()) {
            // close() follows as soon as this loop returns to serve()
            error!(remote = %conn.info().remote_addr(), "handler task panic");
        }
    }
}

/// Run one handler, isolating panics. Every completion is instrumented;
/// a panic additionally resets the stream unless it is already closed
/// from our side.
async fn run_handler(conn: &Arc<ServeConn>, handler: &Arc<dyn Handler>, request: RequestFrame) {
    let begin = Instant::now();
    let cmd = request.cmd;
    let request_id = request.request_id;
    let stream = request.stream.clone();

    let outcome = AssertUnwindSafe(handler.serve(conn.writer(), request))
        .catch_unwind()
        .await;
    let panic = outcome.err().map(|p| panic_message(&*p));
    conn.instrument(cmd, panic.as_deref(), begin.elapsed());

    if let Some(panic) = panic {
        error!(
            remote = %conn.info().remote_addr(),
            cmd,
            request_id,
            panic = %panic,
            "handler panic"
        );
        if !stream.is_self_closed() {
            let mut writer = conn.writer();
            writer.start_write(request_id, 0, FrameFlags::STREAM_RST);
            if let Err(e) = writer.end_write().await {
                error!(
                    remote = %conn.info().remote_addr(),
                    request_id,
                    error = %e,
                    "failed to send reset frame"
                );
            }
        }
    }
}

/// The reader task. Parses one frame, hands it to the dispatch loop, then
/// waits on the gate before parsing the next — the rendezvous that bounds
/// the connection to a single in-flight frame buffer.
async fn read_frames(
    conn: Arc<ServeConn>,
    mut reader: FrameReader<OwnedReadHalf>,
    read_tx: mpsc::Sender<InboundFrame>,
) {
    let mut done = conn.done_tx.subscribe();
    loop {
        let result = tokio::select! {
            result = reader.read_frame(&conn.streams) => result,
            _ = done.wait_for(|done| *done) => return,
        };
        let (frame, stream) = match result {
            Ok(frame) => frame,
            Err(FrameError::Eof) => {
                debug!(remote = %conn.info().remote_addr(), "peer closed connection");
                conn.close().await;
                return;
            }
            Err(e) => {
                warn!(remote = %conn.info().remote_addr(), error = %e, "read failed");
                conn.close().await;
                return;
            }
        };

        let (gate, gate_open) = oneshot::channel();
        let handoff = InboundFrame { frame, stream, gate };
        tokio::select! {
            sent = read_tx.send(handoff) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = done.wait_for(|done| *done) => return,
        }
        tokio::select! {
            _ = gate_open => {}
            _ = done.wait_for(|done| *done) => return,
        }
    }
}

/// The writer task: sole consumer of the write channel and sole writer of
/// the socket. Applies stream bookkeeping before each write and reports
/// the outcome back to the submitting task.
async fn write_frames(
    conn: Arc<ServeConn>,
    mut io: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<WriteFrameRequest>,
    timeout_secs: u64,
) {
    let mut done = conn.done_tx.subscribe();
    let deadline = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

    loop {
        let request = tokio::select! {
            request = write_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
            _ = async { let _ = done.wait_for(|done| *done).await; } => {
                let _ = io.shutdown().await;
                return;
            }
        };

        if request.flags.contains(FrameFlags::STREAM_RST) {
            let Some(stream) = conn.streams.get(request.request_id) else {
                let _ = request.done.send(Err(WriteError::RstNonExistingStream));
                continue;
            };
            if !stream.add_out_frame(request.flags) {
                // a reset is already on the wire; succeed without writing
                let _ = request.done.send(Ok(()));
                continue;
            }
            conn.streams.remove(request.request_id);
        } else if !request.flags.contains(FrameFlags::PUSH) {
            let stream = conn.streams.create_or_get(request.request_id);
            if !stream.add_out_frame(request.flags) {
                let _ = request.done.send(Err(WriteError::WriteAfterCloseSelf));
                continue;
            }
        }

        let write = async {
            match deadline {
                Some(deadline) => match tokio::time::timeout(deadline, io.write_all(&request.buf))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write deadline elapsed",
                    )),
                },
                None => io.write_all(&request.buf).await,
            }
        };
        // a close mustn't leave us wedged against a stalled peer
        let result = tokio::select! {
            result = write => result,
            _ = done.wait_for(|done| *done) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed during write",
            )),
        };

        match result {
            Ok(()) => {
                let _ = request.done.send(Ok(()));
            }
            Err(e) => {
                error!(remote = %conn.info().remote_addr(), error = %e, "socket write failed");
                conn.close().await;
                // deliver the outcome so the blocked caller returns
                let _ = request.done.send(Err(WriteError::Io(e)));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
