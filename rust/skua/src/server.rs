//! Server lifecycle: bindings, accept loops, registries, shutdown, push.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skua_wire::{Cmd, DEFAULT_MAX_FRAME_SIZE, FrameFlags};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::conn::ServeConn;
use crate::errors::{ServerError, WriteError};
use crate::metrics::LatencyObserver;
use crate::mux::Handler;

/// Accept deadline; bounds how far shutdown can lag behind the signal.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Keepalive period applied to every accepted socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);
/// Backoff bounds for transient accept errors.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
/// How often `shutdown` re-checks for quiescence.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for one listening endpoint.
pub struct ServerBinding {
    pub(crate) addr: String,
    pub(crate) handler: Arc<dyn Handler>,
    /// Per-frame read deadline in seconds; zero disables it.
    pub(crate) default_read_timeout: u64,
    /// Per-frame write deadline in seconds; zero disables it.
    pub(crate) default_write_timeout: u64,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) latency: Option<Arc<dyn LatencyObserver>>,
}

impl ServerBinding {
    /// A binding with no deadlines and the default frame size limit.
    pub fn new(addr: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
            default_read_timeout: 0,
            default_write_timeout: 0,
            max_frame_size: None,
            latency: None,
        }
    }

    /// Set the per-frame read deadline, in seconds.
    pub fn with_read_timeout(mut self, secs: u64) -> Self {
        self.default_read_timeout = secs;
        self
    }

    /// Set the per-frame write deadline, in seconds.
    pub fn with_write_timeout(mut self, secs: u64) -> Self {
        self.default_write_timeout = secs;
        self
    }

    /// Override the payload size limit (defaults to 10 MiB).
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = Some(max);
        self
    }

    /// Attach a latency observer for this binding.
    pub fn with_latency(mut self, latency: Arc<dyn LatencyObserver>) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }
}

pub(crate) struct ServerState {
    /// `id → connection`, per binding. At most one live connection per id.
    id2conn: Vec<HashMap<String, Arc<ServeConn>>>,
    /// Connections created and not yet untracked, per binding.
    active: Vec<HashMap<u64, Arc<ServeConn>>>,
}

pub(crate) struct ServerShared {
    pub(crate) bindings: Vec<ServerBinding>,
    state: Mutex<ServerState>,
    /// Listeners bound by `listen`, waiting for `serve` to take them.
    staged: Mutex<Vec<TcpListener>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    done_tx: watch::Sender<bool>,
    push_id: AtomicU64,
    conn_seq: AtomicU64,
    /// Accept loops plus connection serve tasks still running.
    live_tasks: AtomicUsize,
}

/// Construct a connection for an accepted socket and track it.
fn track_new_conn(
    shared: &Arc<ServerShared>,
    binding_idx: usize,
    remote: SocketAddr,
) -> Arc<ServeConn> {
    let key = shared.conn_seq.fetch_add(1, Ordering::AcqRel) + 1;
    let conn = ServeConn::new(shared.clone(), binding_idx, key, remote);
    shared
        .state
        .lock()
        .unwrap()
        .active[binding_idx]
        .insert(key, conn.clone());
    conn
}

impl ServerShared {
    /// Remove `conn` from the registries.
    ///
    /// Only the first caller actually untracks; it gets `true` and must
    /// perform the teardown. Later callers get `false` and the channel
    /// that flips once teardown finished.
    pub(crate) fn untrack(&self, conn: &ServeConn) -> (bool, watch::Receiver<bool>) {
        let first = !conn.untracked.swap(true, Ordering::AcqRel);
        if first {
            let mut state = self.state.lock().unwrap();
            if let Some(id) = conn.id() {
                let map = &mut state.id2conn[conn.binding_idx];
                // the id may have been taken over already; only remove our own entry
                if map.get(&id).is_some_and(|holder| holder.key == conn.key) {
                    map.remove(&id);
                }
            }
            state.active[conn.binding_idx].remove(&conn.key);
        }
        (first, conn.untracked_channel())
    }

    /// Install the connection identified by `(binding_idx, key)` as the
    /// holder of `id`, force-closing any previous holder. The previous
    /// holder's teardown is awaited after the registry lock is dropped.
    /// A connection that is already untracked is not bound.
    pub(crate) async fn bind_id(&self, binding_idx: usize, key: u64, id: &str) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.active[binding_idx].get(&key).cloned() else {
                return;
            };
            let map = &mut state.id2conn[binding_idx];
            if let Some(existing) = map.get(id) {
                if existing.key == key {
                    return;
                }
            }
            map.insert(id.to_string(), conn)
        };
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    async fn wait_quiesced(&self) {
        while self.live_tasks.load(Ordering::Acquire) != 0 {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

/// A framed, multiplexed RPC server.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server from its bindings.
    pub fn new(bindings: Vec<ServerBinding>) -> Self {
        let n = bindings.len();
        Self {
            shared: Arc::new(ServerShared {
                bindings,
                state: Mutex::new(ServerState {
                    id2conn: vec![HashMap::new(); n],
                    active: vec![HashMap::new(); n],
                }),
                staged: Mutex::new(Vec::new()),
                local_addrs: Mutex::new(Vec::new()),
                done_tx: watch::channel(false).0,
                push_id: AtomicU64::new(0),
                conn_seq: AtomicU64::new(0),
                live_tasks: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ServerShared>) -> Self {
        Self { shared }
    }

    /// Bind every configured listener. On any failure all listeners are
    /// released and the error returned.
    pub async fn listen(&self) -> Result<(), ServerError> {
        for binding in &self.shared.bindings {
            match TcpListener::bind(binding.addr.as_str()).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    self.shared.local_addrs.lock().unwrap().push(addr);
                    self.shared.staged.lock().unwrap().push(listener);
                }
                Err(e) => {
                    self.shared.staged.lock().unwrap().clear();
                    self.shared.local_addrs.lock().unwrap().clear();
                    return Err(ServerError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// The bound addresses, in binding order. Useful when a binding asked
    /// for port zero.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared.local_addrs.lock().unwrap().clone()
    }

    /// Serve previously bound listeners until [`shutdown`](Self::shutdown).
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listeners: Vec<TcpListener> = {
            let mut staged = self.shared.staged.lock().unwrap();
            staged.drain(..).collect()
        };
        if listeners.len() != self.shared.bindings.len() {
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serve called before listen",
            )));
        }

        let mut accept_tasks = JoinSet::new();
        for (idx, listener) in listeners.into_iter().enumerate() {
            self.shared.live_tasks.fetch_add(1, Ordering::AcqRel);
            let shared = self.shared.clone();
            accept_tasks.spawn(async move {
                let result = accept_loop(shared.clone(), listener, idx).await;
                shared.live_tasks.fetch_sub(1, Ordering::AcqRel);
                result
            });
        }

        while let Some(joined) = accept_tasks.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(ServerError::Closed)) => {}
                Ok(Err(ServerError::Io(e))) => error!(error = %e, "accept loop failed"),
                Err(e) => error!(error = %e, "accept task failed"),
            }
        }

        // accept loops are done; connections may still be draining
        self.shared.wait_quiesced().await;
        Ok(())
    }

    /// Bind all listeners and serve until [`shutdown`](Self::shutdown).
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        self.listen().await?;
        self.serve().await
    }

    /// Gracefully stop the server: close listeners, stop accepting, then
    /// wait for every connection — in-flight handlers included — to drain.
    pub async fn shutdown(&self) {
        self.shared.staged.lock().unwrap().clear();
        // send_replace stores the value even if no accept loop started yet
        self.shared.done_tx.send_replace(true);
        self.shared.wait_quiesced().await;
    }

    /// Push a server-initiated frame to `conn`.
    ///
    /// The frame carries a server-monotonic request id and exactly the
    /// `PUSH` flag, so it bypasses stream bookkeeping. Thread-safe across
    /// concurrent pushes: the connection's writer loop serializes every
    /// submission.
    pub async fn push_frame(
        &self,
        conn: &ServeConn,
        cmd: Cmd,
        payload: &[u8],
    ) -> Result<(), WriteError> {
        let push_id = self.shared.push_id.fetch_add(1, Ordering::AcqRel) + 1;
        let mut writer = conn.writer();
        writer.start_write(push_id, cmd, FrameFlags::PUSH);
        writer.write_bytes(payload);
        writer.end_write().await
    }

    /// Look up the connection holding `id` on a binding.
    pub fn conn_by_id(&self, binding_idx: usize, id: &str) -> Option<Arc<ServeConn>> {
        let state = self.shared.state.lock().unwrap();
        state.id2conn.get(binding_idx)?.get(id).cloned()
    }

    /// Number of tracked connections on a binding.
    pub fn active_conn_count(&self, binding_idx: usize) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.active.get(binding_idx).map_or(0, |conns| conns.len())
    }

    /// Snapshot of the tracked connections on a binding, for push or
    /// broadcast use cases.
    pub fn connections(&self, binding_idx: usize) -> Vec<Arc<ServeConn>> {
        let state = self.shared.state.lock().unwrap();
        state
            .active
            .get(binding_idx)
            .map_or_else(Vec::new, |conns| conns.values().cloned().collect())
    }
}

/// One accept loop per binding. Returns `ServerError::Closed` after the
/// shutdown signal; transient accept errors back off exponentially.
async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    binding_idx: usize,
) -> Result<(), ServerError> {
    let mut done = shared.done_tx.subscribe();
    // cancels this binding's connections once the loop returns
    let (parent_done_tx, parent_done_rx) = watch::channel(false);
    let mut backoff = Duration::ZERO;

    let result = loop {
        if *done.borrow() {
            break Err(ServerError::Closed);
        }
        let accepted = tokio::select! {
            accepted = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()) => accepted,
            _ = done.wait_for(|done| *done) => break Err(ServerError::Closed),
        };
        let (socket, remote) = match accepted {
            // the accept deadline exists only to keep shutdown responsive
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) if is_temporary(&e) => {
                backoff = if backoff.is_zero() {
                    ACCEPT_BACKOFF_INITIAL
                } else {
                    (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                };
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            Ok(Err(e)) => break Err(ServerError::Io(e)),
        };
        backoff = Duration::ZERO;

        if let Err(e) = configure_keepalive(&socket) {
            debug!(error = %e, "could not enable keepalive");
        }

        let conn = track_new_conn(&shared, binding_idx, remote);
        let parent_done = parent_done_rx.clone();
        let task_shared = shared.clone();
        shared.live_tasks.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            conn.serve(socket, parent_done).await;
            task_shared.live_tasks.fetch_sub(1, Ordering::AcqRel);
        });
    };

    // the listener drops here; signal the binding's connections to drain
    parent_done_tx.send_replace(true);
    result
}

fn configure_keepalive(socket: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(socket);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
