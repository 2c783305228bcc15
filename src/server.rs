//! The server: listener, accept loop, client registry and lifecycle.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_util::{
    codec::FramedWrite,
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    Result, WebSocketError,
    close::CloseCode,
    codec::{Encoder, Role},
    connection::Connection,
    events::{EventHandlers, Message},
    handshake,
    options::Options,
    session::Session,
};

/// The set of live connections, keyed by connection id.
///
/// The mutex guards nothing but the map itself; critical sections are
/// limited to insertion, removal and snapshotting.
pub(crate) struct Registry {
    clients: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, conn: Arc<Connection>) {
        self.clients.lock().unwrap().insert(conn.id(), conn);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

/// A WebSocket server.
///
/// [`start`](Self::start) binds the endpoint and spawns the accept loop;
/// [`stop`](Self::stop) shuts the listener, closes every live connection
/// with status 1001 and waits for all tasks, so no event fires after it
/// returns. Event handlers are fixed at construction.
pub struct Server {
    options: Options,
    handlers: EventHandlers,
    registry: Arc<Registry>,
    listening: AtomicBool,
    accept_token: Mutex<CancellationToken>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    negotiations: TaskTracker,
    sessions: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a server with the given options and event subscriptions.
    pub fn new(options: Options, handlers: EventHandlers) -> Self {
        Self {
            options,
            handlers,
            registry: Arc::new(Registry::new()),
            listening: AtomicBool::new(false),
            accept_token: Mutex::new(CancellationToken::new()),
            accept_task: Mutex::new(None),
            negotiations: TaskTracker::new(),
            sessions: TaskTracker::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds `addr` and starts accepting connections.
    ///
    /// Failure to bind is fatal and returned to the caller; nothing is
    /// retried.
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(WebSocketError::AlreadyListening);
        }

        let listener = match self.bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                self.listening.store(false, Ordering::Release);
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local_addr);

        let token = CancellationToken::new();
        *self.accept_token.lock().unwrap() = token.clone();
        self.negotiations.reopen();
        self.sessions.reopen();

        let loop_ctx = AcceptContext {
            options: self.options.clone(),
            handlers: self.handlers.clone(),
            registry: self.registry.clone(),
            token,
            negotiations: self.negotiations.clone(),
            sessions: self.sessions.clone(),
            handshakes: Arc::new(Semaphore::new(self.options.max_concurrent_handshakes)),
        };
        *self.accept_task.lock().unwrap() = Some(tokio::spawn(accept_loop(listener, loop_ctx)));

        tracing::info!(addr = %local_addr, "websocket listener started");
        Ok(())
    }

    fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.options.backlog)?)
    }

    /// Requests a graceful shutdown and waits for it to finish.
    ///
    /// The accept loop exits, in-flight handshakes are abandoned, every
    /// registered connection is closed with 1001 GoingAway (bounded by the
    /// close timeout), and all receive tasks are awaited. After `stop`
    /// returns no further event is fired.
    pub async fn stop(&self) {
        if !self.listening.swap(false, Ordering::AcqRel) {
            return;
        }

        // Close the listener and let in-flight negotiations wind down:
        // each either aborts on the cancelled token or finishes
        // registering its connection before the tracker drains.
        self.accept_token.lock().unwrap().cancel();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.negotiations.close();
        self.negotiations.wait().await;

        let clients = self.registry.snapshot();
        let closing = clients
            .iter()
            .map(|conn| conn.close(CloseCode::GoingAway, "server shutting down"));
        let _ = futures::future::join_all(closing).await;

        self.sessions.close();
        self.sessions.wait().await;

        tracing::info!("websocket listener stopped");
    }

    /// Whether the accept loop is running.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The bound address, once [`start`](Self::start) has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// A snapshot of the live connections, e.g. for broadcasting.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    /// Sends a message on a connection, reporting success as a flag
    /// instead of an error.
    pub async fn send(&self, conn: &Connection, message: Message) -> bool {
        match conn.send_message(message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(id = conn.id(), error = %err, "send failed");
                false
            }
        }
    }
}

struct AcceptContext {
    options: Options,
    handlers: EventHandlers,
    registry: Arc<Registry>,
    token: CancellationToken,
    negotiations: TaskTracker,
    sessions: TaskTracker,
    handshakes: Arc<Semaphore>,
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let options = ctx.options.clone();
                let handlers = ctx.handlers.clone();
                let registry = ctx.registry.clone();
                let token = ctx.token.clone();
                let sessions = ctx.sessions.clone();
                let handshakes = ctx.handshakes.clone();

                ctx.negotiations.spawn(async move {
                    // The pool bound applies here, off the accept task, so
                    // a burst of slow handshakes queues instead of
                    // stalling `accept`.
                    let Ok(permit) = handshakes.acquire_owned().await else {
                        return;
                    };
                    negotiate_connection(
                        stream, peer_addr, options, handlers, registry, token, sessions,
                    )
                    .await;
                    drop(permit);
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
            }
        }
    }
    // Dropping the listener here closes the socket.
}

/// Runs the handshake on one accepted socket and, on success, registers
/// the connection and hands it to its receive task.
async fn negotiate_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    options: Options,
    handlers: EventHandlers,
    registry: Arc<Registry>,
    token: CancellationToken,
    sessions: TaskTracker,
) {
    if options.nodelay {
        let _ = stream.set_nodelay(true);
    }

    let negotiated = tokio::select! {
        // Server shutdown abandons the handshake outright.
        _ = token.cancelled() => return,
        negotiated = handshake::negotiate(&mut stream, options.handshake_timeout) => negotiated,
    };

    let (request, leftover) = match negotiated {
        Ok(parts) => parts,
        Err(err) => {
            // Dispose silently: failed handshakes never reach the
            // application.
            tracing::debug!(%peer_addr, error = %err, "handshake failed");
            return;
        }
    };

    tracing::debug!(
        %peer_addr,
        method = %request.method,
        target = %request.target,
        "upgrade accepted"
    );

    let (read_half, write_half) = stream.into_split();
    let conn = Arc::new(Connection::new(
        registry.next_id(),
        peer_addr,
        request.query,
        request.headers,
        FramedWrite::new(write_half, Encoder::new(Role::Server)),
        CancellationToken::new(),
        options.close_timeout,
    ));

    registry.insert(conn.clone());
    handlers.emit_connect(&conn);

    let session = Session::new(conn, read_half, leftover, &options, handlers, registry);
    sessions.spawn(session.run());
}
