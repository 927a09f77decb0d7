pub mod dns;
pub mod frame;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod session;
pub mod stream_open;

use bytes::{Bytes, BytesMut};
use session::{Action, BridgeState, Session, WsState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use frame::CLOSE_GOING_AWAY;

/// TCP connection timeout for outbound XMPP server connections, per endpoint.
///
/// Without this, the OS default applies, which can be minutes for
/// unreachable hosts while the browser waits with no feedback.
const TCP_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Read size for both sockets.
const READ_BUFFER_SIZE: usize = 8192;

/// Upstream events queued for the connection task before reads pause.
const UPSTREAM_CHANNEL_CAPACITY: usize = 16;

/// Unwritten bytes queued for one socket before the other side's reads pause.
const MAX_WRITE_BACKLOG: usize = 1024 * 1024;

/// How long a closing connection may take to flush its output before the
/// sockets are dropped.
const CLOSE_FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Monotonic connection id for correlating logs across tasks.
static NEXT_PROXY_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection handler panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "Connection closed");
    }
}

/// WebSocket-to-XMPP gateway.
///
/// Binds one listener; every accepted browser connection gets its own task,
/// its own [`Session`] and its own upstream TCP connection to the XMPP server
/// named in the browser's stream header.
pub struct XmppProxy {
    config: Arc<Config>,
    /// Listener address once started
    local_addr: Option<SocketAddr>,
    /// Accept loop handle
    task: Option<JoinHandle<()>>,
    /// Shutdown signal, also delivered to every connection task
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
    /// Active connection counter (for diagnostics/logging)
    active_connections: Arc<AtomicUsize>,
}

impl XmppProxy {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            local_addr: None,
            task: None,
            shutdown_tx: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Bind the listener and start accepting connections in the background.
    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if let Some(addr) = self.local_addr {
            return Err(ProxyError::AlreadyRunning(addr));
        }

        let bind_addr = (self.config.listen.as_str(), self.config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: format!("{}:{}", self.config.listen, self.config.port),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "WebSocket listener bound");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let active_connections = self.active_connections.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            info!(addr = %addr, "New WebSocket connection");
                            let shutdown = shutdown_tx.subscribe();
                            let conn_counter = active_connections.clone();
                            let config = config.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, config, shutdown, conn_counter).await {
                                    error!(error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        });

        self.task = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting and ask every open connection to close with 1001.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.local_addr = None;
    }
}

/// Reports from the upstream connect and reader tasks.
#[derive(Debug)]
enum UpstreamEvent {
    Connected(TcpStream),
    Data(Bytes),
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Browser,
    Upstream,
}

enum WriteCommand {
    Data(Bytes),
    Shutdown,
}

/// Reports from a socket writer task.
#[derive(Debug)]
enum WriterEvent {
    Written(Side, usize),
    Failed(Side, String),
}

/// Write half of a socket, owned by its own task so a peer that stops
/// reading never blocks the connection task.
struct SocketWriter {
    side: Side,
    commands: mpsc::UnboundedSender<WriteCommand>,
    task: JoinHandle<()>,
    /// Bytes handed to the task and not yet written.
    backlog: usize,
}

impl SocketWriter {
    fn spawn(side: Side, writer: OwnedWriteHalf, events: mpsc::UnboundedSender<WriterEvent>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        Self {
            side,
            commands,
            task: tokio::spawn(write_socket(side, writer, rx, events)),
            backlog: 0,
        }
    }

    /// Queue `bytes`. Returns false once the task has stopped.
    fn write(&mut self, bytes: Bytes) -> bool {
        let len = bytes.len();
        if self.commands.send(WriteCommand::Data(bytes)).is_err() {
            return false;
        }
        self.backlog += len;
        true
    }

    fn written(&mut self, len: usize) {
        self.backlog = self.backlog.saturating_sub(len);
    }

    /// Shut the socket down once everything queued so far is written.
    fn shutdown(&self) {
        let _ = self.commands.send(WriteCommand::Shutdown);
    }

    fn abort(&mut self) {
        self.task.abort();
        self.backlog = 0;
    }

    /// Give the task [`CLOSE_FLUSH_TIMEOUT`] to finish queued writes.
    async fn finish(self) {
        let Self { side, commands, mut task, .. } = self;
        drop(commands);
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task).await.is_err() {
            debug!(side = ?side, "Writer still busy at teardown, aborting");
            task.abort();
        }
    }
}

async fn write_socket(
    side: Side,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: mpsc::UnboundedSender<WriterEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Data(bytes) => {
                let event = match writer.write_all(&bytes).await {
                    Ok(()) => WriterEvent::Written(side, bytes.len()),
                    Err(e) => WriterEvent::Failed(side, e.to_string()),
                };
                let failed = matches!(event, WriterEvent::Failed(..));
                if events.send(event).is_err() || failed {
                    return;
                }
            }
            WriteCommand::Shutdown => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

/// Upstream socket and the tasks feeding the connection's event channel.
#[derive(Default)]
struct Upstream {
    writer: Option<SocketWriter>,
    open: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Upstream {
    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(writer) = &self.writer {
            if self.open {
                writer.shutdown();
            }
        }
        self.open = false;
    }

    fn backlog(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.backlog)
    }
}

/// One browser connection: its session, the browser writer, and the upstream.
struct Connection {
    conn_id: u64,
    config: Arc<Config>,
    session: Session,
    browser: SocketWriter,
    browser_open: bool,
    upstream: Upstream,
    events_tx: mpsc::Sender<UpstreamEvent>,
    writer_tx: mpsc::UnboundedSender<WriterEvent>,
}

impl Connection {
    /// Execute queued actions until the session has nothing left to do.
    fn run_actions(&mut self) {
        loop {
            while let Some(action) = self.session.poll_action() {
                self.execute(action);
            }
            if self.browser_open && self.browser.backlog > 0 {
                break;
            }
            self.session.on_browser_drained();
            match self.session.poll_action() {
                Some(action) => self.execute(action),
                None => break,
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Browser(bytes) => {
                if self.browser_open && !self.browser.write(bytes) {
                    self.browser_open = false;
                    self.session.on_browser_eof();
                }
            }
            Action::Upstream(bytes) => {
                if !self.upstream.open {
                    return;
                }
                let queued = self.upstream.writer.as_mut().is_some_and(|w| w.write(bytes));
                if !queued {
                    self.upstream.close();
                    self.session.on_upstream_failed("upstream writer stopped");
                }
            }
            Action::Connect(domain) => {
                let config = self.config.clone();
                let events = self.events_tx.clone();
                let conn_id = self.conn_id;
                self.upstream.tasks.push(tokio::spawn(async move {
                    let event = match connect_upstream(&domain, &config, conn_id).await {
                        Ok(stream) => UpstreamEvent::Connected(stream),
                        Err(reason) => UpstreamEvent::Failed(reason),
                    };
                    let _ = events.send(event).await;
                }));
            }
            Action::CloseUpstream => {
                self.upstream.close();
                self.session.on_upstream_closed();
            }
            Action::ShutdownBrowser => {
                if self.browser_open {
                    self.browser.shutdown();
                    self.browser_open = false;
                }
            }
        }
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Connected(stream) => {
                if self.session.state().bridge != BridgeState::Created
                    || self.upstream.writer.is_some()
                {
                    debug!(conn_id = self.conn_id, "Dropping upstream connected after close");
                    return;
                }
                let (reader, writer) = stream.into_split();
                self.upstream.writer =
                    Some(SocketWriter::spawn(Side::Upstream, writer, self.writer_tx.clone()));
                self.upstream.open = true;
                self.upstream
                    .tasks
                    .push(tokio::spawn(read_upstream(reader, self.events_tx.clone())));
                self.session.on_upstream_connected();
            }
            UpstreamEvent::Data(data) => {
                debug!(conn_id = self.conn_id, bytes = data.len(), "Received from upstream");
                self.session.on_upstream_data(&data);
            }
            UpstreamEvent::Closed => {
                self.upstream.close();
                self.session.on_upstream_closed();
            }
            UpstreamEvent::Failed(reason) => {
                self.upstream.close();
                self.session.on_upstream_failed(&reason);
            }
        }
    }

    fn on_writer_event(&mut self, event: WriterEvent) {
        match event {
            WriterEvent::Written(Side::Browser, len) => self.browser.written(len),
            WriterEvent::Written(Side::Upstream, len) => {
                if let Some(writer) = self.upstream.writer.as_mut() {
                    writer.written(len);
                }
            }
            WriterEvent::Failed(Side::Browser, e) => {
                debug!(conn_id = self.conn_id, error = %e, "Browser write failed");
                self.browser_open = false;
                self.session.on_browser_eof();
            }
            WriterEvent::Failed(Side::Upstream, e) => {
                error!(conn_id = self.conn_id, error = %e, "Upstream write error");
                self.upstream.close();
                self.session.on_upstream_failed(&e);
            }
        }
    }

    /// Drop whatever is still queued for the browser and treat it as gone.
    fn abandon_browser(&mut self) {
        self.browser.abort();
        self.browser_open = false;
        self.session.on_browser_eof();
    }

    async fn finish(self) {
        let Connection { mut upstream, browser, .. } = self;
        upstream.close();
        if let Some(writer) = upstream.writer.take() {
            writer.finish().await;
        }
        browser.finish().await;
    }
}

/// Handle a single browser connection from upgrade to teardown.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    active_connections: Arc<AtomicUsize>,
) -> Result<(), ProxyError> {
    let conn_id = NEXT_PROXY_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let connection_started = Instant::now();
    info!(conn_id, peer = %peer, "Proxy connection handling started");

    // Track active connections for diagnostics (no connection limit)
    active_connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard::new(active_connections.clone());

    stream.set_nodelay(true)?;
    let (mut browser_read, browser_write) = stream.into_split();
    let (events_tx, mut events_rx) = mpsc::channel(UPSTREAM_CHANNEL_CAPACITY);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();

    let mut conn = Connection {
        conn_id,
        session: Session::new(config.clone(), conn_id),
        config: config.clone(),
        browser: SocketWriter::spawn(Side::Browser, browser_write, writer_tx.clone()),
        browser_open: true,
        upstream: Upstream::default(),
        events_tx,
        writer_tx,
    };

    let idle_timeout = config.idle_timeout();
    let mut deadline = idle_timeout.map(|d| tokio::time::Instant::now() + d);
    let mut close_deadline: Option<tokio::time::Instant> = None;
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut shutting_down = false;

    loop {
        conn.run_actions();
        if conn.session.is_finished() {
            break;
        }

        let ws = conn.session.state().ws;
        if ws == WsState::Closing && close_deadline.is_none() {
            close_deadline = Some(tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT);
        }
        let receiving = ws == WsState::Receiving;
        // Stop pulling from one side while the other is not keeping up.
        let reading = conn.browser_open
            && ws != WsState::Closed
            && conn.upstream.backlog() < MAX_WRITE_BACKLOG;
        let forwarding = !receiving || conn.browser.backlog < MAX_WRITE_BACKLOG;
        read_buf.reserve(READ_BUFFER_SIZE);

        tokio::select! {
            read = browser_read.read_buf(&mut read_buf), if reading => match read {
                Ok(0) => conn.session.on_browser_eof(),
                Ok(_) => {
                    let data = read_buf.split();
                    conn.session.on_browser_data(&data);
                    if receiving {
                        deadline = idle_timeout.map(|d| tokio::time::Instant::now() + d);
                    }
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "Browser read error");
                    conn.session.on_browser_eof();
                }
            },
            Some(event) = events_rx.recv(), if forwarding => {
                if matches!(event, UpstreamEvent::Data(_)) && receiving {
                    deadline = idle_timeout.map(|d| tokio::time::Instant::now() + d);
                }
                conn.on_upstream_event(event);
            }
            Some(event) = writer_rx.recv() => conn.on_writer_event(event),
            _ = shutdown.recv(), if !shutting_down => {
                info!(conn_id, "Connection closed by shutdown");
                shutting_down = true;
                conn.session.request_close(CLOSE_GOING_AWAY, "gateway shutting down");
            }
            _ = idle_expired(deadline) => {
                warn!(
                    conn_id,
                    timeout_secs = idle_timeout.map(|d| d.as_secs()).unwrap_or_default(),
                    "Inactivity watchdog triggered, closing connection"
                );
                deadline = None;
                conn.session.request_close(CLOSE_GOING_AWAY, "idle timeout");
            }
            _ = idle_expired(close_deadline) => {
                warn!(
                    conn_id,
                    pending_bytes = conn.browser.backlog,
                    "Browser did not drain before close, dropping connection"
                );
                close_deadline = None;
                conn.abandon_browser();
            }
        }
    }

    let close_status = conn.session.close_status();
    conn.finish().await;
    info!(
        conn_id,
        total_ms = connection_started.elapsed().as_millis() as u64,
        close_status = ?close_status,
        "Proxy connection handling finished"
    );
    Ok(())
}

async fn idle_expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolve `domain` and connect to the first reachable endpoint.
async fn connect_upstream(domain: &str, config: &Config, conn_id: u64) -> Result<TcpStream, String> {
    let connect_started = Instant::now();
    let endpoints = dns::resolve_upstream(domain, config).await;
    let mut last_error = format!("no endpoint for {domain}");

    for endpoint in &endpoints {
        let address = endpoint.address();
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(address.as_str())).await {
            Ok(Ok(stream)) => {
                info!(
                    conn_id,
                    host = %endpoint.host,
                    port = endpoint.port,
                    connect_ms = connect_started.elapsed().as_millis() as u64,
                    "Upstream connected"
                );
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                warn!(
                    conn_id,
                    host = %endpoint.host,
                    port = endpoint.port,
                    error = %e,
                    error_kind = ?e.kind(),
                    "TCP connect failed"
                );
                last_error = format!("Failed to connect to XMPP server {address}: {e}");
            }
            Err(_) => {
                warn!(
                    conn_id,
                    host = %endpoint.host,
                    port = endpoint.port,
                    timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
                    "TCP connect timed out"
                );
                last_error = format!(
                    "TCP connect timed out after {}s to {address}",
                    TCP_CONNECT_TIMEOUT.as_secs()
                );
            }
        }
    }
    Err(last_error)
}

/// Forward upstream reads to the connection task until EOF or error.
async fn read_upstream(mut reader: OwnedReadHalf, events: mpsc::Sender<UpstreamEvent>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => UpstreamEvent::Closed,
            Ok(_) => UpstreamEvent::Data(buf.split().freeze()),
            Err(e) => UpstreamEvent::Failed(e.to_string()),
        };
        let last = !matches!(event, UpstreamEvent::Data(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}
