//! Unix domain socket server hosting the engine side of the protocol.
//!
//! [`Server::bind`] listens on `<prefix>.<name>`. Each accepted connection runs
//! its handshake in its own task: read the client's reverse path and postfix,
//! dial the reverse path, then hand both streams to the dispatch loop.
//!
//! [`Server::run`] is the dispatch loop. It owns every [`Proxy`] and calls the
//! [`ServerHandler`] hooks one at a time; per-connection read and write tasks
//! only move frames. When a deadlock timeout is configured the loop feeds a
//! [`Watchdog`] every half timeout and after every event.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IpcConfig;
use crate::framing::{self, DisconnectReason, FrameError, FrameHeader};
use crate::packet::{Packet, PacketReader};
use crate::paths;
use crate::proxy::{self, Proxy, ProxyId};
use crate::watchdog::{Watchdog, WatchdogHandle};

/// Hooks invoked by the dispatch loop.
///
/// Every call happens on the task running [`Server::run`], one at a time.
pub trait ServerHandler {
    /// A client finished its handshake.
    fn client_connected(&mut self, proxy: &mut Proxy) {
        let _ = proxy;
    }

    /// A client went away. Called exactly once per connected proxy.
    fn client_disconnected(&mut self, proxy: &mut Proxy) {
        let _ = proxy;
    }

    /// Fire-and-forget command; nothing is sent back.
    fn handle_async_command(&mut self, proxy: &mut Proxy, request: &mut PacketReader);

    /// Command awaiting a reply. Whatever is written to `reply` is sent back
    /// on the command channel once this returns.
    fn handle_sync_command(
        &mut self,
        proxy: &mut Proxy,
        request: &mut PacketReader,
        reply: &mut Packet,
    );
}

/// Events flowing from connection tasks to the dispatch loop.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// Handshake and reverse dial succeeded.
    Paired {
        command: UnixStream,
        message: UnixStream,
        postfix: String,
        reverse_path: String,
    },
    /// A frame arrived on a command channel.
    Command {
        id: ProxyId,
        header: FrameHeader,
        body: Vec<u8>,
    },
    /// A connection task hit hang-up or an error.
    Closed { id: ProxyId, reason: DisconnectReason },
}

/// A connected proxy plus the tasks serving its sockets.
struct Connection {
    proxy: Proxy,
    command_tx: UnboundedSender<Vec<u8>>,
    read_handle: JoinHandle<()>,
}

impl Connection {
    /// Stop reading; queued writes still drain before the writers exit.
    fn close(self) -> Proxy {
        self.read_handle.abort();
        drop(self.command_tx);
        self.proxy
    }
}

/// Handshake limits copied into each accept task.
#[derive(Debug, Clone, Copy)]
struct HandshakeLimits {
    timeout: Duration,
    connect_retries: u32,
}

/// Unix domain socket server.
pub struct Server {
    name: String,
    socket_path: PathBuf,
    pending_queue_limit: usize,
    event_tx: UnboundedSender<ServerEvent>,
    event_rx: UnboundedReceiver<ServerEvent>,
    accept_handle: JoinHandle<()>,
    connections: HashMap<ProxyId, Connection>,
    watchdog: Option<Watchdog>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("socket_path", &self.socket_path)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind `<prefix>.<name>` and start accepting connections.
    ///
    /// Removes a stale socket file, creates the parent directory and applies
    /// the configured permissions. Must be called inside a tokio runtime.
    pub fn bind(name: &str, config: &IpcConfig) -> Result<Self> {
        let socket_path = paths::server_socket_path(&config.socket_prefix, name);
        paths::prepare_socket_path(&socket_path)?;

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
        paths::apply_socket_mode(&socket_path, config.socket_mode)?;

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)
            .context("Failed to register listener with the tokio runtime")?;

        log::info!("[Server] Listening on {}", socket_path.display());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let limits = HandshakeLimits {
            timeout: config.handshake_timeout(),
            connect_retries: config.connect_retries.max(1),
        };
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            event_tx.clone(),
            limits,
            shutdown.clone(),
        ));

        let watchdog = config
            .deadlock_timeout()
            .map(|timeout| Watchdog::new(timeout, config.min_deadlock_timeout()));

        Ok(Self {
            name: name.to_string(),
            socket_path,
            pending_queue_limit: config.pending_queue_limit,
            event_tx,
            event_rx,
            accept_handle,
            connections: HashMap::new(),
            watchdog,
            shutdown,
        })
    }

    /// Replace the configured watchdog (or install one when disabled).
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handle for pausing or feeding the watchdog from handlers.
    pub fn watchdog(&self) -> Option<WatchdogHandle> {
        self.watchdog.as_ref().map(Watchdog::handle)
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record proxy using the configured queue limit.
    pub fn create_record_proxy(&self) -> Proxy {
        Proxy::record(self.pending_queue_limit)
    }

    /// Dispatch events until the shutdown token is cancelled.
    ///
    /// On return every remaining connection has been torn down with
    /// [`DisconnectReason::Shutdown`] and the watchdog has been joined.
    pub async fn run<H: ServerHandler>(&mut self, handler: &mut H) -> Result<()> {
        let beat = self.watchdog.as_mut().map(|watchdog| {
            watchdog.start();
            let handle = watchdog.handle();
            let period = (handle.interval() / 2).max(Duration::from_millis(1));
            (handle, period)
        });
        let heartbeat = beat.as_ref().map(|(handle, _)| handle.clone());
        let mut ticker = tokio::time::interval(beat.map_or(Duration::from_secs(3600), |(_, p)| p));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                event = self.event_rx.recv() => event,
                _ = ticker.tick(), if heartbeat.is_some() => None,
            };

            if let Some(event) = event {
                self.handle_event(event, handler);
            }
            if let Some(handle) = &heartbeat {
                handle.increment();
            }
        }

        let ids: Vec<ProxyId> = self.connections.keys().copied().collect();
        for id in ids {
            self.teardown(id, DisconnectReason::Shutdown, handler);
        }

        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.stop();
        }
        log::info!("[Server] {} stopped", self.name);
        Ok(())
    }

    fn handle_event<H: ServerHandler>(&mut self, event: ServerEvent, handler: &mut H) {
        match event {
            ServerEvent::Paired { command, message, postfix, reverse_path } => {
                let id = self.register(command, message, postfix);
                let count = self.connections.len();
                if let Some(conn) = self.connections.get_mut(&id) {
                    log::info!(
                        "[Server] Client connected: {} via {reverse_path} ({count} active)",
                        conn.proxy.postfix().unwrap_or_default()
                    );
                    handler.client_connected(&mut conn.proxy);
                }
                self.teardown_if_requested(id, handler);
            }
            ServerEvent::Command { id, header, body } => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    log::debug!("[Server] Discarding frame for closed proxy {id}");
                    return;
                };

                let mut request = PacketReader::new(body);
                if header.is_sync() {
                    let mut reply = Packet::new();
                    handler.handle_sync_command(&mut conn.proxy, &mut request, &mut reply);
                    let sent = framing::encode_frame(0, header.correlation, reply.as_bytes())
                        .map_err(|e| e.to_string())
                        .and_then(|frame| {
                            let gone = |_| "command writer gone".to_string();
                            conn.command_tx.send(frame).map_err(gone)
                        });
                    if let Err(e) = sent {
                        log::error!("[Server] Failed to send reply to proxy {id}: {e}");
                        self.teardown(id, DisconnectReason::Io(e), handler);
                        return;
                    }
                } else {
                    handler.handle_async_command(&mut conn.proxy, &mut request);
                }
                self.teardown_if_requested(id, handler);
            }
            ServerEvent::Closed { id, reason } => self.teardown(id, reason, handler),
        }
    }

    /// Spawn the connection's tasks and store its proxy.
    fn register(&mut self, command: UnixStream, message: UnixStream, postfix: String) -> ProxyId {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let proxy = Proxy::connected(postfix, message_tx);
        let id = proxy.id();

        let (read_half, write_half) = command.into_split();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(proxy::read_loop(id, read_half, self.event_tx.clone()));
        tokio::spawn(proxy::write_loop(id, write_half, command_rx, self.event_tx.clone()));
        tokio::spawn(proxy::write_loop(id, message, message_rx, self.event_tx.clone()));

        self.connections.insert(id, Connection { proxy, command_tx, read_handle });
        id
    }

    fn teardown_if_requested<H: ServerHandler>(&mut self, id: ProxyId, handler: &mut H) {
        let requested = self
            .connections
            .get(&id)
            .is_some_and(|conn| conn.proxy.is_terminate_requested());
        if requested {
            self.teardown(id, DisconnectReason::Terminated, handler);
        }
    }

    /// Remove a connection and notify the handler. Unknown ids are ignored,
    /// so each proxy is reported at most once.
    fn teardown<H: ServerHandler>(
        &mut self,
        id: ProxyId,
        reason: DisconnectReason,
        handler: &mut H,
    ) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        let mut proxy = conn.close();
        log::info!(
            "[Server] Client disconnected: {} ({reason}, {} active)",
            proxy.postfix().unwrap_or_default(),
            self.connections.len()
        );
        proxy.mark_terminated(reason);
        handler.client_disconnected(&mut proxy);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.accept_handle.abort();
        for (_, conn) in self.connections.drain() {
            let _ = conn.close();
        }
        paths::remove_socket_file(&self.socket_path);
    }
}

/// Accept loop - runs as a tokio task.
async fn accept_loop(
    listener: UnixListener,
    event_tx: UnboundedSender<ServerEvent>,
    limits: HandshakeLimits,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    let paired = handshake(stream, limits.connect_retries);
                    match tokio::time::timeout(limits.timeout, paired).await {
                        Ok(Ok(event)) => {
                            let _ = event_tx.send(event);
                        }
                        Ok(Err(e)) => log::warn!("[Server] Handshake failed: {e}"),
                        Err(_) => log::warn!(
                            "[Server] Handshake timed out after {}ms",
                            limits.timeout.as_millis()
                        ),
                    }
                });
            }
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the handshake and dial the client's reverse socket.
async fn handshake(
    mut command: UnixStream,
    connect_retries: u32,
) -> Result<ServerEvent, FrameError> {
    let (reverse_path, postfix) = framing::read_handshake_async(&mut command).await?;
    let message = dial_reverse(&reverse_path, connect_retries).await?;
    log::debug!("[Server] Reverse channel open to {reverse_path}");
    Ok(ServerEvent::Paired { command, message, postfix, reverse_path })
}

async fn dial_reverse(path: &str, attempts: u32) -> Result<UnixStream, FrameError> {
    let mut attempt = 1;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e)
                if attempt < attempts
                    && matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) =>
            {
                log::debug!("[Server] Reverse dial to {path} attempt {attempt} failed: {e}");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                let detail = format!("cannot dial reverse socket {path}: {e}");
                return Err(FrameError::Handshake(detail));
            }
        }
    }
}
