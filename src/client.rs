//! Client side of the dual-socket protocol.
//!
//! # Lifecycle
//!
//! ```text
//! Client::connect(name) ──bind──────► <prefix>.<name><postfix>  (reverse listener)
//!                        ──connect───► <prefix>.<name>           (command socket)
//!                        ──handshake─► [path][postfix]
//!                        ◄──accept──── server dials the reverse listener
//!                        unlink reverse socket file, start reader thread
//!
//! send_sync_command  ──frame(SYNC)──► block until the reply frame
//! send_async_command ──frame───────►  no reply
//! run / poll / dispatch_pending ────► ClientHandler::handle_message per message
//! ```
//!
//! The command socket is driven from the caller's thread in blocking mode.
//! Messages on the reverse channel are read by a background thread and queued
//! until the caller dispatches them, so messages that arrive during a sync call
//! are delivered after it returns.
//!
//! There is no `server_connected` callback: a successful [`Client::connect`]
//! is that event. Only the message channel is watched while idle. A hang-up on
//! the command socket alone surfaces on the next send; the server always closes
//! both sockets together, so the reader thread reports it first in practice.

// Rust guideline compliant 2026-02

use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::IpcConfig;
use crate::framing::{self, flags, DisconnectReason, FrameError};
use crate::packet::{Packet, PacketReader};
use crate::paths::{self, PathError};

/// Errors returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The reverse listener could not be set up.
    #[error("failed to bind reverse socket: {0}")]
    Bind(#[from] PathError),

    /// The server socket refused the connection.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        /// Server socket path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The handshake could not be sent.
    #[error("handshake failed: {0}")]
    Handshake(FrameError),

    /// The server never dialed the reverse socket.
    #[error("server did not open the message channel within {0:?}")]
    AcceptTimeout(Duration),

    /// The connection is gone.
    #[error("disconnected: {0}")]
    Disconnected(DisconnectReason),

    /// Commands must carry at least one value.
    #[error("refusing to send an empty command")]
    EmptyPacket,

    /// Framing failed on the command channel.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Callbacks for events coming from the server.
pub trait ClientHandler {
    /// One message from the server. `client` may be used to send commands.
    fn handle_message(&mut self, client: &mut Client, message: &mut PacketReader);

    /// The connection ended. Called exactly once.
    fn server_disconnected(&mut self, reason: &DisconnectReason) {
        let _ = reason;
    }
}

#[derive(Debug)]
enum ClientEvent {
    Message(Vec<u8>),
    Closed(DisconnectReason),
}

/// Blocking client connection.
pub struct Client {
    name: String,
    postfix: String,
    reverse_path: PathBuf,
    command: UnixStream,
    message: UnixStream,
    events_rx: std_mpsc::Receiver<ClientEvent>,
    reader_handle: Option<JoinHandle<()>>,
    correlation: u8,
    disconnect_reason: Option<DisconnectReason>,
    disconnect_notified: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("postfix", &self.postfix)
            .field("disconnect_reason", &self.disconnect_reason)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the server called `name`.
    ///
    /// Blocks until the server has dialed back the reverse channel or
    /// `accept_timeout_ms` elapses.
    pub fn connect(name: &str, config: &IpcConfig) -> Result<Self, ClientError> {
        let postfix = paths::next_postfix();
        let reverse_path = paths::reverse_socket_path(&config.socket_prefix, name, &postfix);
        let server_path = paths::server_socket_path(&config.socket_prefix, name);

        paths::prepare_socket_path(&reverse_path)?;
        let listener = UnixListener::bind(&reverse_path).map_err(|source| {
            ClientError::Bind(PathError::Io {
                action: "Failed to bind",
                path: reverse_path.display().to_string(),
                source,
            })
        })?;

        let established = Self::establish(&listener, &reverse_path, &server_path, &postfix, config);
        // The server has dialed (or never will); the file is no longer needed.
        paths::remove_socket_file(&reverse_path);
        let (command, message) = established?;

        let reader_stream = message.try_clone()?;
        let (events_tx, events_rx) = std_mpsc::channel();
        let reader_handle = thread::Builder::new()
            .name(format!("yap-client-{postfix}"))
            .spawn(move || message_reader(reader_stream, &events_tx))?;

        log::info!("[Client] Connected to {} as {postfix}", server_path.display());

        Ok(Self {
            name: name.to_string(),
            postfix,
            reverse_path,
            command,
            message,
            events_rx,
            reader_handle: Some(reader_handle),
            correlation: 0,
            disconnect_reason: None,
            disconnect_notified: false,
        })
    }

    fn establish(
        listener: &UnixListener,
        reverse_path: &Path,
        server_path: &Path,
        postfix: &str,
        config: &IpcConfig,
    ) -> Result<(UnixStream, UnixStream), ClientError> {
        paths::apply_socket_mode(reverse_path, config.socket_mode)?;

        let mut command = UnixStream::connect(server_path).map_err(|source| ClientError::Connect {
            path: server_path.display().to_string(),
            source,
        })?;

        let reverse = reverse_path.to_str().ok_or_else(|| {
            ClientError::Handshake(FrameError::Handshake("reverse path is not UTF-8".to_string()))
        })?;
        let handshake =
            framing::encode_handshake(reverse, postfix).map_err(ClientError::Handshake)?;
        framing::write_all_retrying(&mut command, &handshake).map_err(ClientError::Handshake)?;

        let message = accept_within(listener, config.accept_timeout())?;
        Ok((command, message))
    }

    /// Server name this client is connected to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-unique postfix identifying this client.
    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    /// Path of the reverse socket (already unlinked once connected).
    pub fn reverse_path(&self) -> &Path {
        &self.reverse_path
    }

    /// Whether no failure has been observed yet.
    pub fn is_connected(&self) -> bool {
        self.disconnect_reason.is_none()
    }

    /// Send a fire-and-forget command.
    pub fn send_async_command(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.ensure_sendable(packet)?;
        framing::write_frame(&mut self.command, 0, 0, packet.as_bytes())
            .map_err(|e| self.fail(&e))
    }

    /// Send a command and block until its reply arrives.
    ///
    /// Messages that arrive meanwhile stay queued until the next dispatch.
    pub fn send_sync_command(&mut self, packet: &Packet) -> Result<PacketReader, ClientError> {
        self.ensure_sendable(packet)?;
        self.correlation = self.correlation.wrapping_add(1);
        let correlation = self.correlation;

        framing::write_frame(&mut self.command, flags::SYNC, correlation, packet.as_bytes())
            .map_err(|e| self.fail(&e))?;

        let frame = framing::read_frame(&mut self.command).map_err(|e| self.fail(&e))?;
        if frame.header.is_sync() || frame.header.correlation != correlation {
            let reason = DisconnectReason::Protocol(format!(
                "unexpected reply header (flags 0x{:02x}, correlation {} != {correlation})",
                frame.header.flags, frame.header.correlation
            ));
            log::error!("[Client] {reason}");
            self.record_disconnect(reason.clone());
            return Err(ClientError::Disconnected(reason));
        }
        Ok(PacketReader::new(frame.body))
    }

    /// Deliver queued messages without blocking. Returns how many were delivered.
    pub fn dispatch_pending<H: ClientHandler>(&mut self, handler: &mut H) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            delivered += self.deliver(event, handler);
        }
        self.notify_disconnect(handler);
        delivered
    }

    /// Wait up to `timeout` for a message, then deliver everything queued.
    pub fn poll<H: ClientHandler>(&mut self, handler: &mut H, timeout: Duration) -> usize {
        let mut delivered = 0;
        if !self.disconnect_notified && self.disconnect_reason.is_none() {
            match self.events_rx.recv_timeout(timeout) {
                Ok(event) => delivered += self.deliver(event, handler),
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    self.record_disconnect(DisconnectReason::HungUp);
                }
            }
        }
        delivered + self.dispatch_pending(handler)
    }

    /// Deliver messages until the connection ends, returning why it ended.
    pub fn run<H: ClientHandler>(&mut self, handler: &mut H) -> DisconnectReason {
        loop {
            if self.disconnect_reason.is_none() {
                match self.events_rx.recv() {
                    Ok(event) => {
                        self.deliver(event, handler);
                    }
                    Err(_) => self.record_disconnect(DisconnectReason::HungUp),
                }
            }
            self.dispatch_pending(handler);
            if let Some(reason) = &self.disconnect_reason {
                return reason.clone();
            }
        }
    }

    /// Close both sockets. The handler hears about it on the next dispatch.
    pub fn disconnect(&mut self) {
        if self.disconnect_reason.is_none() {
            log::info!("[Client] Disconnecting {}", self.postfix);
        }
        self.shutdown_sockets();
        self.record_disconnect(DisconnectReason::Terminated);
    }

    fn deliver<H: ClientHandler>(&mut self, event: ClientEvent, handler: &mut H) -> usize {
        match event {
            ClientEvent::Message(body) => {
                if self.disconnect_notified {
                    return 0;
                }
                let mut message = PacketReader::new(body);
                handler.handle_message(self, &mut message);
                1
            }
            ClientEvent::Closed(reason) => {
                self.record_disconnect(reason);
                0
            }
        }
    }

    fn notify_disconnect<H: ClientHandler>(&mut self, handler: &mut H) {
        if self.disconnect_notified {
            return;
        }
        if let Some(reason) = self.disconnect_reason.clone() {
            self.disconnect_notified = true;
            log::info!("[Client] Server disconnected: {reason}");
            handler.server_disconnected(&reason);
        }
    }

    fn ensure_sendable(&self, packet: &Packet) -> Result<(), ClientError> {
        if let Some(reason) = &self.disconnect_reason {
            return Err(ClientError::Disconnected(reason.clone()));
        }
        if packet.is_empty() {
            return Err(ClientError::EmptyPacket);
        }
        Ok(())
    }

    /// Record a command-channel failure and convert it for the caller.
    fn fail(&mut self, err: &FrameError) -> ClientError {
        let reason = DisconnectReason::from(err);
        match err {
            FrameError::HungUp => log::info!("[Client] Server hung up"),
            other => log::error!("[Client] Command channel error: {other}"),
        }
        self.record_disconnect(reason.clone());
        ClientError::Disconnected(reason)
    }

    /// Keep the first reason only.
    fn record_disconnect(&mut self, reason: DisconnectReason) {
        if self.disconnect_reason.is_none() {
            self.disconnect_reason = Some(reason);
        }
    }

    fn shutdown_sockets(&self) {
        let _ = self.command.shutdown(Shutdown::Both);
        let _ = self.message.shutdown(Shutdown::Both);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_sockets();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        paths::remove_socket_file(&self.reverse_path);
    }
}

/// Accept one connection, giving up after `timeout`.
fn accept_within(listener: &UnixListener, timeout: Duration) -> Result<UnixStream, ClientError> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                if Instant::now() >= deadline {
                    return Err(ClientError::AcceptTimeout(timeout));
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(ClientError::Io(e)),
        }
    }
}

/// Reader thread: turns message frames into events until the channel ends.
fn message_reader(mut stream: UnixStream, events_tx: &std_mpsc::Sender<ClientEvent>) {
    loop {
        match framing::read_frame(&mut stream) {
            Ok(frame) => {
                if frame.header.is_sync() {
                    log::warn!("[Client] Ignoring sync flag on message channel");
                }
                if events_tx.send(ClientEvent::Message(frame.body)).is_err() {
                    break;
                }
            }
            Err(e) => {
                match &e {
                    FrameError::HungUp => log::debug!("[Client] Message channel closed"),
                    other => log::error!("[Client] Message channel error: {other}"),
                }
                let _ = events_tx.send(ClientEvent::Closed(DisconnectReason::from(&e)));
                break;
            }
        }
    }
    log::debug!("[Client] Reader thread exiting");
}
