//! Yap - local dual-socket RPC substrate.
//!
//! A long-lived server process hosts a heavyweight engine; lightweight client
//! processes drive it over Unix domain sockets, and the server pushes
//! asynchronous notifications back.
//!
//! # Architecture
//!
//! Each client holds two sockets to the server:
//!
//! - **Command channel** - client → server, dialed by the client. Carries
//!   async commands and sync commands with exactly one reply each.
//! - **Message channel** - server → client, dialed by the server back to the
//!   client's reverse socket during the handshake. Carries async messages.
//!
//! # Modules
//!
//! - [`packet`] - Typed value codec for frame bodies
//! - [`framing`] - Frame headers, blocking and async frame I/O, handshake bytes
//! - [`paths`] - Socket path naming and filesystem preparation
//! - [`config`] - Configuration loading
//! - [`proxy`] - Server-side handle for one client, including record proxies
//! - [`server`] - Accept loop and dispatch loop
//! - [`client`] - Blocking client
//! - [`watchdog`] - Event-loop stall detector

pub mod client;
pub mod config;
pub mod framing;
pub mod packet;
pub mod paths;
pub mod proxy;
pub mod server;
pub mod watchdog;

// Re-export commonly used types
pub use client::{Client, ClientError, ClientHandler};
pub use config::IpcConfig;
pub use framing::{DisconnectReason, FrameError, MAX_FRAME_SIZE};
pub use packet::{Packet, PacketError, PacketReader, Value, ValueType};
pub use proxy::{AdoptError, Proxy, ProxyError, ProxyState};
pub use server::{Server, ServerHandler};
pub use watchdog::{Watchdog, WatchdogHandle};
