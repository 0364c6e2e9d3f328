//! End-to-end tests: a real `Server` on a tokio runtime talking to real
//! blocking `Client`s over Unix sockets in a temp directory.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use yap::framing::{self, flags};
use yap::{
    Client, ClientError, ClientHandler, DisconnectReason, IpcConfig, Packet, PacketReader, Proxy,
    Server, ServerHandler,
};

const ADD: i16 = 1;
const ECHO: i16 = 2;
const EMPTY_REPLY: i16 = 3;
const NOTIFY: i16 = 10;
const QUIT: i16 = 11;
const TICK: i16 = 100;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected(String),
    Async(i16),
    Disconnected(String, DisconnectReason),
}

/// Test engine: arithmetic, echo, notifications and termination.
struct Engine {
    seen: UnboundedSender<Seen>,
    record: Option<Proxy>,
}

impl ServerHandler for Engine {
    fn client_connected(&mut self, proxy: &mut Proxy) {
        if let Some(record) = self.record.take() {
            proxy.adopt(record).unwrap();
        }
        let _ = self.seen.send(Seen::Connected(proxy.postfix().unwrap().to_string()));
    }

    fn client_disconnected(&mut self, proxy: &mut Proxy) {
        let reason = proxy.disconnect_reason().cloned().unwrap();
        let _ = self.seen.send(Seen::Disconnected(proxy.postfix().unwrap().to_string(), reason));
    }

    fn handle_async_command(&mut self, proxy: &mut Proxy, request: &mut PacketReader) {
        let selector = request.read_selector().unwrap();
        let _ = self.seen.send(Seen::Async(selector));
        match selector {
            NOTIFY => {
                let count = request.read_i32().unwrap();
                for i in 0..count {
                    let mut message = Packet::with_selector(TICK);
                    message.write_i32(1000 + i).unwrap();
                    proxy.send_message(&message).unwrap();
                }
            }
            QUIT => proxy.set_terminate(),
            other => panic!("unexpected async selector {other}"),
        }
    }

    fn handle_sync_command(
        &mut self,
        _proxy: &mut Proxy,
        request: &mut PacketReader,
        reply: &mut Packet,
    ) {
        match request.read_selector().unwrap() {
            ADD => {
                let a = request.read_i32().unwrap();
                let b = request.read_i32().unwrap();
                reply.write_i32(a + b).unwrap();
            }
            ECHO => {
                let text = request.read_string().unwrap();
                reply.write_str(&text).unwrap();
            }
            EMPTY_REPLY => {}
            other => panic!("unexpected sync selector {other}"),
        }
    }
}

/// Client-side handler collecting `(selector, value)` messages.
#[derive(Default)]
struct Collector {
    messages: Vec<(i16, i32)>,
    disconnects: Vec<DisconnectReason>,
}

impl ClientHandler for Collector {
    fn handle_message(&mut self, _client: &mut Client, message: &mut PacketReader) {
        let selector = message.read_selector().unwrap();
        let value = message.read_i32().unwrap();
        assert!(message.is_exhausted());
        self.messages.push((selector, value));
    }

    fn server_disconnected(&mut self, reason: &DisconnectReason) {
        self.disconnects.push(reason.clone());
    }
}

struct Harness {
    _tmp: TempDir,
    config: IpcConfig,
    name: String,
    token: CancellationToken,
    seen: UnboundedReceiver<Seen>,
    run: JoinHandle<()>,
}

impl Harness {
    /// Bind a server and spawn its dispatch loop. `prefill` receives the
    /// record proxy before any client exists.
    fn start(prefill: impl FnOnce(&mut Proxy)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let tmp = TempDir::new().unwrap();
        let config = IpcConfig {
            socket_prefix: tmp.path().join("yap").display().to_string(),
            deadlock_timeout_ms: 0,
            handshake_timeout_ms: 1_000,
            accept_timeout_ms: 2_000,
            ..IpcConfig::default()
        };
        let name = "engine".to_string();

        let mut server = Server::bind(&name, &config).unwrap();
        let mut record = server.create_record_proxy();
        prefill(&mut record);

        let (seen_tx, seen) = mpsc::unbounded_channel();
        let mut engine = Engine { seen: seen_tx, record: Some(record) };
        let token = server.shutdown_token();
        let run = tokio::spawn(async move {
            server.run(&mut engine).await.unwrap();
        });

        Self { _tmp: tmp, config, name, token, seen, run }
    }

    async fn connect(&self) -> Client {
        let name = self.name.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Client::connect(&name, &config).unwrap())
            .await
            .unwrap()
    }

    async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.seen.recv())
            .await
            .expect("Timed out waiting for server event")
            .expect("Server event channel closed")
    }

    async fn expect_nothing_more(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(200), self.seen.recv()).await;
        assert!(extra.is_err(), "unexpected server event: {extra:?}");
    }

    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(WAIT, self.run).await.unwrap().unwrap();
    }
}

fn packet(selector: i16, args: &[i32]) -> Packet {
    let mut packet = Packet::with_selector(selector);
    for arg in args {
        packet.write_i32(*arg).unwrap();
    }
    packet
}

/// Poll until `handler` holds `count` messages or the wait expires.
fn collect_messages(client: &mut Client, handler: &mut Collector, count: usize) {
    let deadline = Instant::now() + WAIT;
    while handler.messages.len() < count && Instant::now() < deadline {
        client.poll(handler, Duration::from_millis(50));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_round_trip() {
    let mut harness = Harness::start(|_| {});
    let mut client = harness.connect().await;
    let postfix = client.postfix().to_string();
    assert_eq!(harness.next_seen().await, Seen::Connected(postfix.clone()));
    // The reverse socket file is gone once connected.
    assert!(!client.reverse_path().exists());

    let client = tokio::task::spawn_blocking(move || {
        let mut reply = client.send_sync_command(&packet(ADD, &[2, 40])).unwrap();
        assert_eq!(reply.read_i32().unwrap(), 42);
        assert!(reply.is_exhausted());

        let mut echo = Packet::with_selector(ECHO);
        echo.write_str("héllo, engine").unwrap();
        let mut reply = client.send_sync_command(&echo).unwrap();
        assert_eq!(reply.read_string().unwrap(), "héllo, engine");

        // Empty replies are valid.
        let reply = client.send_sync_command(&packet(EMPTY_REPLY, &[])).unwrap();
        assert!(reply.is_empty());

        // Many calls keep request and reply paired.
        for i in 0..300 {
            let mut reply = client.send_sync_command(&packet(ADD, &[i, 1])).unwrap();
            assert_eq!(reply.read_i32().unwrap(), i + 1);
        }
        client
    })
    .await
    .unwrap();

    drop(client);
    assert_eq!(
        harness.next_seen().await,
        Seen::Disconnected(postfix, DisconnectReason::HungUp)
    );
    harness.expect_nothing_more().await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_command_and_messages_in_order() {
    let mut harness = Harness::start(|_| {});
    let client = harness.connect().await;
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    let (client, handler) = tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut handler = Collector::default();
        client.send_async_command(&packet(NOTIFY, &[20])).unwrap();
        collect_messages(&mut client, &mut handler, 20);
        (client, handler)
    })
    .await
    .unwrap();

    assert_eq!(harness.next_seen().await, Seen::Async(NOTIFY));
    let expected: Vec<(i16, i32)> = (0..20).map(|i| (TICK, 1000 + i)).collect();
    assert_eq!(handler.messages, expected);
    assert!(handler.disconnects.is_empty());

    drop(client);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_during_sync_call_are_delivered_afterwards() {
    let mut harness = Harness::start(|_| {});
    let client = harness.connect().await;
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    let handler = tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut handler = Collector::default();
        client.send_async_command(&packet(NOTIFY, &[3])).unwrap();
        // The sync reply is only written after NOTIFY has queued its messages.
        let mut reply = client.send_sync_command(&packet(ADD, &[1, 1])).unwrap();
        assert_eq!(reply.read_i32().unwrap(), 2);
        assert!(handler.messages.is_empty());

        collect_messages(&mut client, &mut handler, 3);
        handler
    })
    .await
    .unwrap();

    assert_eq!(handler.messages, vec![(TICK, 1000), (TICK, 1001), (TICK, 1002)]);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_record_proxy_messages_flushed_before_live_ones() {
    let mut harness = Harness::start(|record| {
        for i in 0..5 {
            record.send_message(&packet(TICK, &[i])).unwrap();
        }
        assert_eq!(record.pending_len(), 5);
    });
    let client = harness.connect().await;
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    let handler = tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut handler = Collector::default();
        client.send_async_command(&packet(NOTIFY, &[2])).unwrap();
        collect_messages(&mut client, &mut handler, 7);
        handler
    })
    .await
    .unwrap();

    let values: Vec<i32> = handler.messages.iter().map(|(_, v)| *v).collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 1000, 1001]);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_terminate_disconnects_both_sides_once() {
    let mut harness = Harness::start(|_| {});
    let client = harness.connect().await;
    let postfix = client.postfix().to_string();
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    let (reason, handler) = tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut handler = Collector::default();
        client.send_async_command(&packet(QUIT, &[])).unwrap();
        let reason = client.run(&mut handler);
        // Further dispatch never re-fires the hook.
        client.dispatch_pending(&mut handler);
        client.poll(&mut handler, Duration::from_millis(20));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_async_command(&packet(NOTIFY, &[1])),
            Err(ClientError::Disconnected(_))
        ));
        (reason, handler)
    })
    .await
    .unwrap();

    assert_eq!(reason, DisconnectReason::HungUp);
    assert_eq!(handler.disconnects, vec![DisconnectReason::HungUp]);

    assert_eq!(harness.next_seen().await, Seen::Async(QUIT));
    assert_eq!(
        harness.next_seen().await,
        Seen::Disconnected(postfix, DisconnectReason::Terminated)
    );
    harness.expect_nothing_more().await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_after_terminate_are_discarded() {
    let mut harness = Harness::start(|_| {});
    let client = harness.connect().await;
    let postfix = client.postfix().to_string();
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    let handler = tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut handler = Collector::default();
        client.send_async_command(&packet(QUIT, &[])).unwrap();
        // Queued behind QUIT on the same socket; the server may already be gone.
        for _ in 0..50 {
            if client.send_async_command(&packet(NOTIFY, &[1])).is_err() {
                break;
            }
        }
        client.run(&mut handler);
        handler
    })
    .await
    .unwrap();

    assert!(handler.messages.is_empty(), "{:?}", handler.messages);
    assert_eq!(handler.disconnects.len(), 1);
    assert_eq!(harness.next_seen().await, Seen::Async(QUIT));
    assert_eq!(
        harness.next_seen().await,
        Seen::Disconnected(postfix, DisconnectReason::Terminated)
    );
    harness.expect_nothing_more().await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_tears_down_every_client() {
    let mut harness = Harness::start(|_| {});
    let first = harness.connect().await;
    let second = harness.connect().await;
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));

    harness.token.cancel();
    let mut reasons = Vec::new();
    for _ in 0..2 {
        match harness.next_seen().await {
            Seen::Disconnected(_, reason) => reasons.push(reason),
            other => panic!("Expected Disconnected, got: {other:?}"),
        }
    }
    assert_eq!(reasons, vec![DisconnectReason::Shutdown, DisconnectReason::Shutdown]);

    for client in [first, second] {
        let handler = tokio::task::spawn_blocking(move || {
            let mut client = client;
            let mut handler = Collector::default();
            client.run(&mut handler);
            handler
        })
        .await
        .unwrap();
        assert_eq!(handler.disconnects, vec![DisconnectReason::HungUp]);
    }

    tokio::time::timeout(WAIT, harness.run).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_garbage_handshake_does_not_affect_other_clients() {
    let mut harness = Harness::start(|_| {});
    let server_path = yap::paths::server_socket_path(&harness.config.socket_prefix, &harness.name);

    // Declares a path far larger than the handshake field limit.
    let mut garbage = tokio::net::UnixStream::connect(&server_path).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut garbage, &[0xff, 0xff, b'x', b'y']).await.unwrap();
    assert!(framing::read_frame_async(&mut garbage).await.is_err());

    let client = harness.connect().await;
    assert!(matches!(harness.next_seen().await, Seen::Connected(_)));
    tokio::task::spawn_blocking(move || {
        let mut client = client;
        let mut reply = client.send_sync_command(&packet(ADD, &[5, 5])).unwrap();
        assert_eq!(reply.read_i32().unwrap(), 10);
    })
    .await
    .unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_tears_down_connection() {
    let mut harness = Harness::start(|_| {});
    let config = harness.config.clone();
    let name = harness.name.clone();

    // Hand-rolled client so the command channel can send a bad header.
    let reverse = tokio::task::spawn_blocking(move || {
        let reverse_path = yap::paths::reverse_socket_path(&config.socket_prefix, &name, "raw-1");
        let listener = UnixListener::bind(&reverse_path).unwrap();
        let server_path = yap::paths::server_socket_path(&config.socket_prefix, &name);
        let mut command = UnixStream::connect(server_path).unwrap();
        let handshake =
            framing::encode_handshake(reverse_path.to_str().unwrap(), "raw-1").unwrap();
        command.write_all(&handshake).unwrap();
        let (message, _) = listener.accept().unwrap();

        // 0x7fff > MAX_FRAME_SIZE
        command.write_all(&[0x7f, 0xff, 0, 0]).unwrap();
        (command, message)
    })
    .await
    .unwrap();

    assert_eq!(harness.next_seen().await, Seen::Connected("raw-1".to_string()));
    match harness.next_seen().await {
        Seen::Disconnected(postfix, DisconnectReason::Protocol(msg)) => {
            assert_eq!(postfix, "raw-1");
            assert!(msg.contains("too large"), "{msg}");
        }
        other => panic!("Expected protocol disconnect, got: {other:?}"),
    }

    // The message channel is closed by the server.
    let (_command, mut message) = reverse;
    tokio::task::spawn_blocking(move || {
        message.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(message.read(&mut buf).unwrap(), 0);
    })
    .await
    .unwrap();
    harness.stop().await;
}

/// A sync call against a peer that reads the request and hangs up without
/// replying returns an error instead of blocking forever.
#[test]
fn test_sync_call_unblocks_when_peer_hangs_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let config = IpcConfig {
        socket_prefix: tmp.path().join("yap").display().to_string(),
        ..IpcConfig::default()
    };
    let server_path = yap::paths::server_socket_path(&config.socket_prefix, "mute");
    let listener = UnixListener::bind(&server_path).unwrap();

    let fake = std::thread::spawn(move || {
        let (mut command, _) = listener.accept().unwrap();
        let mut len = [0u8; 2];
        command.read_exact(&mut len).unwrap();
        let mut path = vec![0u8; usize::from(u16::from_be_bytes(len))];
        command.read_exact(&mut path).unwrap();
        command.read_exact(&mut len).unwrap();
        let mut postfix = vec![0u8; usize::from(u16::from_be_bytes(len))];
        command.read_exact(&mut postfix).unwrap();

        let message = UnixStream::connect(String::from_utf8(path).unwrap()).unwrap();
        let request = framing::read_frame(&mut command).unwrap();
        assert!(request.header.flags & flags::SYNC != 0);
        drop(message);
        drop(command);
    });

    let mut client = Client::connect("mute", &config).unwrap();
    let err = client.send_sync_command(&packet(ADD, &[1, 2])).unwrap_err();
    assert!(matches!(err, ClientError::Disconnected(DisconnectReason::HungUp)), "{err}");
    fake.join().unwrap();

    let mut handler = Collector::default();
    client.dispatch_pending(&mut handler);
    client.dispatch_pending(&mut handler);
    assert_eq!(handler.disconnects, vec![DisconnectReason::HungUp]);
}

#[test]
fn test_empty_command_rejected_locally() {
    let tmp = TempDir::new().unwrap();
    let config = IpcConfig {
        socket_prefix: tmp.path().join("yap").display().to_string(),
        ..IpcConfig::default()
    };
    let server_path = yap::paths::server_socket_path(&config.socket_prefix, "idle");
    let listener = UnixListener::bind(&server_path).unwrap();

    let fake = std::thread::spawn(move || {
        let (mut command, _) = listener.accept().unwrap();
        let mut len = [0u8; 2];
        command.read_exact(&mut len).unwrap();
        let mut path = vec![0u8; usize::from(u16::from_be_bytes(len))];
        command.read_exact(&mut path).unwrap();
        command.read_exact(&mut len).unwrap();
        let mut postfix = vec![0u8; usize::from(u16::from_be_bytes(len))];
        command.read_exact(&mut postfix).unwrap();
        let message = UnixStream::connect(String::from_utf8(path).unwrap()).unwrap();
        // Nothing should ever arrive on the command channel.
        let mut rest = Vec::new();
        command.read_to_end(&mut rest).unwrap();
        drop(message);
        rest
    });

    let mut client = Client::connect("idle", &config).unwrap();
    assert!(matches!(client.send_async_command(&Packet::new()), Err(ClientError::EmptyPacket)));
    assert!(matches!(client.send_sync_command(&Packet::new()), Err(ClientError::EmptyPacket)));
    assert!(client.is_connected());
    drop(client);

    assert!(fake.join().unwrap().is_empty());
}
