//! End-to-end sessions over in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use dot_driver::{
    CoreConfig, CoreThread, DeviceInfo, DriverCore, Geometry, KeyEvent, VirtualDisplay,
    VirtualDriver,
};
use dot_proto::keys::{self, blk, cmd, command};
use dot_proto::{
    AuthMethod, ErrorCode, Frame, KeyRange, PROTOCOL_VERSION, Packet, PacketType, ParamFlags,
    ParamId, Request, Response, WriteRequest, read_frame, write_packet,
};
use dotshare::{Authenticator, KeyAuth, NoAuth, Ownership, Server, ServerConfig, serve_connection};
use tokio::io::{AsyncWriteExt, DuplexStream};

const WAIT: Duration = Duration::from_secs(2);

struct Daemon {
    server: Arc<Server>,
    display: VirtualDisplay,
    core: Option<CoreThread>,
}

impl Daemon {
    fn start(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let geometry = Geometry::new(8, 1);
        let (driver, display) = VirtualDriver::new("virtual", "vd8", geometry);
        let (gateway, inbox) = dot_driver::gateway(16);
        let server = Server::new(
            config,
            gateway,
            authenticator,
            DeviceInfo {
                driver_name: "virtual".into(),
                model: "vd8".into(),
                geometry,
                ..Default::default()
            },
        );
        let core = DriverCore::spawn(
            Box::new(driver),
            inbox,
            server.clone(),
            CoreConfig {
                poll_interval: Duration::from_millis(5),
                max_reads_per_poll: 16,
                reopen_interval: Duration::from_millis(5),
            },
        )
        .unwrap();
        Self {
            server,
            display,
            core: Some(core),
        }
    }

    fn open() -> Self {
        Self::start(ServerConfig::default(), Arc::new(NoAuth))
    }

    /// The owning application keeps the display, so the device stays open
    /// and keys are read even when no client fills it.
    async fn holding_display() -> Self {
        let daemon = Self::open();
        daemon.server.set_core_active(true);
        daemon.wait_for(|s| s.device().online).await;
        daemon
    }

    fn connect(&self) -> Client {
        self.connect_with_buffer(64 * 1024)
    }

    fn connect_with_buffer(&self, buffer: usize) -> Client {
        let (client, server_side) = tokio::io::duplex(buffer);
        tokio::spawn(serve_connection(self.server.clone(), server_side, "test".into()));
        Client { stream: client }
    }

    async fn client(&self) -> Client {
        self.client_with_buffer(64 * 1024).await
    }

    async fn client_with_buffer(&self, buffer: usize) -> Client {
        let mut client = self.connect_with_buffer(buffer);
        client.handshake(AuthMethod::None, b"").await;
        client
    }

    async fn wait_for(&self, mut check: impl FnMut(&Server) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.server) {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_display(&self, mut check: impl FnMut(&VirtualDisplay) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.display) {
            assert!(tokio::time::Instant::now() < deadline, "display never matched");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop(mut self) {
        self.server.shutdown();
        self.server.gateway().shutdown().await;
        if let Some(core) = self.core.take() {
            tokio::task::spawn_blocking(move || core.join()).await.unwrap();
        }
    }
}

struct Client {
    stream: DuplexStream,
}

impl Client {
    async fn send(&mut self, request: Request) {
        write_packet(&mut self.stream, &request.to_packet()).await.unwrap();
    }

    async fn recv(&mut self) -> Response {
        let frame = tokio::time::timeout(WAIT, read_frame(&mut self.stream, 1 << 16))
            .await
            .expect("no packet from server")
            .unwrap();
        match frame {
            Some(Frame::Packet(packet)) => Response::decode(&packet).unwrap(),
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    async fn request(&mut self, request: Request) -> Response {
        self.send(request).await;
        self.recv().await
    }

    /// True once the server has closed its end.
    async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, read_frame(&mut self.stream, 1 << 16)).await,
            Ok(Ok(None))
        )
    }

    async fn handshake(&mut self, method: AuthMethod, credential: &[u8]) {
        assert_eq!(self.recv().await, Response::Version(PROTOCOL_VERSION));
        self.send(Request::Version {
            version: PROTOCOL_VERSION,
        })
        .await;
        assert!(matches!(self.recv().await, Response::AuthMethods(_)));
        let reply = self
            .request(Request::Auth {
                method,
                credential: credential.to_vec(),
            })
            .await;
        assert_eq!(reply, Response::Ack);
    }

    async fn enter_tty(&mut self, path: &[u32]) {
        let reply = self
            .request(Request::EnterTtyMode {
                path: path.to_vec(),
                keycodes: false,
            })
            .await;
        assert_eq!(reply, Response::Ack);
    }
}

fn lnup() -> u64 {
    command(blk::BASIC, cmd::LNUP)
}

// --- Handshake ---

#[tokio::test]
async fn handshake_then_queries() {
    let daemon = Daemon::open();
    let mut client = daemon.client().await;
    assert_eq!(
        client.request(Request::GetDisplaySize).await,
        Response::DisplaySize {
            columns: 8,
            rows: 1
        }
    );
    assert_eq!(
        client.request(Request::GetDriverName).await,
        Response::DriverName("virtual".into())
    );
    daemon.stop().await;
}

#[tokio::test]
async fn old_protocol_version_is_rejected() {
    let daemon = Daemon::open();
    let mut client = daemon.connect();
    assert_eq!(client.recv().await, Response::Version(PROTOCOL_VERSION));
    client.send(Request::Version { version: 7 }).await;
    assert_eq!(client.recv().await, Response::Error(ErrorCode::ProtocolVersion));
    assert!(client.closed().await);
    daemon.wait_for(|s| s.connection_count() == 0).await;
    daemon.stop().await;
}

#[tokio::test]
async fn requests_before_auth_close_the_session() {
    let daemon = Daemon::open();
    let mut client = daemon.connect();
    client.recv().await;
    client.send(Request::GetDriverName).await;
    assert_eq!(client.recv().await, Response::Error(ErrorCode::IllegalInstruction));
    assert!(client.closed().await);
    daemon.stop().await;
}

#[tokio::test]
async fn unauthenticated_limit_refuses_new_transports() {
    let config = ServerConfig {
        max_unauthenticated: 1,
        ..Default::default()
    };
    let daemon = Daemon::start(config, Arc::new(NoAuth));
    let mut first = daemon.connect();
    first.recv().await;
    daemon.wait_for(|s| s.unauthenticated_count() == 1).await;

    let mut second = daemon.connect();
    assert_eq!(second.recv().await, Response::Error(ErrorCode::ConnRefused));
    assert!(second.closed().await);
    assert_eq!(daemon.server.connection_count(), 1);
    assert_eq!(daemon.server.metrics().snapshot().connections.refused, 1);
    daemon.stop().await;
}

#[tokio::test]
async fn silent_client_times_out() {
    let config = ServerConfig {
        auth_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let daemon = Daemon::start(config, Arc::new(NoAuth));
    let mut client = daemon.connect();
    client.recv().await;
    assert!(client.closed().await);
    daemon.wait_for(|s| s.unauthenticated_count() == 0).await;
    daemon.stop().await;
}

#[tokio::test]
async fn key_authentication() {
    let daemon = Daemon::start(ServerConfig::default(), Arc::new(KeyAuth::new(b"hunter2")));

    let mut wrong = daemon.connect();
    wrong.recv().await;
    wrong.send(Request::Version { version: PROTOCOL_VERSION }).await;
    assert_eq!(wrong.recv().await, Response::AuthMethods(vec![AuthMethod::Key]));
    wrong
        .send(Request::Auth {
            method: AuthMethod::Key,
            credential: b"guess".to_vec(),
        })
        .await;
    assert_eq!(wrong.recv().await, Response::Error(ErrorCode::Authentication));
    assert!(wrong.closed().await);

    let mut right = daemon.connect();
    right.handshake(AuthMethod::Key, b"hunter2").await;
    assert_eq!(right.request(Request::Synchronize).await, Response::Ack);
    daemon.stop().await;
}

// --- Display and keys ---

#[tokio::test]
async fn written_text_reaches_the_display() {
    let daemon = Daemon::open();
    let mut client = daemon.client().await;
    client.enter_tty(&[1]).await;
    let reply = client
        .request(Request::Write(WriteRequest {
            text: Some("ab".into()),
            cursor: Some(0),
            ..Default::default()
        }))
        .await;
    assert_eq!(reply, Response::Ack);
    daemon
        .wait_display(|d| d.cells().get(..2) == Some(&[0x01, 0x03][..]))
        .await;

    assert_eq!(client.request(Request::LeaveTtyMode).await, Response::Ack);
    daemon.wait_display(|d| !d.is_open()).await;
    daemon.stop().await;
}

#[tokio::test]
async fn keys_stop_at_an_unfocused_tty() {
    let daemon = Daemon::holding_display().await;
    let mut a = daemon.client().await;
    let mut b = daemon.client().await;
    a.enter_tty(&[1]).await;
    b.enter_tty(&[1, 2]).await;

    let event = KeyEvent {
        keycode: 3,
        command: Some(lnup()),
    };
    daemon.display.press(event);
    assert_eq!(a.recv().await, Response::Key(lnup()));

    assert_eq!(a.request(Request::SetFocus { tty: 2 }).await, Response::Ack);
    let ignore = Request::IgnoreKeyRanges(vec![KeyRange::single(lnup())]);
    assert_eq!(a.request(ignore).await, Response::Ack);
    daemon.display.press(event);
    assert_eq!(b.recv().await, Response::Key(lnup()));
    daemon.stop().await;
}

// --- Exclusive ownership ---

#[tokio::test]
async fn raw_holder_disconnect_resets_device() {
    let daemon = Daemon::holding_display().await;
    let mut a = daemon.client().await;
    let mut b = daemon.client().await;

    let raw = Request::EnterRawMode {
        driver: String::new(),
    };
    assert_eq!(a.request(raw.clone()).await, Response::Ack);
    daemon.display.inject_packet(vec![0xAA, 0x55]);
    assert_eq!(a.recv().await, Response::Packet(vec![0xAA, 0x55]));
    assert_eq!(b.request(raw.clone()).await, Response::Error(ErrorCode::DeviceBusy));

    let resets = daemon.display.reset_count();
    drop(a);
    daemon.wait_for(|s| s.ownership() == Ownership::Free).await;
    daemon.wait_display(|d| d.reset_count() > resets).await;

    assert_eq!(b.request(raw).await, Response::Ack);
    daemon.stop().await;
}

#[tokio::test]
async fn suspend_and_resume() {
    let daemon = Daemon::holding_display().await;
    let mut a = daemon.client().await;
    let mut b = daemon.client().await;

    let suspend = Request::SuspendDriver {
        driver: "virtual".into(),
    };
    assert_eq!(a.request(suspend.clone()).await, Response::Ack);
    assert!(!daemon.display.is_open());
    assert_eq!(b.request(suspend).await, Response::Error(ErrorCode::DeviceBusy));
    assert_eq!(
        b.request(Request::ResumeDriver).await,
        Response::Error(ErrorCode::IllegalInstruction)
    );

    assert_eq!(a.request(Request::ResumeDriver).await, Response::Ack);
    assert!(daemon.display.is_open());
    assert!(daemon.server.ownership().is_free());
    daemon.stop().await;
}

#[tokio::test]
async fn device_failure_reaches_raw_holder_and_watchers() {
    let daemon = Daemon::holding_display().await;
    let mut raw = daemon.client().await;
    let mut watcher = daemon.client().await;
    watcher.enter_tty(&[1]).await;
    let accept = Request::AcceptKeyRanges(vec![
        KeyRange::single(keys::OFFLINE),
        KeyRange::single(keys::ONLINE),
    ]);
    assert_eq!(watcher.request(accept).await, Response::Ack);
    let enter_raw = Request::EnterRawMode {
        driver: String::new(),
    };
    assert_eq!(raw.request(enter_raw).await, Response::Ack);

    daemon.display.fail_reads(1);
    assert!(matches!(
        raw.recv().await,
        Response::Exception {
            code: ErrorCode::DriverError,
            ..
        }
    ));
    assert_eq!(watcher.recv().await, Response::Key(keys::OFFLINE));
    assert_eq!(watcher.recv().await, Response::Key(keys::ONLINE));
    daemon.stop().await;
}

#[tokio::test]
async fn shutdown_ends_a_session_that_stopped_reading() {
    let daemon = Daemon::holding_display().await;
    let mut client = daemon.client_with_buffer(256).await;
    let suspend = Request::SuspendDriver {
        driver: String::new(),
    };
    assert_eq!(client.request(suspend).await, Response::Ack);

    // Keep requesting without reading until both directions back up.
    let _ = tokio::time::timeout(Duration::from_millis(200), async {
        for _ in 0..2000 {
            client.send(Request::Synchronize).await;
        }
    })
    .await;
    assert_eq!(daemon.server.connection_count(), 1);

    daemon.server.shutdown();
    daemon.wait_for(|s| s.connection_count() == 0).await;
    assert!(daemon.server.ownership().is_free());
    daemon.wait_display(|d| d.is_open()).await;
    daemon.stop().await;
}

// --- Parameters ---

#[tokio::test]
async fn global_change_reaches_every_watcher() {
    let daemon = Daemon::open();
    let clip = ParamId::ClipboardContent.code();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut c = daemon.client().await;
        let subscribe = Request::ParamRequest {
            flags: ParamFlags::SUBSCRIBE | ParamFlags::GLOBAL,
            param: clip,
            subparam: 0,
        };
        assert_eq!(c.request(subscribe).await, Response::Ack);
        clients.push(c);
    }

    let set = Request::ParamValue {
        flags: ParamFlags::GLOBAL,
        param: clip,
        subparam: 0,
        value: b"hello".to_vec(),
    };
    assert_eq!(clients[0].request(set).await, Response::Ack);
    assert_eq!(clients[0].request(Request::Synchronize).await, Response::Ack);

    for c in &mut clients[1..] {
        match c.recv().await {
            Response::ParamUpdate { param, value, .. } => {
                assert_eq!(param, clip);
                assert_eq!(value, b"hello");
            }
            other => panic!("expected an update, got {other:?}"),
        }
    }
    assert_eq!(daemon.server.metrics().snapshot().notifications_sent, 2);
    daemon.stop().await;
}

// --- Malformed input ---

#[tokio::test]
async fn oversized_packet_is_dropped_silently() {
    let daemon = Daemon::open();
    let mut client = daemon.client().await;

    let mut frame = Vec::new();
    frame.extend_from_slice(&600u32.to_be_bytes());
    frame.extend_from_slice(&PacketType::Write.code().to_be_bytes());
    frame.extend_from_slice(&[0u8; 600]);
    client.stream.write_all(&frame).await.unwrap();

    assert_eq!(client.request(Request::Synchronize).await, Response::Ack);
    assert_eq!(daemon.server.metrics().snapshot().packets.oversized, 1);
    daemon.stop().await;
}

#[tokio::test]
async fn unknown_packet_type_gets_an_exception() {
    let daemon = Daemon::open();
    let mut client = daemon.client().await;
    let packet = Packet {
        ptype: 0x4242,
        payload: vec![7],
    };
    write_packet(&mut client.stream, &packet).await.unwrap();
    assert_eq!(
        client.recv().await,
        Response::Exception {
            code: ErrorCode::UnknownInstruction,
            ptype: 0x4242,
            payload: vec![7],
        }
    );
    assert_eq!(client.request(Request::Synchronize).await, Response::Ack);
    daemon.stop().await;
}
