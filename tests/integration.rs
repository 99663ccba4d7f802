//! Integration tests driving a live DMR server over real UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;

use perun::config::Config;
use perun::identdb::IdentDb;
use perun::protocol::{DmrPacket, FrameType, RptcConfig, Timeslot, DTYPE_VOICE_TERMINATOR};
use perun::registry::{Registry, RepeaterRecord};
use perun::server::DmrServer;
use perun::DEFAULT_PARROT_ID;

const PASSWORD: &str = "s3cret";

/// Start a server on an ephemeral port with the given repeaters registered.
async fn spawn_server(repeaters: Vec<RepeaterRecord>) -> (Arc<DmrServer>, SocketAddr) {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1".parse().unwrap();
    config.server.dmr_port = 0;
    config.server.sweep_interval = Duration::from_millis(100);
    config.server.shutdown_grace = Duration::from_millis(200);

    spawn_server_with(config, repeaters).await
}

async fn spawn_server_with(
    config: Config,
    repeaters: Vec<RepeaterRecord>,
) -> (Arc<DmrServer>, SocketAddr) {
    let registry = Arc::new(Registry::in_memory().unwrap());
    for record in repeaters {
        registry.add_repeater(record).unwrap();
    }

    let server = Arc::new(DmrServer::new(config, registry, Arc::new(IdentDb::empty())));
    Arc::clone(&server).start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// A wire-level repeater used to exercise the server.
struct TestRepeater {
    radio_id: u32,
    socket: UdpSocket,
    server: SocketAddr,
}

impl TestRepeater {
    async fn new(radio_id: u32, server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            radio_id,
            socket,
            server,
        }
    }

    async fn send(&self, data: &[u8]) {
        self.socket.send_to(data, self.server).await.unwrap();
    }

    async fn recv(&self) -> Vec<u8> {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("reply expected")
    }

    async fn try_recv(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = [0u8; 302];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    async fn login(&self) -> u32 {
        let mut data = b"RPTL".to_vec();
        data.extend_from_slice(&self.radio_id.to_be_bytes());
        self.send(&data).await;

        let reply = self.recv().await;
        assert_eq!(&reply[..6], b"RPTACK");
        assert_eq!(reply.len(), 10, "challenge must carry a 4-byte salt");
        u32::from_be_bytes(reply[6..10].try_into().unwrap())
    }

    async fn authenticate(&self, salt: u32, password: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt.to_be_bytes());
        hasher.update(password.as_bytes());

        let mut data = b"RPTK".to_vec();
        data.extend_from_slice(&self.radio_id.to_be_bytes());
        data.extend_from_slice(&hasher.finalize());
        self.send(&data).await;
        self.recv().await
    }

    async fn configure(&self, callsign: &str) -> Vec<u8> {
        let config = RptcConfig {
            callsign: callsign.into(),
            rx_frequency: 438800000,
            tx_frequency: 431800000,
            tx_power: 10,
            color_code: 1,
            latitude: 41.7,
            longitude: -72.7,
            height: 20,
            location: "Testville".into(),
            description: "integration".into(),
            slots: 2,
            url: String::new(),
            software_id: "MMDVM".into(),
            package_id: "v1".into(),
        };
        self.send(&config.encode(self.radio_id)).await;
        self.recv().await
    }

    async fn ping(&self) -> Vec<u8> {
        let mut data = b"RPTPING".to_vec();
        data.extend_from_slice(&self.radio_id.to_be_bytes());
        self.send(&data).await;
        self.recv().await
    }

    /// Full handshake to Online.
    async fn connect(&self, callsign: &str) {
        let salt = self.login().await;
        let reply = self.authenticate(salt, PASSWORD).await;
        assert_eq!(&reply[..6], b"RPTACK");
        let reply = self.configure(callsign).await;
        assert_eq!(&reply[..6], b"RPTACK");
        let reply = self.ping().await;
        assert_eq!(&reply[..7], b"MSTPONG");
    }

    fn burst(
        &self,
        stream_id: u32,
        sequence: u8,
        src: u32,
        dst: u32,
        group_call: bool,
        slot: Timeslot,
    ) -> DmrPacket {
        DmrPacket {
            sequence,
            src,
            dst,
            repeater: self.radio_id,
            slot,
            group_call,
            frame_type: FrameType::Voice,
            dtype_vseq: 0,
            stream_id,
            payload: [sequence; 33],
            ber: 0,
            rssi: 0,
        }
    }

    fn terminator(
        &self,
        stream_id: u32,
        sequence: u8,
        src: u32,
        dst: u32,
        group_call: bool,
        slot: Timeslot,
    ) -> DmrPacket {
        let mut packet = self.burst(stream_id, sequence, src, dst, group_call, slot);
        packet.frame_type = FrameType::DataSync;
        packet.dtype_vseq = DTYPE_VOICE_TERMINATOR;
        packet
    }
}

#[tokio::test]
async fn test_happy_login() {
    let (server, addr) = spawn_server(vec![RepeaterRecord::new(1234567, PASSWORD, 3107001)]).await;

    let repeater = TestRepeater::new(1234567, addr).await;
    let salt = repeater.login().await;

    let reply = repeater.authenticate(salt, PASSWORD).await;
    assert_eq!(&reply[..6], b"RPTACK");
    assert_eq!(&reply[6..10], &1234567u32.to_be_bytes());

    let session = server.store().get(1234567).unwrap();
    assert_eq!(session.state(), perun::store::ConnectionState::Authed);

    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_password_is_rejected() {
    let (server, addr) = spawn_server(vec![RepeaterRecord::new(1234567, PASSWORD, 3107001)]).await;

    let repeater = TestRepeater::new(1234567, addr).await;
    let salt = repeater.login().await;

    let reply = repeater.authenticate(salt, "wrong").await;
    assert_eq!(&reply[..6], b"MSTNAK");
    assert!(server.store().get(1234567).is_none());

    // A fresh login still works after the eviction.
    let salt = repeater.login().await;
    let reply = repeater.authenticate(salt, PASSWORD).await;
    assert_eq!(&reply[..6], b"RPTACK");

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_repeater_login_is_naked() {
    let (server, addr) = spawn_server(vec![]).await;

    let repeater = TestRepeater::new(7654321, addr).await;
    let mut data = b"RPTL".to_vec();
    data.extend_from_slice(&7654321u32.to_be_bytes());
    repeater.send(&data).await;

    let reply = repeater.recv().await;
    assert_eq!(&reply[..6], b"MSTNAK");
    assert!(server.store().get(7654321).is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_private_call_routing() {
    let (server, addr) = spawn_server(vec![
        RepeaterRecord::new(1001, PASSWORD, 3107001),
        RepeaterRecord::new(1002, PASSWORD, 3107002),
    ])
    .await;

    let a = TestRepeater::new(1001, addr).await;
    let b = TestRepeater::new(1002, addr).await;
    a.connect("N1A").await;
    b.connect("N1B").await;

    a.send(&a.burst(0xbeef, 0, 3001, 1002, false, Timeslot::One).encode())
        .await;

    let data = b.recv().await;
    let packet = DmrPacket::decode(&data).unwrap();
    assert_eq!(packet.repeater, 1002);
    assert_eq!(packet.src, 3001);
    assert_eq!(packet.dst, 1002);
    assert_eq!(packet.slot, Timeslot::One);

    // Exactly one copy: nothing further arrives at either peer.
    assert!(b.try_recv(Duration::from_millis(200)).await.is_none());
    assert!(a.try_recv(Duration::from_millis(100)).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_group_call_fan_out() {
    // B is statically subscribed to TG 91 on TS2; C has no subscription.
    let (server, addr) = spawn_server(vec![
        RepeaterRecord::new(1001, PASSWORD, 3107001),
        RepeaterRecord::new(1002, PASSWORD, 3107002)
            .with_static(Timeslot::Two, vec![91]),
        RepeaterRecord::new(1003, PASSWORD, 3107003),
    ])
    .await;

    let a = TestRepeater::new(1001, addr).await;
    let b = TestRepeater::new(1002, addr).await;
    let c = TestRepeater::new(1003, addr).await;
    a.connect("N1A").await;
    b.connect("N1B").await;
    c.connect("N1C").await;

    a.send(&a.burst(0xbeef, 0, 3001, 91, true, Timeslot::One).encode())
        .await;

    // B hears the talkgroup on its subscribed slot, not the sender's.
    let data = b.recv().await;
    let packet = DmrPacket::decode(&data).unwrap();
    assert_eq!(packet.repeater, 1002);
    assert_eq!(packet.dst, 91);
    assert_eq!(packet.slot, Timeslot::Two);

    // C is not subscribed, and the sender never hears itself.
    assert!(c.try_recv(Duration::from_millis(200)).await.is_none());
    assert!(a.try_recv(Duration::from_millis(100)).await.is_none());

    // The group call became A's dynamic subscription on TS1.
    let view = server.store().get(1001).unwrap().view();
    assert_eq!(view.dynamic_for(Timeslot::One), Some(91));

    server.shutdown().await;
}

#[tokio::test]
async fn test_parrot_echo() {
    let (server, addr) = spawn_server(vec![RepeaterRecord::new(1001, PASSWORD, 3107001)]).await;

    let a = TestRepeater::new(1001, addr).await;
    a.connect("N1A").await;

    for seq in 0..5u8 {
        a.send(
            &a.burst(0xcafe, seq, 3001, DEFAULT_PARROT_ID, false, Timeslot::One)
                .encode(),
        )
        .await;
    }
    a.send(
        &a.terminator(0xcafe, 5, 3001, DEFAULT_PARROT_ID, false, Timeslot::One)
            .encode(),
    )
    .await;

    // The whole stream comes back, in order, source and destination swapped.
    for seq in 0..=5u8 {
        let data = a.recv().await;
        let packet = DmrPacket::decode(&data).unwrap();
        assert_eq!(packet.sequence, seq);
        assert_eq!(packet.src, DEFAULT_PARROT_ID);
        assert_eq!(packet.dst, 3001);
        assert_eq!(packet.repeater, 1001);
        assert_eq!(packet.payload, [seq; 33]);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_timeout_evicts() {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1".parse().unwrap();
    config.server.dmr_port = 0;
    config.server.ping_timeout = Duration::from_millis(300);
    config.server.sweep_interval = Duration::from_millis(100);
    config.server.shutdown_grace = Duration::from_millis(200);

    let (server, addr) = spawn_server_with(
        config,
        vec![
            RepeaterRecord::new(1001, PASSWORD, 3107001),
            RepeaterRecord::new(1002, PASSWORD, 3107002),
        ],
    )
    .await;

    let a = TestRepeater::new(1001, addr).await;
    let b = TestRepeater::new(1002, addr).await;
    a.connect("N1A").await;
    b.connect("N1B").await;

    // A stops heartbeating while B keeps its session warm.
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = b.ping().await;
        assert_eq!(&reply[..7], b"MSTPONG");
    }
    assert!(server.store().get(1001).is_none());

    // Bursts from the evicted session are dropped until it logs in again.
    a.send(&a.burst(0xbeef, 0, 3001, 1002, false, Timeslot::One).encode())
        .await;
    assert!(b.try_recv(Duration::from_millis(300)).await.is_none());

    // Re-login restores service.
    a.connect("N1A").await;
    a.send(&a.burst(0xbee0, 1, 3001, 1002, false, Timeslot::One).encode())
        .await;
    let data = b.recv().await;
    assert_eq!(DmrPacket::decode(&data).unwrap().repeater, 1002);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_online_sessions() {
    let (server, addr) = spawn_server(vec![RepeaterRecord::new(1001, PASSWORD, 3107001)]).await;

    let a = TestRepeater::new(1001, addr).await;
    a.connect("N1A").await;

    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        server_clone.shutdown().await;
    });

    let data = a.recv().await;
    assert_eq!(&data[..5], b"MSTCL");
    assert_eq!(&data[5..9], &1001u32.to_be_bytes());
}
