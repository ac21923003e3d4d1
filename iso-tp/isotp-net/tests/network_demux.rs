//! Demultiplexing, the push-style protocol surface, and adapter teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use can_io_interface::{CanFrame, Frame, Id, SplitTxRx, StandardId};
use can_io_mock::VirtualBus;
use can_io_tcp::TcpBridge;
use isotp_net::{
    ConnectionOptions, IsoTpProtocol, IsoTpTransport, Network, NetworkError, TransferError,
};
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorder {
    made: bool,
    payloads: Vec<Vec<u8>>,
    errors: Vec<TransferError>,
    lost: Option<Option<NetworkError>>,
}

impl IsoTpProtocol for Recorder {
    fn connection_made(&mut self, _transport: IsoTpTransport) {
        self.made = true;
    }

    fn data_received(&mut self, payload: &[u8]) {
        self.payloads.push(payload.to_vec());
    }

    fn transfer_error(&mut self, error: TransferError) {
        self.errors.push(error);
    }

    fn connection_lost(&mut self, reason: Option<NetworkError>) {
        self.lost = Some(reason);
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn frames_for_unbound_ids_are_dropped() {
    let bus = VirtualBus::new();
    let (mut noise_tx, _noise_rx) = bus.attach().split();
    let a = Network::open(bus.attach());
    let b = Network::open(bus.attach());

    let (_ra, mut writer) = a
        .open_connection(0x100, 0x200, ConnectionOptions::default())
        .await
        .unwrap();
    let (mut reader, _wb) = b
        .open_connection(0x200, 0x100, ConnectionOptions::default())
        .await
        .unwrap();

    // Unrelated traffic on an unbound identifier.
    let noise = CanFrame::new(Id::Standard(StandardId::new(0x555).unwrap()), &[0x02, 1, 2]).unwrap();
    for _ in 0..5 {
        can_io_interface::AsyncTxFrameIo::send(&mut noise_tx, &noise)
            .await
            .unwrap();
    }

    let payload: Vec<u8> = (0..50).collect();
    writer.write(&payload).await.unwrap();
    writer.drain().await.unwrap();
    assert_eq!(reader.read(4095).await.unwrap(), payload);
}

#[tokio::test]
async fn protocol_callbacks_mirror_the_stream_view() {
    let bus = VirtualBus::new();
    let a = Network::open(bus.attach());
    let b = Network::open(bus.attach());

    let (transport, recorder) = a
        .create_connection(
            Recorder::default,
            0x100,
            0x200,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
    assert!(recorder.lock().unwrap().made);

    let (mut reader, mut writer) = b
        .open_connection(0x200, 0x100, ConnectionOptions::default())
        .await
        .unwrap();

    // Push side transmits...
    let outbound: Vec<u8> = (0..120).collect();
    transport.write(&outbound).await.unwrap();
    assert_eq!(reader.read(4095).await.unwrap(), outbound);

    // ...and receives.
    let inbound: Vec<u8> = (0..33).rev().collect();
    writer.write(&inbound).await.unwrap();
    writer.drain().await.unwrap();
    settle().await;
    assert_eq!(recorder.lock().unwrap().payloads, vec![inbound]);

    // Orderly shutdown reports a reasonless connection_lost.
    b.close().await;
    a.close().await;
    settle().await;
    let state = recorder.lock().unwrap();
    assert!(matches!(state.lost, Some(None)));
    assert!(state.errors.is_empty());
}

#[tokio::test]
async fn protocol_sees_transfer_errors_without_losing_the_connection() {
    let bus = VirtualBus::new();
    let (mut peer_tx, mut peer_rx) = bus.attach().split();
    let network = Network::open(bus.attach());

    let (_transport, recorder) = network
        .create_connection(
            Recorder::default,
            0x200,
            0x100,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();

    // FF then a CF with the wrong sequence number.
    let ff = isotp_net::pdu::encode(
        Id::Standard(StandardId::new(0x100).unwrap()),
        &isotp_net::pdu::Pdu::FirstFrame {
            len: 10,
            data: &[0, 1, 2, 3, 4, 5],
        },
        None,
    )
    .unwrap();
    can_io_interface::AsyncTxFrameIo::send(&mut peer_tx, &ff)
        .await
        .unwrap();
    can_io_interface::AsyncRxFrameIo::recv(&mut peer_rx)
        .await
        .unwrap();
    let bad_cf = isotp_net::pdu::encode(
        Id::Standard(StandardId::new(0x100).unwrap()),
        &isotp_net::pdu::Pdu::ConsecutiveFrame {
            sn: 7,
            data: &[6, 7, 8, 9],
        },
        None,
    )
    .unwrap();
    can_io_interface::AsyncTxFrameIo::send(&mut peer_tx, &bad_cf)
        .await
        .unwrap();

    settle().await;
    {
        let state = recorder.lock().unwrap();
        assert!(state.payloads.is_empty());
        assert_eq!(
            state.errors,
            vec![TransferError::Sequence { expected: 1, got: 7 }]
        );
        assert!(state.lost.is_none());
    }

    // The connection is still alive.
    let sf = isotp_net::pdu::encode(
        Id::Standard(StandardId::new(0x100).unwrap()),
        &isotp_net::pdu::Pdu::SingleFrame { data: b"alive" },
        None,
    )
    .unwrap();
    can_io_interface::AsyncTxFrameIo::send(&mut peer_tx, &sf)
        .await
        .unwrap();
    settle().await;
    assert_eq!(recorder.lock().unwrap().payloads, vec![b"alive".to_vec()]);
}

#[tokio::test]
async fn adapter_failure_tears_down_the_network() {
    // Two networks joined by a direct TCP link instead of a shared bus.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(listener.accept(), TcpBridge::connect(addr));
    let gateway_side = TcpBridge::from_stream(accepted.unwrap().0);
    let bridge = connected.unwrap();

    let a = Network::open(bridge);
    let b = Network::open(gateway_side);

    let (_ra, mut writer) = a
        .open_connection(0x100, 0x200, ConnectionOptions::default())
        .await
        .unwrap();
    let (mut reader, _wb) = b
        .open_connection(0x200, 0x100, ConnectionOptions::default())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..90).collect();
    writer.write(&payload).await.unwrap();
    writer.drain().await.unwrap();
    assert_eq!(reader.read(4095).await.unwrap(), payload);

    // Kill one end; the surviving network reports the dead adapter.
    a.close().await;
    let err = reader.read(4095).await.unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Adapter(_) | NetworkError::ConnectionClosed
    ));
}

#[tokio::test]
async fn transports_are_cloneable_write_handles() {
    let bus = VirtualBus::new();
    let a = Network::open(bus.attach());
    let b = Network::open(bus.attach());

    let (transport, _recorder) = a
        .create_connection(
            Recorder::default,
            0x100,
            0x200,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
    let (mut reader, _wb) = b
        .open_connection(0x200, 0x100, ConnectionOptions::default())
        .await
        .unwrap();

    let clone = transport.clone();
    transport.write(b"first").await.unwrap();
    clone.write(b"second").await.unwrap();

    assert_eq!(reader.read(4095).await.unwrap(), b"first");
    assert_eq!(reader.read(4095).await.unwrap(), b"second");
}

// Shared state in the recorder is what the factory-and-lock shape is for;
// make sure the lock is actually usable from the caller's side.
#[tokio::test]
async fn recorder_state_is_observable_mid_stream() {
    let bus = VirtualBus::new();
    let a = Network::open(bus.attach());
    let b = Network::open(bus.attach());

    let (_transport, recorder): (_, Arc<Mutex<Recorder>>) = a
        .create_connection(
            Recorder::default,
            0x100,
            0x200,
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
    let (_rb, mut writer) = b
        .open_connection(0x200, 0x100, ConnectionOptions::default())
        .await
        .unwrap();

    for n in 0..3u8 {
        writer.write(&[n; 10]).await.unwrap();
    }
    writer.drain().await.unwrap();
    settle().await;

    let state = recorder.lock().unwrap();
    assert_eq!(state.payloads.len(), 3);
    for (n, payload) in state.payloads.iter().enumerate() {
        assert_eq!(payload, &vec![n as u8; 10]);
    }
}
