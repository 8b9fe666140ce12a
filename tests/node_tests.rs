//! Integration tests for a host node driven over a bare link.

use std::time::{Duration, Instant};

use cxl_fabric::codec::mem::MemPacket;
use cxl_fabric::codec::{pack, ControlMessage, Flit, Packet};
use cxl_fabric::common::{Bdf, CxlError, PortId, ProtocolKind, DEFAULT_FLIT_SIZE};
use cxl_fabric::port::{LinkState, Port, PortKind};
use cxl_fabric::sim::endpoint::Endpoint;
use cxl_fabric::sim::{HostHandle, HostNode};
use cxl_fabric::transport::{Link, LinkEvent};
use cxl_fabric::txn::{CreditLimits, TxnState};

const TIMEOUT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(10);

fn host(link: Link) -> HostHandle {
    let port = Port::new(
        PortId(0),
        PortKind::RootPort,
        &ProtocolKind::ALL,
        &CreditLimits::default(),
        TIMEOUT,
    );
    let endpoint = Endpoint::new("host", port, link, DEFAULT_FLIT_SIZE);
    HostNode::spawn(endpoint, Bdf::new(0, 0, 0), 0x1_0000, TICK)
}

async fn next_flit(link: &mut Link) -> Option<Flit> {
    match tokio::time::timeout(Duration::from_secs(2), link.recv()).await {
        Ok(LinkEvent::Frame(bytes)) => Some(Flit::decode(&bytes).unwrap()),
        Ok(LinkEvent::Closed(_)) => None,
        Err(_) => panic!("no event within 2s"),
    }
}

/// Tests losing the link aborts every outstanding transaction at once and
/// leaves the host running.
#[tokio::test]
async fn test_link_loss_aborts_outstanding() {
    let (near, mut far) = Link::pair(DEFAULT_FLIT_SIZE);
    let mut host = host(near);

    let started = Instant::now();
    let reads = async { tokio::join!(host.mem_read(0x0, 64), host.mem_read(0x40, 64)) };
    let peer = async {
        let mut seen: Vec<Packet> = Vec::new();
        while seen.len() < 2 {
            let flit = next_flit(&mut far).await.expect("requests before close");
            seen.extend(flit.packets().iter().cloned());
        }
        far.close();
        seen
    };
    let ((first, second), seen) = tokio::join!(reads, peer);

    assert_eq!(seen.len(), 2);
    for result in [first, second] {
        match result {
            Err(CxlError::TransactionFailed { state, .. }) => assert_eq!(state, TxnState::Aborted),
            other => panic!("expected an aborted read, got {:?}", other),
        }
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = host.stats().await.unwrap();
    assert_eq!(stats.aborted, 2);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(host.port_state().await.unwrap().link, LinkState::Down);
    assert!(!host.is_stopped());

    // Without a dialer there is nothing to reconnect to.
    assert!(host.reconnect().await.is_err());
    assert!(host.shutdown().await.is_none());
}

/// Tests a response carrying a tag the host never issued stops the host
/// with an error naming its link.
#[tokio::test]
async fn test_stray_response_stops_host() {
    let (near, mut far) = Link::pair(DEFAULT_FLIT_SIZE);
    let link = near.id();
    let mut host = host(near);

    let stray: Packet = MemPacket::data_response(7, 0, vec![0; 64], false).into();
    let (flit, _) = pack(DEFAULT_FLIT_SIZE, vec![stray]).unwrap();
    far.send_flit(&flit).unwrap();

    let mut disconnected = false;
    while let Some(flit) = next_flit(&mut far).await {
        if matches!(flit.control_message(), Some(ControlMessage::Disconnect)) {
            disconnected = true;
        }
    }
    assert!(disconnected, "host closed without a disconnect flit");

    match host.shutdown().await {
        Some(CxlError::ProtocolViolation { link: at, packet, .. }) => {
            assert_eq!(at, link);
            assert!(packet.contains("S2mDrs"), "{packet}");
        }
        other => panic!("expected a protocol violation, got {:?}", other),
    }
    assert!(host.is_stopped());
}
