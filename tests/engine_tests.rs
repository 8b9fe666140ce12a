//! Integration tests for the transaction engines and ports.

use std::time::{Duration, Instant};

use proptest::prelude::*;

use cxl_fabric::codec::cache::{CachePacket, CacheState, D2hReqOp, H2dData, H2dRsp, H2dRspOp};
use cxl_fabric::codec::io::IoPacket;
use cxl_fabric::codec::mem::{MemPacket, NdrOp};
use cxl_fabric::codec::Packet;
use cxl_fabric::common::{Bdf, EngineError, PortId, ProtocolKind, Tag};
use cxl_fabric::port::{Inbound, LinkState, Port, PortKind};
use cxl_fabric::txn::{
    CreditLimits, CreditPool, MessageClass, Role, TagAllocator, TransactionEngine, TxnState,
};

const TIMEOUT: Duration = Duration::from_millis(100);

fn host_mem(limits: &CreditLimits) -> TransactionEngine {
    TransactionEngine::new(ProtocolKind::Mem, Role::Host, limits, TIMEOUT)
}

fn drs(tag: Tag) -> Packet {
    MemPacket::data_response(tag.val(), 0, vec![0xab; 64], false).into()
}

fn go(tag: Tag, op: H2dRspOp) -> Packet {
    CachePacket::H2dRsp(H2dRsp {
        op,
        state: CacheState::Exclusive,
        cqid: tag.val(),
        cache_id: 0,
    })
    .into()
}

fn h2d_data(tag: Tag) -> Packet {
    CachePacket::H2dData(H2dData {
        go_err: false,
        poison: false,
        cqid: tag.val(),
        cache_id: 0,
        data: vec![0x11; 64],
    })
    .into()
}

/// Tests a read completes on its data response and returns the credit.
#[test]
fn test_read_completes_on_data() {
    let mut engine = host_mem(&CreditLimits::uniform(1));
    let tag = engine.send(MemPacket::mem_read(0x1000).into()).unwrap();
    assert_eq!(tag, Tag(0));
    assert_eq!(engine.state(tag), TxnState::Sent);
    assert_eq!(engine.credits(MessageClass::M2sReq).unwrap().available(), 0);

    let done = engine.on_receive(drs(tag)).unwrap().expect("complete");
    assert_eq!(done.tag, tag);
    assert!(done.response.is_none());
    assert_eq!(done.data, Some(drs(tag)));
    assert_eq!(engine.state(tag), TxnState::Completed);
    assert_eq!(engine.credits(MessageClass::M2sReq).unwrap().available(), 1);
    assert_eq!(engine.outstanding(), 0);
}

/// Tests a send without credit fails and leaves the engine unchanged.
#[test]
fn test_no_credit() {
    let mut engine = host_mem(&CreditLimits::uniform(1));
    engine.send(MemPacket::mem_read(0x0).into()).unwrap();

    let err = engine.send(MemPacket::mem_read(0x40).into()).unwrap_err();
    assert_eq!(
        err,
        EngineError::NoCredit {
            class: MessageClass::M2sReq
        }
    );
    assert_eq!(engine.outstanding(), 1);

    // Writes draw on a separate pool.
    let tag = engine
        .send(MemPacket::mem_write(0x80, vec![0; 64]).into())
        .unwrap();
    assert_eq!(tag, Tag(1));
}

/// Tests a write completes on its NDR.
#[test]
fn test_write_completes_on_ndr() {
    let mut engine = host_mem(&CreditLimits::default());
    let tag = engine
        .send(MemPacket::mem_write(0x40, vec![1; 64]).into())
        .unwrap();
    let ndr: Packet = MemPacket::completion(NdrOp::Cmp, tag.val(), 0, false).into();
    let done = engine.on_receive(ndr.clone()).unwrap().expect("complete");
    assert_eq!(done.response, Some(ndr));
}

/// Tests tags are reused smallest-first.
#[test]
fn test_tag_reuse_smallest_free() {
    let mut engine = host_mem(&CreditLimits::default());
    let tags: Vec<Tag> = (0..3)
        .map(|i| engine.send(MemPacket::mem_read(i * 64).into()).unwrap())
        .collect();
    assert_eq!(tags, vec![Tag(0), Tag(1), Tag(2)]);

    engine.on_receive(drs(Tag(1))).unwrap();
    assert_eq!(engine.send(MemPacket::mem_read(0x1000).into()).unwrap(), Tag(1));
    assert_eq!(engine.send(MemPacket::mem_read(0x1040).into()).unwrap(), Tag(3));
}

/// Tests the tag written into the request matches the allocated tag.
#[test]
fn test_send_at_stamps_tag() {
    let mut engine = TransactionEngine::new(
        ProtocolKind::Io,
        Role::Host,
        &CreditLimits::default(),
        TIMEOUT,
    );
    engine
        .send(IoPacket::mem_read(Bdf::new(0, 0, 0), 0x0, 1).into())
        .unwrap();
    let (tag, wire) = engine
        .send_at(IoPacket::mem_read(Bdf::new(0, 0, 0), 0x4, 1).into(), Instant::now())
        .unwrap();
    assert_eq!(tag, Tag(1));
    match wire {
        Packet::Io(p) => assert_eq!(p.tag, 1),
        other => panic!("unexpected {:?}", other),
    }
}

/// Tests a response for an unknown tag is rejected.
#[test]
fn test_unknown_tag() {
    let mut engine = host_mem(&CreditLimits::default());
    let err = engine.on_receive(drs(Tag(9))).unwrap_err();
    assert_eq!(err, EngineError::UnknownTag { tag: Tag(9) });
}

/// Tests engines reject requests they may not originate.
#[test]
fn test_request_direction_checked() {
    let mut host = host_mem(&CreditLimits::default());
    let ndr: Packet = MemPacket::completion(NdrOp::Cmp, 0, 0, false).into();
    assert!(matches!(host.send(ndr), Err(EngineError::NotARequest(_))));

    let io: Packet = IoPacket::mem_read(Bdf::new(0, 0, 0), 0, 1).into();
    assert!(matches!(host.send(io), Err(EngineError::WrongProtocol { .. })));

    let mut device = TransactionEngine::new(
        ProtocolKind::Mem,
        Role::Device,
        &CreditLimits::default(),
        TIMEOUT,
    );
    assert!(matches!(
        device.send(MemPacket::mem_read(0).into()),
        Err(EngineError::NotARequest(_))
    ));
}

/// Tests a deadline expiry times the transaction out and refunds its credit.
#[test]
fn test_tick_times_out() {
    let mut engine = host_mem(&CreditLimits::uniform(1));
    let start = Instant::now();
    let (tag, _) = engine
        .send_at(MemPacket::mem_read(0x0).into(), start)
        .unwrap();

    assert!(engine.tick(start + TIMEOUT / 2).is_empty());
    let failures = engine.tick(start + TIMEOUT);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].tag, tag);
    assert_eq!(failures[0].state, TxnState::TimedOut);
    assert_eq!(engine.state(tag), TxnState::TimedOut);
    assert_eq!(engine.credits(MessageClass::M2sReq).unwrap().available(), 1);

    // A late response finds nothing outstanding.
    assert_eq!(
        engine.on_receive(drs(tag)).unwrap_err(),
        EngineError::UnknownTag { tag }
    );
}

/// Tests cancelling twice reports the transaction as already resolved.
#[test]
fn test_cancel_twice() {
    let mut engine = host_mem(&CreditLimits::uniform(1));
    let tag = engine.send(MemPacket::mem_read(0x0).into()).unwrap();

    let request = engine.cancel(tag).unwrap();
    assert!(matches!(request, Packet::Mem(MemPacket::M2sReq(_))));
    assert_eq!(engine.credits(MessageClass::M2sReq).unwrap().available(), 1);

    assert_eq!(
        engine.cancel(tag).unwrap_err(),
        EngineError::AlreadyCompleted {
            tag,
            state: TxnState::Aborted
        }
    );
    assert_eq!(
        engine.cancel(Tag(40)).unwrap_err(),
        EngineError::UnknownTag { tag: Tag(40) }
    );
}

/// Tests a device read needs both GO and data before it completes.
#[test]
fn test_multi_part_completion() {
    let mut device = TransactionEngine::new(
        ProtocolKind::Cache,
        Role::Device,
        &CreditLimits::default(),
        TIMEOUT,
    );
    let tag = device
        .send(CachePacket::d2h_request(D2hReqOp::RdOwn, 0, 0x4000).into())
        .unwrap();

    assert_eq!(device.on_receive(go(tag, H2dRspOp::Go)).unwrap(), None);
    assert_eq!(device.state(tag), TxnState::Sent);
    assert_eq!(
        device.on_receive(go(tag, H2dRspOp::Go)).unwrap_err(),
        EngineError::DuplicateResponse {
            tag,
            part: "response"
        }
    );

    let done = device.on_receive(h2d_data(tag)).unwrap().expect("complete");
    assert_eq!(done.response, Some(go(tag, H2dRspOp::Go)));
    assert_eq!(done.data, Some(h2d_data(tag)));
}

/// Tests a GO-Err ends a device read without data.
#[test]
fn test_go_err_completes_without_data() {
    let mut device = TransactionEngine::new(
        ProtocolKind::Cache,
        Role::Device,
        &CreditLimits::default(),
        TIMEOUT,
    );
    let tag = device
        .send(CachePacket::d2h_request(D2hReqOp::RdShared, 0, 0x0).into())
        .unwrap();
    let done = device
        .on_receive(go(tag, H2dRspOp::GoErr))
        .unwrap()
        .expect("complete");
    assert!(done.data.is_none());
}

/// Tests the tag allocator bounds its space.
#[test]
fn test_tag_allocator_exhaustion() {
    let mut tags = TagAllocator::with_limit(2);
    assert_eq!(tags.allocate().unwrap(), Tag(0));
    assert_eq!(tags.allocate().unwrap(), Tag(1));
    assert!(!tags.has_free());
    assert_eq!(
        tags.allocate().unwrap_err(),
        EngineError::TagsExhausted { limit: 2 }
    );
    tags.release(Tag(0));
    assert_eq!(tags.in_use(), 1);
    assert_eq!(tags.allocate().unwrap(), Tag(0));
}

fn root_port() -> Port {
    Port::new(
        PortId(0),
        PortKind::RootPort,
        &ProtocolKind::ALL,
        &CreditLimits::default(),
        TIMEOUT,
    )
}

/// Tests a port refuses requests until its link is active.
#[test]
fn test_port_requires_active_link() {
    let mut port = root_port();
    assert_eq!(port.link_state(), LinkState::Down);
    let err = port
        .send_request(MemPacket::mem_read(0).into(), Instant::now())
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::LinkDown {
            state: LinkState::Down
        }
    );

    port.link_up();
    assert!(port
        .send_request(MemPacket::mem_read(0).into(), Instant::now())
        .is_ok());
}

/// Tests link loss aborts every outstanding transaction and drops the queue.
#[test]
fn test_port_link_loss_aborts() {
    let mut port = root_port();
    port.link_up();
    let now = Instant::now();
    port.send_request(MemPacket::mem_read(0x0).into(), now).unwrap();
    port.send_request(MemPacket::mem_read(0x40).into(), now).unwrap();
    assert_eq!(port.queued(), 2);

    let failures = port.link_down();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.state == TxnState::Aborted));
    assert_eq!(port.queued(), 0);

    let engine = port.engine(ProtocolKind::Mem).unwrap();
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(engine.credits(MessageClass::M2sReq).unwrap().available(), 32);
}

/// Tests responses arriving on a port complete its transactions.
#[test]
fn test_port_routes_responses_to_engine() {
    let mut port = root_port();
    port.link_up();
    let tag = port
        .send_request(MemPacket::mem_read(0x0).into(), Instant::now())
        .unwrap();

    let flits = port.take_flits(256).unwrap();
    assert_eq!(flits.len(), 1);
    assert_eq!(flits[0].packets().len(), 1);

    match port.on_packet(drs(tag)).unwrap() {
        Inbound::Completed(done) => assert_eq!(done.tag, tag),
        other => panic!("unexpected {:?}", other),
    }
    let request: Packet = CachePacket::d2h_request(D2hReqOp::RdCurr, 0, 0x0).into();
    assert_eq!(
        port.on_packet(request.clone()).unwrap(),
        Inbound::Request(request)
    );
}

/// Tests a port rejects protocols its link does not enable.
#[test]
fn test_port_protocol_disabled() {
    let mut port = Port::new(
        PortId(1),
        PortKind::RootPort,
        &[ProtocolKind::Io],
        &CreditLimits::default(),
        TIMEOUT,
    );
    port.link_up();
    assert_eq!(
        port.send_request(MemPacket::mem_read(0).into(), Instant::now())
            .unwrap_err(),
        EngineError::ProtocolDisabled(ProtocolKind::Mem)
    );
}

#[derive(Clone, Debug)]
enum Step {
    Read,
    Complete(usize),
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![Just(Step::Read), any::<usize>().prop_map(Step::Complete)],
        0..64,
    )
}

proptest! {
    /// Tests a credit pool stays within zero and its limit under any mix of debits and refunds.
    #[test]
    fn test_credit_pool_bounded(
        limit in 0u32..8,
        debits in prop::collection::vec(any::<bool>(), 0..64),
    ) {
        let mut pool = CreditPool::new(MessageClass::M2sReq, limit);
        let mut held = 0u32;
        for debit in debits {
            if debit {
                match pool.try_debit() {
                    Ok(()) => held += 1,
                    Err(e) => {
                        prop_assert_eq!(e, EngineError::NoCredit { class: MessageClass::M2sReq });
                        prop_assert_eq!(held, limit);
                    }
                }
            } else {
                match pool.refund() {
                    Ok(()) => held -= 1,
                    Err(e) => {
                        prop_assert!(matches!(e, EngineError::CreditOverflow { .. }), "expected CreditOverflow, got {:?}", e);
                        prop_assert_eq!(held, 0);
                    }
                }
            }
            prop_assert_eq!(pool.available(), limit - held);
        }
    }

    /// Tests outstanding tags stay unique and credits track them across sends and completions.
    #[test]
    fn test_engine_tags_unique_and_credits_balanced(limit in 1u32..8, steps in arb_steps()) {
        let mut engine = host_mem(&CreditLimits::uniform(limit));
        let mut live: Vec<Tag> = Vec::new();
        for step in steps {
            match step {
                Step::Read => match engine.send(MemPacket::mem_read(0x40).into()) {
                    Ok(tag) => {
                        prop_assert!(!live.contains(&tag));
                        live.push(tag);
                    }
                    Err(e) => {
                        prop_assert_eq!(e, EngineError::NoCredit { class: MessageClass::M2sReq });
                        prop_assert_eq!(live.len(), limit as usize);
                    }
                },
                Step::Complete(pick) => {
                    if !live.is_empty() {
                        let tag = live.remove(pick % live.len());
                        let done = engine.on_receive(drs(tag)).unwrap();
                        prop_assert_eq!(done.map(|d| d.tag), Some(tag));
                    }
                }
            }
            let available = engine.credits(MessageClass::M2sReq).unwrap().available();
            prop_assert_eq!(available as usize + live.len(), limit as usize);
            prop_assert_eq!(engine.outstanding(), live.len());
        }
    }
}
