//! Integration tests for the device models.

use std::time::{Duration, Instant};

use cxl_fabric::codec::cache::{
    CachePacket, CacheState, D2hRspOp, H2dData, H2dReq, H2dReqOp, H2dRsp, H2dRspOp,
};
use cxl_fabric::codec::io::{CplStatus, IoOp, IoPacket};
use cxl_fabric::codec::mem::{M2sReq, M2sReqOp, MemPacket, NdrOp, SnpType};
use cxl_fabric::codec::Packet;
use cxl_fabric::common::constants::EMULATED_VENDOR_ID;
use cxl_fabric::common::{AccessType, Bdf, Bias, DeviceError, PortId, Tag};
use cxl_fabric::device::config_space::{CLASS_ACCELERATOR, CLASS_CXL_MEMORY, REG_CLASS, REG_ID};
use cxl_fabric::device::{
    serve_request, Accelerator, BackingStore, ConfigSpace, DeviceCache, DeviceCore, DeviceKind,
    DeviceModel, LineState, MemoryExpander,
};
use cxl_fabric::fabric::hdm::{AddressRange, HdmDecoder};
use cxl_fabric::txn::CompletedTransaction;

const HOST: Bdf = Bdf {
    bus: 0,
    device: 0,
    function: 0,
};
const DEV: Bdf = Bdf {
    bus: 1,
    device: 0,
    function: 0,
};

fn expander(capacity: u64) -> MemoryExpander {
    let config = ConfigSpace::new(EMULATED_VENDOR_ID, 0x0d93, CLASS_CXL_MEMORY);
    MemoryExpander::new(DeviceCore::new("mem0", DEV, config, capacity, 0xab))
}

fn accelerator(kind: DeviceKind) -> Accelerator {
    let config = ConfigSpace::new(EMULATED_VENDOR_ID, 0x0d94, CLASS_ACCELERATOR);
    let core = DeviceCore::new("accel0", DEV, config, 0x1000, 0);
    Accelerator::new(core, kind, 0, 1)
}

fn tagged_read(tag: u16, address: u64) -> Packet {
    MemPacket::M2sReq(M2sReq {
        op: M2sReqOp::MemRd,
        snp_type: SnpType::NoOp,
        meta_field: 3,
        meta_value: 0,
        tag,
        address,
        ld_id: 0,
    })
    .into()
}

fn granted(request: Packet, state: CacheState, data: Option<Vec<u8>>) -> CompletedTransaction {
    CompletedTransaction {
        tag: Tag(0),
        request,
        response: Some(
            CachePacket::H2dRsp(H2dRsp {
                op: H2dRspOp::Go,
                state,
                cqid: 0,
                cache_id: 0,
            })
            .into(),
        ),
        data: data.map(|data| {
            CachePacket::H2dData(H2dData {
                go_err: false,
                poison: false,
                cqid: 0,
                cache_id: 0,
                data,
            })
            .into()
        }),
    }
}

fn single(mut packets: Vec<Packet>) -> Packet {
    assert_eq!(packets.len(), 1, "expected one response, got {:?}", packets);
    packets.remove(0)
}

/// Tests the backing store bounds-checks whole accesses before touching memory.
#[test]
fn test_backing_store_out_of_range() {
    let mut store = BackingStore::new(128, 0x5a);
    assert_eq!(store.read(64, 64).unwrap(), vec![0x5a; 64]);
    assert_eq!(
        store.read(100, 64),
        Err(DeviceError::OutOfRange {
            address: 100,
            length: 64,
            capacity: 128
        })
    );
    assert!(store.write(96, &[0; 64]).is_err());
    assert_eq!(store.read(96, 32).unwrap(), vec![0x5a; 32]);
    assert!(store.read(u64::MAX, 2).is_err());
}

/// Tests a Type-3 device serves reads from its fill pattern and echoes tags.
#[test]
fn test_expander_read_fill() {
    let mut dev = expander(0x1000);
    match single(serve_request(&mut dev, &tagged_read(7, 0x40))) {
        Packet::Mem(MemPacket::S2mDrs(drs)) => {
            assert_eq!(drs.tag, 7);
            assert!(!drs.poison);
            assert_eq!(drs.data, vec![0xab; 64]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Tests a Type-3 write is visible to a following read.
#[test]
fn test_expander_write_then_read() {
    let mut dev = expander(0x1000);
    let data: Vec<u8> = (0..64).collect();
    match single(serve_request(&mut dev, &MemPacket::mem_write(0x80, data.clone()).into())) {
        Packet::Mem(MemPacket::S2mNdr(ndr)) => {
            assert_eq!(ndr.op, NdrOp::Cmp);
            assert!(!ndr.poison);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(dev.handle_mem_read(0x80, 64).unwrap(), data);
}

/// Tests an out-of-range read comes back poisoned rather than dropped.
#[test]
fn test_expander_out_of_range_poisoned() {
    let mut dev = expander(0x1000);
    match single(serve_request(&mut dev, &tagged_read(3, 0x1000))) {
        Packet::Mem(MemPacket::S2mDrs(drs)) => {
            assert_eq!(drs.tag, 3);
            assert!(drs.poison);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Tests interleaved devices translate host addresses to dense device addresses.
#[test]
fn test_interleaved_translation() {
    let hdm = HdmDecoder::new(AddressRange::new(0, 0x2000), 256, vec![PortId(1), PortId(2)])
        .unwrap();
    let config = ConfigSpace::new(EMULATED_VENDOR_ID, 0x0d93, CLASS_CXL_MEMORY);
    let core = DeviceCore::new("mem1", DEV, config, 0x1000, 0)
        .with_decoders(vec![hdm.device_decoder(PortId(2)).unwrap()]);
    let mut dev = MemoryExpander::new(core);

    assert_eq!(dev.core().translate(0x300), Ok(0x100));
    assert_eq!(
        dev.core().translate(0x200),
        Err(DeviceError::Unmapped { address: 0x200 })
    );

    serve_request(&mut dev, &MemPacket::mem_write(0x340, vec![0x77; 64]).into());
    assert_eq!(dev.core().memory().read(0x140, 64).unwrap(), vec![0x77; 64]);
}

/// Tests identification registers are read-only and others honour byte enables.
#[test]
fn test_config_space_registers() {
    let mut cfg = ConfigSpace::new(EMULATED_VENDOR_ID, 0x0d93, CLASS_CXL_MEMORY);
    assert_eq!(cfg.read(REG_ID).unwrap(), 0x0d93_1e98);
    assert_eq!(cfg.read(REG_CLASS).unwrap(), CLASS_CXL_MEMORY << 8);

    cfg.write(REG_ID, 0xffff_ffff, 0xf).unwrap();
    assert_eq!(cfg.vendor_id(), EMULATED_VENDOR_ID);
    assert_eq!(cfg.device_id(), 0x0d93);

    cfg.write(0x10, 0xaabb_ccdd, 0b0011).unwrap();
    assert_eq!(cfg.read(0x10).unwrap(), 0x0000_ccdd);
    assert!(cfg.read(0x11).is_err());
    assert!(cfg.read(0x1000).is_err());
}

/// Tests configuration requests are completed only for the device's own BDF.
#[test]
fn test_cfg_request_completion() {
    let mut dev = expander(0x1000);

    let read = IoPacket::cfg_read(HOST, DEV, REG_ID);
    match single(serve_request(&mut dev, &read.clone().into())) {
        Packet::Io(cpl) => {
            assert_eq!(cpl.op, IoOp::CplD);
            assert_eq!(cpl.completer, DEV);
            assert_eq!(cpl.payload, 0x0d93_1e98u32.to_le_bytes().to_vec());
        }
        other => panic!("unexpected {:?}", other),
    }

    let wrong = IoPacket::cfg_read(HOST, Bdf::new(1, 2, 0), REG_ID);
    match single(serve_request(&mut dev, &wrong.into())) {
        Packet::Io(cpl) => {
            assert_eq!(cpl.op, IoOp::Cpl);
            assert_eq!(cpl.status, CplStatus::UnsupportedRequest);
        }
        other => panic!("unexpected {:?}", other),
    }

    let write = IoPacket::cfg_write(HOST, DEV, 0x20, 0x1234_5678);
    serve_request(&mut dev, &write.into());
    assert_eq!(dev.core().config().read(0x20).unwrap(), 0x1234_5678);
}

/// Tests MMIO registers are reachable only inside the window.
#[test]
fn test_mmio_window() {
    let config = ConfigSpace::new(EMULATED_VENDOR_ID, 0x0d94, CLASS_ACCELERATOR);
    let core = DeviceCore::new("accel0", DEV, config, 0x1000, 0)
        .with_mmio(AddressRange::new(0xf000_0000, 0x1000));
    let mut dev = Accelerator::new(core, DeviceKind::AcceleratorType2, 0, 1);

    let write = IoPacket::mem_write(HOST, 0xf000_0010, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    match single(serve_request(&mut dev, &write.into())) {
        Packet::Io(cpl) => assert_eq!(cpl.status, CplStatus::Success),
        other => panic!("unexpected {:?}", other),
    }
    let read = IoPacket::mem_read(HOST, 0xf000_0010, 2);
    match single(serve_request(&mut dev, &read.into())) {
        Packet::Io(cpl) => assert_eq!(cpl.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]),
        other => panic!("unexpected {:?}", other),
    }

    let outside = IoPacket::mem_read(HOST, 0xf000_0ffc, 2);
    match single(serve_request(&mut dev, &outside.into())) {
        Packet::Io(cpl) => assert_eq!(cpl.status, CplStatus::UnsupportedRequest),
        other => panic!("unexpected {:?}", other),
    }

    // A device without a window rejects MMIO.
    let mut plain = expander(0x1000);
    let read = IoPacket::mem_read(HOST, 0xf000_0000, 1);
    match single(serve_request(&mut plain, &read.into())) {
        Packet::Io(cpl) => assert_eq!(cpl.status, CplStatus::UnsupportedRequest),
        other => panic!("unexpected {:?}", other),
    }
}

/// Tests host-biased blocks reject device-local access.
#[test]
fn test_host_bias_blocks_device_access() {
    let mut acc = accelerator(DeviceKind::AcceleratorType2);
    assert_eq!(acc.bias(0x100), Bias::HostBias);
    assert_eq!(
        acc.device_read(0x100, 64),
        Err(DeviceError::BiasViolation {
            address: 0x100,
            bias: Bias::HostBias,
            access: AccessType::Device
        })
    );
    assert!(acc.handle_mem_read(0x100, 64).is_ok());
}

/// Tests a bias flip hands the block to the device and fences off the host.
#[test]
fn test_device_bias_flip() {
    let mut acc = accelerator(DeviceKind::AcceleratorType2);
    let request = acc.request_device_bias(0x100).unwrap();
    acc.handle_cache_snoop_response(&granted(request, CacheState::Exclusive, None))
        .unwrap();
    assert_eq!(acc.bias(0x100), Bias::DeviceBias);
    assert_eq!(acc.bias(0x140), Bias::HostBias);

    acc.device_write(0x100, &[0xcd; 64]).unwrap();
    assert_eq!(acc.device_read(0x100, 64).unwrap(), vec![0xcd; 64]);

    assert!(matches!(
        acc.handle_mem_read(0x100, 64),
        Err(DeviceError::BiasViolation {
            bias: Bias::DeviceBias,
            access: AccessType::Host,
            ..
        })
    ));

    // Over the wire the violation becomes poison, and nothing is written.
    match single(serve_request(&mut acc, &tagged_read(5, 0x100))) {
        Packet::Mem(MemPacket::S2mDrs(drs)) => assert!(drs.poison),
        other => panic!("unexpected {:?}", other),
    }
    match single(serve_request(&mut acc, &MemPacket::mem_write(0x100, vec![0; 64]).into())) {
        Packet::Mem(MemPacket::S2mNdr(ndr)) => assert!(ndr.poison),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(acc.device_read(0x100, 64).unwrap(), vec![0xcd; 64]);

    let release = acc.release_device_bias(0x100).unwrap();
    acc.handle_cache_snoop_response(&granted(release, CacheState::Invalid, None))
        .unwrap();
    assert_eq!(acc.bias(0x100), Bias::HostBias);
    assert_eq!(acc.handle_mem_read(0x100, 64).unwrap(), vec![0xcd; 64]);
}

/// Tests an access far beyond capacity fails its range check at once.
#[test]
fn test_oversized_access_rejected() {
    let mut acc = accelerator(DeviceKind::AcceleratorType2);
    let started = Instant::now();
    assert!(matches!(
        acc.handle_mem_read(0, 1 << 33),
        Err(DeviceError::OutOfRange {
            capacity: 0x1000,
            ..
        })
    ));
    assert!(matches!(
        acc.handle_mem_write(0x40, &[0; 0x2000]),
        Err(DeviceError::OutOfRange { .. })
    ));
    assert!(matches!(
        acc.device_read(0x40, usize::MAX),
        Err(DeviceError::OutOfRange { .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(100));
}

/// Tests a span mixing host and device blocks reports the first offending byte.
#[test]
fn test_bias_violation_in_mixed_span() {
    let mut acc = accelerator(DeviceKind::AcceleratorType2);
    let request = acc.request_device_bias(0x100).unwrap();
    acc.handle_cache_snoop_response(&granted(request, CacheState::Exclusive, None))
        .unwrap();

    // Host read of 0x80..0x180 hits the device block at 0x100.
    assert_eq!(
        acc.handle_mem_read(0x80, 0x100),
        Err(DeviceError::BiasViolation {
            address: 0x100,
            bias: Bias::DeviceBias,
            access: AccessType::Host
        })
    );
    // Device read of 0x100..0x180 runs into the host block at 0x140.
    assert_eq!(
        acc.device_read(0x100, 0x80),
        Err(DeviceError::BiasViolation {
            address: 0x140,
            bias: Bias::HostBias,
            access: AccessType::Device
        })
    );
    // Starting mid-block reports the start address.
    assert_eq!(
        acc.device_read(0xe0, 0x40),
        Err(DeviceError::BiasViolation {
            address: 0xe0,
            bias: Bias::HostBias,
            access: AccessType::Device
        })
    );
    assert_eq!(acc.device_read(0x110, 0x30).unwrap(), vec![0; 0x30]);
}

/// Tests a Type-1 device has no host-managed memory.
#[test]
fn test_type1_has_no_memory() {
    let mut acc = accelerator(DeviceKind::AcceleratorType1);
    assert!(matches!(
        acc.request_device_bias(0x0),
        Err(DeviceError::Unsupported(_))
    ));
    assert!(matches!(
        acc.handle_mem_read(0x0, 64),
        Err(DeviceError::Unsupported(_))
    ));
    assert!(acc.back_invalidate(0x0).is_err());
}

/// Tests the MESI snoop table of the device cache.
#[test]
fn test_cache_snoop_transitions() {
    let mut cache = DeviceCache::new(8);
    let miss = cache.snoop(H2dReqOp::SnpData, 0x0);
    assert_eq!(miss.response, D2hRspOp::RspIHitI);

    cache.install(0x40, LineState::Modified, vec![1; 64]);
    let r = cache.snoop(H2dReqOp::SnpCur, 0x40);
    assert_eq!(r.response, D2hRspOp::RspVFwdV);
    assert_eq!(cache.state(0x40), LineState::Modified);

    let r = cache.snoop(H2dReqOp::SnpData, 0x40);
    assert_eq!(r.response, D2hRspOp::RspSFwdM);
    assert_eq!(r.forward, Some(vec![1; 64]));
    assert_eq!(cache.state(0x40), LineState::Shared);

    let r = cache.snoop(H2dReqOp::SnpInv, 0x40);
    assert_eq!(r.response, D2hRspOp::RspIHitSE);
    assert!(r.forward.is_none());
    assert_eq!(cache.state(0x40), LineState::Invalid);

    cache.install(0x80, LineState::Exclusive, vec![2; 64]);
    let r = cache.snoop(H2dReqOp::SnpCur, 0x80);
    assert_eq!(r.response, D2hRspOp::RspVHitV);
    assert_eq!(cache.state(0x80), LineState::Exclusive);

    cache.write(0x80, 0, &[9]).unwrap();
    let r = cache.snoop(H2dReqOp::SnpInv, 0x80);
    assert_eq!(r.response, D2hRspOp::RspIFwdM);
    assert_eq!(r.forward.map(|d| d[0]), Some(9));
    assert!(cache.is_empty());
}

/// Tests a full cache evicts and reports dirty victims.
#[test]
fn test_cache_eviction() {
    let mut cache = DeviceCache::new(2);
    assert!(cache.install(0x0, LineState::Modified, vec![1; 64]).is_none());
    assert!(cache.install(0x40, LineState::Shared, vec![2; 64]).is_none());
    let victim = cache.install(0x80, LineState::Exclusive, vec![3; 64]);
    assert_eq!(victim, Some((0x0, vec![1; 64])));
    assert_eq!(cache.len(), 2);

    assert!(cache.write(0x40, 0, &[0]).is_err());
    assert!(cache.write(0x80, 60, &[0; 8]).is_err());
}

/// Tests an accelerator caches granted lines and answers snoops on the wire.
#[test]
fn test_accelerator_snoop_over_wire() {
    let mut acc = accelerator(DeviceKind::AcceleratorType1);
    let request = acc.read_host_line(0x2000, true);
    acc.handle_cache_snoop_response(&granted(request, CacheState::Exclusive, Some(vec![4; 64])))
        .unwrap();
    assert_eq!(acc.line_state(0x2000), LineState::Exclusive);
    assert_eq!(acc.cached_line(0x2010), Some(&[4u8; 64][..]));

    acc.write_cached(0x2000, 0, &[5; 4]).unwrap();
    let snoop: Packet = CachePacket::H2dReq(H2dReq {
        op: H2dReqOp::SnpData,
        uqid: 12,
        cache_id: 0,
        address: 0x2000,
    })
    .into();
    let out = serve_request(&mut acc, &snoop);
    assert_eq!(out.len(), 2);
    match (&out[0], &out[1]) {
        (Packet::Cache(CachePacket::D2hRsp(rsp)), Packet::Cache(CachePacket::D2hData(data))) => {
            assert_eq!(rsp.op, D2hRspOp::RspSFwdM);
            assert_eq!(rsp.uqid, 12);
            assert_eq!(data.uqid, 12);
            assert_eq!(&data.data[..4], &[5; 4]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(acc.line_state(0x2000), LineState::Shared);
}

/// Tests a Type-3 device answers snoops with a miss.
#[test]
fn test_expander_snoop_miss() {
    let mut dev = expander(0x1000);
    let snoop: Packet = CachePacket::h2d_snoop(H2dReqOp::SnpInv, 0, 0x0).into();
    match single(serve_request(&mut dev, &snoop)) {
        Packet::Cache(CachePacket::D2hRsp(rsp)) => assert_eq!(rsp.op, D2hRspOp::RspIHitI),
        other => panic!("unexpected {:?}", other),
    }
}
