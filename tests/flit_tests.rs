//! Integration tests for flit packing and transport framing.

use cxl_fabric::codec::cache::{CachePacket, D2hRsp, D2hRspOp};
use cxl_fabric::codec::flit::{FLIT_HEADER_LEN, MAX_SLOTS};
use cxl_fabric::codec::frame::{decode_frame_len, encode_frame};
use cxl_fabric::codec::mem::MemPacket;
use cxl_fabric::codec::{pack, unpack, ControlMessage, Flit, FlitBody, Packet};
use cxl_fabric::common::FormatError;

fn reads(n: u64) -> Vec<Packet> {
    (0..n).map(|i| MemPacket::mem_read(i * 64).into()).collect()
}

/// Tests packing keeps arrival order and never splits a packet.
#[test]
fn test_pack_preserves_order() {
    // 4-byte header + 4 x 13-byte reads fills 56 of 64 bytes.
    let queued = reads(6);
    let (flit, rest) = pack(64, queued.clone()).unwrap();

    assert_eq!(flit.packets(), &queued[..4]);
    assert_eq!(rest, &queued[4..]);

    let bytes = flit.encode().unwrap();
    assert_eq!(bytes.len(), 64);
    assert_eq!(bytes[1], 4);
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0b1111);

    let decoded = Flit::decode(&bytes).unwrap();
    assert_eq!(unpack(&decoded), queued[..4].to_vec());
}

/// Tests successive flits drain a queue without loss or reordering.
#[test]
fn test_pack_drains_queue() {
    let queued = reads(10);
    let mut rest = queued.clone();
    let mut seen = Vec::new();
    while !rest.is_empty() {
        let (flit, left) = pack(64, rest).unwrap();
        assert!(!flit.packets().is_empty());
        seen.extend(unpack(&Flit::decode(&flit.encode().unwrap()).unwrap()));
        rest = left;
    }
    assert_eq!(seen, queued);
}

/// Tests a flit never carries more than the slot limit.
#[test]
fn test_pack_slot_limit() {
    let small: Vec<Packet> = (0..20)
        .map(|i| {
            CachePacket::D2hRsp(D2hRsp {
                op: D2hRspOp::RspIHitI,
                uqid: i,
                cache_id: 0,
            })
            .into()
        })
        .collect();
    let (flit, rest) = pack(4096, small).unwrap();
    assert_eq!(flit.packets().len(), MAX_SLOTS);
    assert_eq!(rest.len(), 4);
}

/// Tests a packet larger than an empty flit is rejected.
#[test]
fn test_pack_packet_too_large() {
    let write: Packet = MemPacket::mem_write(0, vec![0; 64]).into();
    let err = pack(64, vec![write]).unwrap_err();
    assert!(matches!(err, FormatError::PacketTooLarge { size: 77, capacity: 64 }));
}

/// Tests control flits survive encoding.
#[test]
fn test_control_flit_roundtrip() {
    for msg in [
        ControlMessage::ConnectRequest { port: 3 },
        ControlMessage::ConnectAccept,
        ControlMessage::ConnectReject,
        ControlMessage::Disconnect,
    ] {
        let bytes = Flit::control(128, msg).encode().unwrap();
        assert_eq!(bytes.len(), 128);
        let flit = Flit::decode(&bytes).unwrap();
        assert_eq!(flit.control_message(), Some(msg));
        assert!(flit.packets().is_empty());
    }
}

/// Tests non-zero padding is rejected.
#[test]
fn test_decode_non_zero_padding() {
    let (flit, _) = pack(64, reads(1)).unwrap();
    let mut bytes = flit.encode().unwrap();
    bytes[63] = 1;
    assert_eq!(
        Flit::decode(&bytes),
        Err(FormatError::NonZeroPadding { offset: 63 })
    );
}

/// Tests a valid mask that disagrees with the slot count is rejected.
#[test]
fn test_decode_bad_slot_mask() {
    let (flit, _) = pack(64, reads(2)).unwrap();
    let mut bytes = flit.encode().unwrap();
    bytes[3] = 0b01;
    assert!(matches!(
        Flit::decode(&bytes),
        Err(FormatError::SlotMask { mask: 1, count: 2 })
    ));
}

/// Tests an unknown flit kind is rejected.
#[test]
fn test_decode_unknown_kind() {
    let mut bytes = vec![0u8; 64];
    bytes[0] = 0x70;
    assert_eq!(Flit::decode(&bytes), Err(FormatError::UnknownFlitKind(7)));
}

/// Tests an empty data flit is legal.
#[test]
fn test_empty_data_flit() {
    let (flit, rest) = pack(64, Vec::new()).unwrap();
    assert!(rest.is_empty());
    let decoded = Flit::decode(&flit.encode().unwrap()).unwrap();
    assert_eq!(decoded.body(), &FlitBody::Packets(Vec::new()));
}

/// Tests frame length prefixes are bounded by the header and the capacity.
#[test]
fn test_frame_length_bounds() {
    let frame = encode_frame(&[0xaa; 64]);
    assert_eq!(&frame[..4], &[0, 0, 0, 64]);
    assert_eq!(frame.len(), 68);

    assert_eq!(decode_frame_len([0, 0, 0, 64], 64), Ok(64));
    assert_eq!(
        decode_frame_len([0, 0, 0, FLIT_HEADER_LEN as u8], 64),
        Ok(FLIT_HEADER_LEN)
    );
    assert!(matches!(
        decode_frame_len([0, 0, 0, 3], 64),
        Err(FormatError::FrameLength { length: 3, .. })
    ));
    assert!(matches!(
        decode_frame_len([0, 0, 0, 65], 64),
        Err(FormatError::FrameLength { length: 65, .. })
    ));
    assert!(decode_frame_len([0xff, 0, 0, 0], 4096).is_err());
}
