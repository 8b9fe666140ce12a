//! Integration tests for the packet codec.

use cxl_fabric::codec::cache::{
    CachePacket, CacheState, D2hData, D2hReqOp, D2hRsp, D2hRspOp, H2dReqOp, H2dRsp, H2dRspOp,
};
use cxl_fabric::codec::io::{CplStatus, IoOp, IoPacket};
use cxl_fabric::codec::mem::{
    BiRspOp, BiSnpOp, M2sBiRsp, M2sReq, M2sReqOp, MemPacket, NdrOp, S2mBiSnp, SnpType,
};
use cxl_fabric::codec::{decode, encode, Packet, ENVELOPE_LEN};
use cxl_fabric::common::{Bdf, FormatError, ProtocolKind};

fn host() -> Bdf {
    Bdf::new(0, 0, 0)
}

fn roundtrip(packet: Packet) {
    let bytes = encode(&packet).expect("encode");
    assert_eq!(bytes.len(), packet.encoded_len());
    assert_eq!(decode(&bytes).expect("decode"), packet);
}

/// Tests the envelope carries the protocol nibble and the total length.
#[test]
fn test_envelope_layout() {
    let packet = Packet::Io(IoPacket::mem_read(host(), 0x1000, 1));
    let bytes = packet.encode().unwrap();

    assert_eq!(bytes[0] >> 4, ProtocolKind::Io as u8);
    let declared = (((bytes[0] & 0x0f) as usize) << 8) | bytes[1] as usize;
    assert_eq!(declared, bytes.len());
    assert_eq!(bytes.len(), ENVELOPE_LEN + 18);
}

/// Tests CXL.io requests and completions survive encoding.
#[test]
fn test_io_roundtrip() {
    let dev = Bdf::new(1, 0, 0);
    let read = IoPacket::mem_read(host(), 0xf000_0010, 2);
    roundtrip(read.clone().into());
    roundtrip(IoPacket::mem_write(host(), 0xf000_0000, vec![1, 2, 3, 4, 5, 6, 7, 8]).into());
    roundtrip(IoPacket::cfg_read(host(), dev, 0x08).into());
    roundtrip(IoPacket::cfg_write(host(), dev, 0x10, 0xdead_beef).into());
    roundtrip(IoPacket::completion(&read, dev, CplStatus::UnsupportedRequest).into());
    roundtrip(IoPacket::completion_with_data(&read, dev, vec![0xaa; 8]).into());
}

/// Tests CXL.mem messages on every channel survive encoding.
#[test]
fn test_mem_roundtrip() {
    roundtrip(MemPacket::mem_read(0x1000).into());
    roundtrip(MemPacket::mem_write(0x2040, (0..64).collect()).into());
    roundtrip(MemPacket::data_response(7, 2, vec![0xab; 64], true).into());
    roundtrip(MemPacket::completion(NdrOp::CmpE, 0xffff, 15, false).into());
    roundtrip(
        MemPacket::M2sReq(M2sReq {
            op: M2sReqOp::MemInv,
            snp_type: SnpType::SnpInv,
            meta_field: 1,
            meta_value: 2,
            tag: 0x1234,
            address: 0xf_ffff_ffc0,
            ld_id: 3,
        })
        .into(),
    );
    roundtrip(
        MemPacket::M2sBiRsp(M2sBiRsp {
            op: BiRspOp::BiRspS,
            bi_id: 0xabc,
            bi_tag: 0x123,
        })
        .into(),
    );
    roundtrip(
        MemPacket::S2mBiSnp(S2mBiSnp {
            op: BiSnpOp::BiSnpData,
            bi_id: 4,
            bi_tag: 9,
            address: 0x4000,
        })
        .into(),
    );
}

/// Tests CXL.cache messages on every channel survive encoding.
#[test]
fn test_cache_roundtrip() {
    roundtrip(CachePacket::d2h_request(D2hReqOp::RdOwn, 3, 0x8000).into());
    roundtrip(CachePacket::d2h_request(D2hReqOp::CacheFlushed, 15, 0).into());
    roundtrip(CachePacket::h2d_snoop(H2dReqOp::SnpCur, 1, 0x40).into());
    roundtrip(
        CachePacket::D2hRsp(D2hRsp {
            op: D2hRspOp::RspVFwdV,
            uqid: 0xfff,
            cache_id: 2,
        })
        .into(),
    );
    roundtrip(
        CachePacket::D2hData(D2hData {
            bogus: true,
            poison: false,
            uqid: 5,
            cache_id: 2,
            data: vec![0x5a; 64],
        })
        .into(),
    );
    roundtrip(
        CachePacket::H2dRsp(H2dRsp {
            op: H2dRspOp::Go,
            state: CacheState::Exclusive,
            cqid: 17,
            cache_id: 1,
        })
        .into(),
    );
}

/// Tests decoding rejects a buffer shorter than the envelope.
#[test]
fn test_decode_truncated_envelope() {
    assert!(matches!(decode(&[0x10]), Err(FormatError::Truncated { .. })));
}

/// Tests decoding rejects a packet whose declared length exceeds the buffer.
#[test]
fn test_decode_truncated_body() {
    let bytes = Packet::from(MemPacket::mem_read(0x1000)).encode().unwrap();
    let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(matches!(err, FormatError::Truncated { .. }));
}

/// Tests decoding rejects an unknown protocol nibble.
#[test]
fn test_decode_unknown_protocol() {
    let mut bytes = Packet::from(MemPacket::mem_read(0x1000)).encode().unwrap();
    bytes[0] = (bytes[0] & 0x0f) | 0x70;
    assert_eq!(decode(&bytes), Err(FormatError::UnknownProtocol(7)));
}

/// Tests decoding rejects an unknown opcode.
#[test]
fn test_decode_unknown_opcode() {
    let mut bytes = Packet::from(IoPacket::mem_read(host(), 0x1000, 1))
        .encode()
        .unwrap();
    bytes[ENVELOPE_LEN] = 0x7f;
    assert!(matches!(
        decode(&bytes),
        Err(FormatError::UnknownOpcode {
            protocol: ProtocolKind::Io,
            ..
        })
    ));
}

/// Tests decoding rejects trailing bytes after a packet.
#[test]
fn test_decode_trailing_bytes() {
    let mut bytes = Packet::from(MemPacket::mem_read(0x1000)).encode().unwrap();
    bytes.push(0);
    assert!(matches!(decode(&bytes), Err(FormatError::LengthMismatch { .. })));
}

/// Tests encoding rejects a field wider than its declared width.
#[test]
fn test_encode_field_overflow() {
    let mut read = IoPacket::mem_read(host(), 0x1000, 1);
    read.tag = 0x400;
    let err = Packet::Io(read).encode().unwrap_err();
    assert!(matches!(err, FormatError::FieldOverflow { field: "tag", width: 10, .. }));
}

/// Tests line-addressed messages reject unaligned addresses.
#[test]
fn test_encode_misaligned_line() {
    let err = Packet::from(MemPacket::mem_read(0x1001)).encode().unwrap_err();
    assert_eq!(
        err,
        FormatError::Misaligned {
            address: 0x1001,
            alignment: 64
        }
    );
}

/// Tests a data line of the wrong size is rejected.
#[test]
fn test_encode_short_line() {
    let err = Packet::from(MemPacket::mem_write(0x1000, vec![0; 32]))
        .encode()
        .unwrap_err();
    assert!(matches!(err, FormatError::LengthMismatch { declared: 64, actual: 32 }));
}

/// Tests a CXL.io payload must match its dword length.
#[test]
fn test_io_payload_length_checked() {
    let mut write = IoPacket::mem_write(host(), 0x1000, vec![0; 8]);
    write.length_dw = 3;
    assert!(Packet::Io(write).encode().is_err());
}

/// Tests non-zero reserved bits are rejected on decode.
#[test]
fn test_decode_reserved_non_zero() {
    let mut bytes = Packet::from(IoPacket::mem_read(host(), 0x1000, 1))
        .encode()
        .unwrap();
    // The 6 reserved bits follow the fmt/type byte.
    bytes[ENVELOPE_LEN + 1] |= 0x80;
    assert!(matches!(decode(&bytes), Err(FormatError::ReservedNonZero { .. })));
}

/// Tests opcode helpers used by the transaction engine.
#[test]
fn test_opcode_properties() {
    assert!(IoOp::CplD.carries_data());
    assert!(IoOp::Cpl.is_completion());
    assert!(!IoOp::CfgRd.carries_data());
    assert!(D2hReqOp::RdOwn.expects_data());
    assert!(D2hReqOp::RdOwn.expects_go());
    assert!(!D2hReqOp::RdCurr.expects_go());
    assert!(!D2hReqOp::RdOwnNoData.expects_data());
    assert!(D2hRspOp::RspIFwdM.forwards_data());
    assert!(!D2hRspOp::RspIHitSE.forwards_data());
}
