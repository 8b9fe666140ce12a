//! Integration tests for codec and flit packing over generated inputs.

use proptest::prelude::*;

use cxl_fabric::codec::cache::{
    CachePacket, CacheState, D2hData, D2hReq, D2hReqOp, D2hRsp, D2hRspOp, H2dData, H2dReq,
    H2dReqOp, H2dRsp, H2dRspOp,
};
use cxl_fabric::codec::io::IoPacket;
use cxl_fabric::codec::mem::{BiSnpOp, M2sReq, M2sReqOp, MemPacket, NdrOp, S2mBiSnp, SnpType};
use cxl_fabric::codec::{decode, encode, pack, unpack, Flit, Packet};
use cxl_fabric::common::{Bdf, CACHE_LINE_SIZE};

fn arb_line_address() -> impl Strategy<Value = u64> {
    (0u64..(1 << 46)).prop_map(|line| line << 6)
}

fn arb_line() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), CACHE_LINE_SIZE)
}

fn arb_mem() -> impl Strategy<Value = MemPacket> {
    let req_op = prop_oneof![
        Just(M2sReqOp::MemInv),
        Just(M2sReqOp::MemRd),
        Just(M2sReqOp::MemRdData),
        Just(M2sReqOp::MemSpecRd),
    ];
    let snp = prop_oneof![
        Just(SnpType::NoOp),
        Just(SnpType::SnpData),
        Just(SnpType::SnpCur),
        Just(SnpType::SnpInv),
    ];
    let ndr = prop_oneof![
        Just(NdrOp::Cmp),
        Just(NdrOp::CmpS),
        Just(NdrOp::CmpE),
        Just(NdrOp::CmpM),
        Just(NdrOp::BiConflictAck),
    ];
    let bisnp = prop_oneof![
        Just(BiSnpOp::BiSnpCur),
        Just(BiSnpOp::BiSnpData),
        Just(BiSnpOp::BiSnpInv),
    ];
    prop_oneof![
        (req_op, snp, 0u8..4, 0u8..4, any::<u16>(), arb_line_address(), 0u8..16).prop_map(
            |(op, snp_type, meta_field, meta_value, tag, address, ld_id)| {
                MemPacket::M2sReq(M2sReq {
                    op,
                    snp_type,
                    meta_field,
                    meta_value,
                    tag,
                    address,
                    ld_id,
                })
            }
        ),
        (arb_line_address(), arb_line())
            .prop_map(|(address, data)| MemPacket::mem_write(address, data)),
        (any::<u16>(), 0u8..16, arb_line(), any::<bool>()).prop_map(
            |(tag, ld_id, data, poison)| MemPacket::data_response(tag, ld_id, data, poison)
        ),
        (ndr, any::<u16>(), 0u8..16, any::<bool>()).prop_map(|(op, tag, ld_id, poison)| {
            MemPacket::completion(op, tag, ld_id, poison)
        }),
        (bisnp, 0u16..4096, 0u16..4096, arb_line_address()).prop_map(
            |(op, bi_id, bi_tag, address)| {
                MemPacket::S2mBiSnp(S2mBiSnp {
                    op,
                    bi_id,
                    bi_tag,
                    address,
                })
            }
        ),
    ]
}

fn arb_cache() -> impl Strategy<Value = CachePacket> {
    let d2h_op = prop_oneof![
        Just(D2hReqOp::RdCurr),
        Just(D2hReqOp::RdOwn),
        Just(D2hReqOp::RdShared),
        Just(D2hReqOp::ItoMWr),
        Just(D2hReqOp::DirtyEvict),
        Just(D2hReqOp::CacheFlushed),
    ];
    let rsp_op = prop_oneof![
        Just(D2hRspOp::RspIHitI),
        Just(D2hRspOp::RspVHitV),
        Just(D2hRspOp::RspSHitSE),
        Just(D2hRspOp::RspIFwdM),
    ];
    let snoop = prop_oneof![
        Just(H2dReqOp::SnpData),
        Just(H2dReqOp::SnpInv),
        Just(H2dReqOp::SnpCur),
    ];
    let go = prop_oneof![
        (Just(H2dRspOp::Go), Just(CacheState::Exclusive)),
        (Just(H2dRspOp::Go), Just(CacheState::Shared)),
        (Just(H2dRspOp::GoWritePull), Just(CacheState::Invalid)),
        (Just(H2dRspOp::GoErr), Just(CacheState::Error)),
    ];
    prop_oneof![
        (d2h_op, any::<bool>(), 0u16..4096, 0u8..16, arb_line_address()).prop_map(
            |(op, non_temporal, cqid, cache_id, address)| {
                CachePacket::D2hReq(D2hReq {
                    op,
                    non_temporal,
                    cqid,
                    cache_id,
                    address,
                })
            }
        ),
        (rsp_op, 0u16..4096, 0u8..16).prop_map(|(op, uqid, cache_id)| {
            CachePacket::D2hRsp(D2hRsp { op, uqid, cache_id })
        }),
        (any::<(bool, bool)>(), 0u16..4096, 0u8..16, arb_line()).prop_map(
            |((bogus, poison), uqid, cache_id, data)| {
                CachePacket::D2hData(D2hData {
                    bogus,
                    poison,
                    uqid,
                    cache_id,
                    data,
                })
            }
        ),
        (snoop, 0u16..4096, 0u8..16, arb_line_address()).prop_map(
            |(op, uqid, cache_id, address)| {
                CachePacket::H2dReq(H2dReq {
                    op,
                    uqid,
                    cache_id,
                    address,
                })
            }
        ),
        (go, 0u16..4096, 0u8..16).prop_map(|((op, state), cqid, cache_id)| {
            CachePacket::H2dRsp(H2dRsp {
                op,
                state,
                cqid,
                cache_id,
            })
        }),
        (any::<(bool, bool)>(), 0u16..4096, 0u8..16, arb_line()).prop_map(
            |((go_err, poison), cqid, cache_id, data)| {
                CachePacket::H2dData(H2dData {
                    go_err,
                    poison,
                    cqid,
                    cache_id,
                    data,
                })
            }
        ),
    ]
}

fn arb_io() -> impl Strategy<Value = IoPacket> {
    let requester = any::<u16>().prop_map(Bdf::from_u16);
    prop_oneof![
        (requester.clone(), any::<u32>(), 1u16..=16).prop_map(|(bdf, dword, len)| {
            IoPacket::mem_read(bdf, dword as u64 * 4, len)
        }),
        (requester.clone(), any::<u32>(), 1usize..=16).prop_flat_map(|(bdf, dword, len)| {
            prop::collection::vec(any::<u8>(), len * 4).prop_map(move |data| {
                IoPacket::mem_write(bdf, dword as u64 * 4, data)
            })
        }),
        (requester.clone(), any::<u16>(), 0u16..1024).prop_map(|(bdf, target, register)| {
            IoPacket::cfg_read(bdf, Bdf::from_u16(target), register * 4)
        }),
        (requester, any::<u16>(), 0u16..1024, any::<u32>()).prop_map(
            |(bdf, target, register, value)| {
                IoPacket::cfg_write(bdf, Bdf::from_u16(target), register * 4, value)
            }
        ),
    ]
}

fn arb_packet() -> impl Strategy<Value = Packet> {
    prop_oneof![
        arb_mem().prop_map(Packet::Mem),
        arb_cache().prop_map(Packet::Cache),
        arb_io().prop_map(Packet::Io),
    ]
}

proptest! {
    /// Tests any well-formed packet decodes back to itself.
    #[test]
    fn test_packet_roundtrip(packet in arb_packet()) {
        let bytes = encode(&packet).unwrap();
        prop_assert_eq!(bytes.len(), packet.encoded_len());
        prop_assert_eq!(decode(&bytes).unwrap(), packet);
    }

    /// Tests draining a queue into flits yields the same packets in order.
    #[test]
    fn test_pack_unpack_preserves_sequence(
        capacity in prop_oneof![Just(128usize), Just(256usize), Just(1024usize)],
        queued in prop::collection::vec(arb_packet(), 0..40),
    ) {
        let mut rest = queued.clone();
        let mut seen = Vec::new();
        while !rest.is_empty() {
            let (flit, left) = pack(capacity, rest).unwrap();
            prop_assert!(!flit.packets().is_empty());
            let bytes = flit.encode().unwrap();
            prop_assert_eq!(bytes.len(), capacity);
            seen.extend(unpack(&Flit::decode(&bytes).unwrap()));
            rest = left;
        }
        prop_assert_eq!(seen, queued);
    }
}
