//! Property tests over whole exchanges

use std::time::Instant;

use bytes::Bytes;
use proptest::prelude::*;
use rdm_core::seqnum::MsgId;
use rdm_core::sim::{SimProvider, Side, ADDR_A, ADDR_B};
use rdm_core::wire::{DataFlags, DataPacket, PacketType};
use rdm_core::{Endpoint, OpFlags};

use crate::harness::{data_for, pattern, test_config, TestPair};

fn numbered(msg_id: u32) -> DataPacket {
    let payload = Bytes::from(msg_id.to_le_bytes().to_vec());
    DataPacket {
        kind: PacketType::Eager,
        flags: DataFlags::empty(),
        msg_id: MsgId(msg_id),
        sender_op: u64::from(msg_id),
        tag: 0,
        total_len: payload.len() as u64,
        eager_len: payload.len() as u64,
        seg_offset: 0,
        read: None,
        payload,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_any_sizes_arrive_in_order(
        sizes in prop::collection::vec(0usize..12_000, 1..8),
        reverse in any::<bool>(),
        rnr in 0usize..4,
    ) {
        let mut pair = TestPair::new();
        pair.lo.set_reverse_batches(reverse);
        pair.lo.inject_rnr(Side::B, rnr);
        let recvs: Vec<_> = sizes.iter().map(|len| pair.recv(*len).unwrap()).collect();
        for (i, len) in sizes.iter().enumerate() {
            pair.send(pattern(*len, i as u8), OpFlags::empty()).unwrap();
        }
        let ev = pair.settle();
        for (i, (r, len)) in recvs.iter().zip(&sizes).enumerate() {
            prop_assert_eq!(data_for(&ev.b, *r), Some(pattern(*len, i as u8)));
        }
        prop_assert_eq!(pair.lo.a.live_ops(), 0);
        prop_assert_eq!(pair.lo.a.pool_stats().in_use, 0);
    }

    #[test]
    fn test_any_arrival_order_delivers_in_sequence(
        order in Just((0u32..32).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut ep = Endpoint::new(test_config(), SimProvider::with_addr(ADDR_B)).unwrap();
        let peer = ep.insert_peer(ADDR_A).unwrap();
        let recvs: Vec<_> = (0..32)
            .map(|_| ep.post_recv(Some(peer), 4, None, OpFlags::empty()).unwrap())
            .collect();
        for msg_id in &order {
            ep.on_packet_received(peer, numbered(*msg_id)).unwrap();
        }
        let events = ep.progress(Instant::now());
        for (i, r) in recvs.iter().enumerate() {
            let expected = Bytes::from((i as u32).to_le_bytes().to_vec());
            prop_assert_eq!(data_for(&events, *r), Some(expected));
        }
        prop_assert_eq!(ep.metrics_snapshot().duplicates, 0);
    }
}
