//! End-to-end scenarios over a simulated loopback

use bytes::Bytes;
use rdm_core::op::{AtomicOp, MemoryKind, OpState, RemoteIov};
use rdm_core::sim::AccessFlags;
use rdm_core::{
    CompletionEvent, EndpointConfig, ErrorReason, HandshakeState, IoBuf, OpFlags, OpKind, PeekResult,
    ProtocolError, TagMatch,
};

use crate::harness::{data_for, event_for, pattern, test_config, TestPair};

#[test]
fn test_handshake_completes_and_dc_send_finishes() {
    let mut pair = TestPair::new();
    let r = pair.recv(64).unwrap();
    let s = pair.send(pattern(64, 1), OpFlags::DELIVERY_COMPLETE).unwrap();
    assert_eq!(pair.lo.a.op_state(s), Some(OpState::Queued));

    let ev = pair.settle();
    assert_eq!(
        pair.lo.a.handshake_state(pair.lo.a_to_b),
        Some(HandshakeState::Completed)
    );
    assert_eq!(
        pair.lo.b.handshake_state(pair.lo.b_to_a),
        Some(HandshakeState::Completed)
    );
    assert!(event_for(&ev.a, s).unwrap().is_success());
    assert_eq!(data_for(&ev.b, r), Some(pattern(64, 1)));
    assert_eq!(pair.lo.a.metrics_snapshot().handshakes_completed, 1);
    assert_eq!(pair.lo.b.metrics_snapshot().handshakes_completed, 1);
}

#[test]
fn test_queued_sends_release_in_post_order() {
    let mut pair = TestPair::new();
    let recvs: Vec<_> = (0..3).map(|_| pair.recv(128).unwrap()).collect();
    for seed in 0..3 {
        pair.send(pattern(128, seed), OpFlags::DELIVERY_COMPLETE).unwrap();
    }
    assert_eq!(pair.lo.a.queue_len(pair.lo.a_to_b), Some(3));

    let ev = pair.settle();
    for (seed, r) in recvs.iter().enumerate() {
        assert_eq!(data_for(&ev.b, *r), Some(pattern(128, seed as u8)));
    }
    assert_eq!(ev.a.iter().filter(|e| e.is_success()).count(), 3);
}

#[test]
fn test_queue_bound_accepts_exactly_the_limit() {
    let config = EndpointConfig {
        queue_limit_per_peer: 2,
        ..test_config()
    };
    let mut pair = TestPair::with_configs(config, test_config());
    pair.send(pattern(8, 0), OpFlags::DELIVERY_COMPLETE).unwrap();
    pair.send(pattern(8, 1), OpFlags::DELIVERY_COMPLETE).unwrap();
    let err = pair.send(pattern(8, 2), OpFlags::DELIVERY_COMPLETE).unwrap_err();
    assert!(matches!(err, ProtocolError::QueueFull { limit: 2, .. }));

    pair.recv(8).unwrap();
    pair.recv(8).unwrap();
    pair.settle();
    assert!(pair.send(pattern(8, 2), OpFlags::DELIVERY_COMPLETE).is_ok());
}

#[test]
fn test_every_protocol_delivers_intact_data() {
    // eager, medium, runt read
    for (seed, len) in [(1u8, 10usize), (2, 3000), (3, 10_000)] {
        let mut pair = TestPair::new();
        let r = pair.recv(len).unwrap();
        let s = pair.send(pattern(len, seed), OpFlags::empty()).unwrap();
        let ev = pair.settle();
        assert_eq!(data_for(&ev.b, r), Some(pattern(len, seed)), "len {len}");
        assert!(event_for(&ev.a, s).unwrap().is_success(), "len {len}");
        assert_eq!(pair.lo.a.provider().region_count(), 0);
        assert_eq!(pair.lo.a.pool_stats().in_use, 0);
        assert_eq!(pair.lo.b.pool_stats().in_use, 0);
    }
}

#[test]
fn test_long_read_without_runt_budget() {
    let mut config = test_config();
    config.runt.host_ceiling = 0;
    let mut pair = TestPair::with_configs(config, test_config());
    let r = pair.recv(50_000).unwrap();
    let s = pair.send(pattern(50_000, 5), OpFlags::empty()).unwrap();
    let ev = pair.settle();
    assert_eq!(data_for(&ev.b, r), Some(pattern(50_000, 5)));
    assert!(event_for(&ev.a, s).unwrap().is_success());
    assert_eq!(pair.lo.a.provider().stats().sends_posted, 2);
    assert_eq!(pair.lo.b.provider().stats().rma_posted, 1);
}

#[test]
fn test_tagged_receive_with_ignore_bits() {
    let mut pair = TestPair::new();
    let untagged = pair.recv(64).unwrap();
    let tagged = pair
        .recv_tagged(
            64,
            TagMatch {
                tag: 0x4200,
                ignore: 0xFF,
            },
        )
        .unwrap();
    pair.send_tagged(pattern(20, 4), 0x4217).unwrap();
    let ev = pair.settle();
    match event_for(&ev.b, tagged) {
        Some(CompletionEvent::Success { tag, data, bytes, .. }) => {
            assert_eq!(*tag, Some(0x4217));
            assert_eq!(*bytes, 20);
            assert_eq!(data.clone(), Some(pattern(20, 4)));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pair.lo.b.op_state(untagged), Some(OpState::Posted));
}

#[test]
fn test_peek_claim_then_claimed_receive() {
    let mut pair = TestPair::new();
    pair.send_tagged(pattern(40, 6), 7).unwrap();
    pair.settle();
    assert_eq!(pair.lo.b.unexpected_len(), 1);

    let found = pair
        .lo
        .b
        .peek(None, TagMatch::exact(7), OpFlags::PEEK | OpFlags::CLAIM)
        .unwrap();
    let PeekResult::Found {
        len,
        tag,
        claim: Some(token),
        ..
    } = found
    else {
        panic!("expected a claimed message, got {found:?}");
    };
    assert_eq!((len, tag), (40, 7));
    assert_eq!(
        pair.lo.b.peek(None, TagMatch::exact(7), OpFlags::PEEK).unwrap(),
        PeekResult::NoMessage
    );
    // a plain tagged receive cannot take a claimed message
    let plain = pair.recv_tagged(64, TagMatch::exact(7)).unwrap();

    let op = pair.lo.b.claim_recv(token, 64).unwrap();
    let ev = pair.settle();
    assert_eq!(data_for(&ev.b, op), Some(pattern(40, 6)));
    assert_eq!(pair.lo.b.op_state(plain), Some(OpState::Posted));
    assert!(pair.lo.b.claim_recv(token, 64).is_err());
}

#[test]
fn test_peek_discard_drops_message() {
    let mut pair = TestPair::new();
    pair.send_tagged(pattern(16, 0), 3).unwrap();
    pair.settle();
    let found = pair
        .lo
        .b
        .peek(None, TagMatch::exact(3), OpFlags::PEEK | OpFlags::DISCARD)
        .unwrap();
    assert!(matches!(found, PeekResult::Found { claim: None, len: 16, .. }));
    assert_eq!(pair.lo.b.unexpected_len(), 0);
    assert_eq!(
        pair.lo.b.peek(None, TagMatch::exact(3), OpFlags::PEEK).unwrap(),
        PeekResult::NoMessage
    );
}

#[test]
fn test_peek_rejects_remote_cq_data() {
    let mut pair = TestPair::new();
    let err = pair
        .lo
        .b
        .peek(None, TagMatch::exact(1), OpFlags::PEEK | OpFlags::REMOTE_CQ_DATA)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::BadFlags { .. }));
}

#[test]
fn test_delivery_complete_waits_for_receiver() {
    let mut pair = TestPair::new();
    let s = pair.send(pattern(32, 2), OpFlags::DELIVERY_COMPLETE).unwrap();
    let ev = pair.settle();
    assert!(ev.a.is_empty());
    assert_eq!(pair.lo.a.op_state(s), Some(OpState::AwaitingReceipt));

    let r = pair.recv(32).unwrap();
    let ev = pair.settle();
    assert!(event_for(&ev.a, s).unwrap().is_success());
    assert_eq!(data_for(&ev.b, r), Some(pattern(32, 2)));
}

#[test]
fn test_plain_send_completes_without_receiver() {
    let mut pair = TestPair::new();
    let s = pair.send(pattern(32, 2), OpFlags::empty()).unwrap();
    let ev = pair.settle();
    assert!(event_for(&ev.a, s).unwrap().is_success());
    assert_eq!(pair.lo.b.unexpected_len(), 1);
}

#[test]
fn test_rma_read_write_atomic() {
    let mut pair = TestPair::new();
    let peer = pair.lo.a_to_b;
    let region = pair
        .lo
        .b
        .provider_mut()
        .expose(&pattern(32, 9), MemoryKind::Host, AccessFlags::ALL);
    let counter = pair
        .lo
        .b
        .provider_mut()
        .expose(&10u64.to_le_bytes(), MemoryKind::Host, AccessFlags::ALL);

    let read = pair
        .lo
        .a
        .post_operation(peer, OpKind::Read { remote: region }, OpFlags::empty(), &[])
        .unwrap();
    let write = pair
        .lo
        .a
        .post_operation(
            peer,
            OpKind::Write {
                remote: RemoteIov { len: 4, ..region },
            },
            OpFlags::empty(),
            &[IoBuf::host(&b"abcd"[..])],
        )
        .unwrap();
    let atomic = pair
        .lo
        .a
        .post_operation(
            peer,
            OpKind::Atomic {
                op: AtomicOp::Sum,
                remote: counter,
            },
            OpFlags::empty(),
            &[IoBuf::host(Bytes::copy_from_slice(&5u64.to_le_bytes()))],
        )
        .unwrap();

    let ev = pair.settle();
    assert_eq!(data_for(&ev.a, read), Some(pattern(32, 9)));
    assert!(event_for(&ev.a, write).unwrap().is_success());
    assert_eq!(
        data_for(&ev.a, atomic),
        Some(Bytes::copy_from_slice(&10u64.to_le_bytes()))
    );
    let provider = pair.lo.b.provider();
    assert_eq!(&provider.region(region.key).unwrap().contents()[..4], b"abcd");
    assert_eq!(
        provider.region(counter.key).unwrap().contents(),
        Bytes::copy_from_slice(&15u64.to_le_bytes())
    );
}

#[test]
fn test_rma_to_protected_region_fails() {
    let mut pair = TestPair::new();
    let peer = pair.lo.a_to_b;
    let region = pair
        .lo
        .b
        .provider_mut()
        .expose(b"readonly", MemoryKind::Host, AccessFlags::REMOTE_READ);
    let write = pair
        .lo
        .a
        .post_operation(
            peer,
            OpKind::Write { remote: region },
            OpFlags::empty(),
            &[IoBuf::host(&b"x"[..])],
        )
        .unwrap();
    let ev = pair.settle();
    assert!(matches!(
        event_for(&ev.a, write),
        Some(CompletionEvent::SendFailure {
            reason: ErrorReason::Device { .. },
            ..
        })
    ));
}

#[test]
fn test_reversed_delivery_keeps_message_order() {
    let mut pair = TestPair::new();
    pair.lo.set_reverse_batches(true);
    let recvs: Vec<_> = (0..8).map(|_| pair.recv(3000).unwrap()).collect();
    for seed in 0..8u8 {
        let len = if seed % 2 == 0 { 100 } else { 3000 };
        pair.send(pattern(len, seed), OpFlags::empty()).unwrap();
    }
    let ev = pair.settle();
    for (seed, r) in recvs.iter().enumerate() {
        let len = if seed % 2 == 0 { 100 } else { 3000 };
        assert_eq!(data_for(&ev.b, *r), Some(pattern(len, seed as u8)), "message {seed}");
    }
}

#[test]
fn test_truncated_receive_fails() {
    let mut pair = TestPair::new();
    let r = pair.recv(4).unwrap();
    pair.send(pattern(10, 0), OpFlags::empty()).unwrap();
    let ev = pair.settle();
    assert_eq!(
        event_for(&ev.b, r),
        Some(&CompletionEvent::RecvFailure {
            op: Some(r),
            reason: ErrorReason::Truncated { len: 10, capacity: 4 }
        })
    );
}

#[test]
fn test_zero_length_message() {
    let mut pair = TestPair::new();
    let r = pair.recv(0).unwrap();
    pair.send(Bytes::new(), OpFlags::empty()).unwrap();
    let ev = pair.settle();
    assert_eq!(data_for(&ev.b, r), Some(Bytes::new()));
}

#[test]
fn test_accelerator_buffer_runt_is_aligned() {
    let mut config = test_config();
    config.runt.accel_ceiling = 1000;
    let mut pair = TestPair::with_configs(config, test_config());
    let r = pair.recv(6000).unwrap();
    let data = pattern(6000, 8);
    let buf = IoBuf::with_desc(
        data.clone(),
        rdm_core::op::MemoryDesc {
            kind: MemoryKind::Accelerator,
            key: 1,
        },
    );
    let peer = pair.lo.a_to_b;
    pair.lo
        .a
        .post_operation(peer, OpKind::Send { tag: None }, OpFlags::empty(), &[buf])
        .unwrap();
    let ev = pair.settle();
    assert_eq!(data_for(&ev.b, r), Some(data));
    assert_eq!(pair.lo.a.peers().get(peer).unwrap().runt_in_flight, 0);
}
