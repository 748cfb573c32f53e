mod test_utilities;

use tccl::{Gid, HandshakeData, QueuePairState, RcQueuePair, HANDSHAKE_DATA_LEN};
use test_utilities::{rnic_a, rnic_b};

#[test]
fn handshake_blob_is_22_bytes_and_round_trips() {
    let mut gid_bytes = [0_u8; 16];
    gid_bytes[10] = 0xff;
    gid_bytes[11] = 0xfe;
    let mut buf = [0_u8; HANDSHAKE_DATA_LEN];
    buf[..16].copy_from_slice(&gid_bytes);
    buf[16..18].copy_from_slice(&7_u16.to_le_bytes());
    buf[18..].copy_from_slice(&0x00ab_cdef_u32.to_le_bytes());

    let original = HandshakeData::from_bytes(&buf);
    assert_eq!(*original.gid(), Gid::from_bytes(gid_bytes));
    assert_eq!(*original.lid(), 7);
    assert_eq!(*original.qp_num(), 0x00ab_cdef);
    assert_eq!(original.to_bytes(), buf);

    // applications may also ship the blob through serde
    let json = serde_json::to_string(&original).expect("serialize");
    let parsed: HandshakeData = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(parsed, original);
}

#[test]
#[ignore = "requires two RDMA devices"]
fn fresh_queue_pair_is_reset() {
    let qp = RcQueuePair::create_from_device_name(&rnic_a()).expect("create qp");
    assert_eq!(qp.query_state().expect("query"), QueuePairState::Reset);
    assert_eq!(qp.cached_state(), QueuePairState::Reset);
}

#[test]
#[ignore = "requires two RDMA devices"]
fn bring_up_reaches_rts() {
    let qp_a = RcQueuePair::create_from_device_name(&rnic_a()).expect("create qp a");
    let qp_b = RcQueuePair::create_from_device_name(&rnic_b()).expect("create qp b");

    qp_a.bring_up(&qp_b.handshake_data()).expect("bring up a");
    qp_b.bring_up(&qp_a.handshake_data()).expect("bring up b");

    assert_eq!(
        qp_a.query_state().expect("query"),
        QueuePairState::ReadyToSend
    );
    assert_eq!(
        qp_b.query_state().expect("query"),
        QueuePairState::ReadyToSend
    );
}

#[test]
#[ignore = "requires two RDMA devices"]
fn bring_up_twice_is_a_no_op() {
    let qp_a = RcQueuePair::create_from_device_name(&rnic_a()).expect("create qp a");
    let qp_b = RcQueuePair::create_from_device_name(&rnic_b()).expect("create qp b");

    qp_a.bring_up(&qp_b.handshake_data()).expect("bring up a");
    qp_b.bring_up(&qp_a.handshake_data()).expect("bring up b");

    // the second call must observe RTS and return success without touching
    // the state machine
    qp_a.bring_up(&qp_b.handshake_data())
        .expect("second bring up");
    assert_eq!(
        qp_a.query_state().expect("query"),
        QueuePairState::ReadyToSend
    );
}
