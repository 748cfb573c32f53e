mod test_utilities;

use tccl::Error;
use test_utilities::{buffer_size, buffers_equal, chunk_size, fill_pattern, transfer_pair};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
#[ignore = "requires two RDMA devices"]
fn one_stream_bulk_host_memory() {
    init_logging();
    let total = buffer_size();
    let chunk = chunk_size();
    let chunks = total / chunk;
    let pair = transfer_pair(total as usize).expect("setup");
    fill_pattern(&pair.mr_a, 3);

    let mut futures = Vec::with_capacity(2 * chunks as usize);
    for i in 0..chunks {
        let offset = i * chunk;
        futures.push(
            pair.side_a
                .send(0, pair.mr_a.addr() + offset, chunk as u32, pair.mr_a.lkey())
                .expect("send"),
        );
        futures.push(
            pair.side_b
                .recv(0, pair.mr_b.addr() + offset, chunk as u32, pair.mr_b.rkey())
                .expect("recv"),
        );
    }
    for fut in futures {
        fut.wait().expect("transfer");
    }
    assert!(buffers_equal(&pair.mr_a, &pair.mr_b, total as usize));
}

#[test]
#[ignore = "requires two RDMA devices"]
fn all_recvs_posted_before_any_send() {
    init_logging();
    let total = buffer_size();
    let chunk = chunk_size();
    let chunks = total / chunk;
    let pair = transfer_pair(total as usize).expect("setup");
    fill_pattern(&pair.mr_a, 17);

    let recvs: Vec<_> = (0..chunks)
        .map(|i| {
            pair.side_b
                .recv(
                    0,
                    pair.mr_b.addr() + i * chunk,
                    chunk as u32,
                    pair.mr_b.rkey(),
                )
                .expect("recv")
        })
        .collect();
    let sends: Vec<_> = (0..chunks)
        .map(|i| {
            pair.side_a
                .send(
                    0,
                    pair.mr_a.addr() + i * chunk,
                    chunk as u32,
                    pair.mr_a.lkey(),
                )
                .expect("send")
        })
        .collect();

    for fut in sends.into_iter().chain(recvs) {
        fut.wait().expect("transfer");
    }
    assert!(buffers_equal(&pair.mr_a, &pair.mr_b, total as usize));
}

#[test]
#[ignore = "requires two RDMA devices"]
fn two_streams_interleaved() {
    init_logging();
    let chunk = chunk_size();
    let chunks_per_stream = 16_u64;
    let total = chunk * chunks_per_stream * 2;
    let pair = transfer_pair(total as usize).expect("setup");
    fill_pattern(&pair.mr_a, 91);

    // stream 0 owns the even chunks, stream 1 the odd ones; posting
    // alternates between the streams on both sides
    let mut futures = Vec::new();
    for i in 0..chunks_per_stream * 2 {
        let stream = (i % 2) as u32;
        let offset = i * chunk;
        futures.push(
            pair.side_b
                .recv(
                    stream,
                    pair.mr_b.addr() + offset,
                    chunk as u32,
                    pair.mr_b.rkey(),
                )
                .expect("recv"),
        );
        futures.push(
            pair.side_a
                .send(
                    stream,
                    pair.mr_a.addr() + offset,
                    chunk as u32,
                    pair.mr_a.lkey(),
                )
                .expect("send"),
        );
    }
    for fut in futures {
        fut.wait().expect("transfer");
    }
    assert!(buffers_equal(&pair.mr_a, &pair.mr_b, total as usize));
}

#[test]
#[ignore = "requires two RDMA devices"]
fn length_mismatch_fails_both_futures_and_stream_recovers() {
    init_logging();
    let pair = transfer_pair(64 * 1024).expect("setup");
    fill_pattern(&pair.mr_a, 5);

    let bad_recv = pair
        .side_b
        .recv(0, pair.mr_b.addr(), 2048, pair.mr_b.rkey())
        .expect("recv");
    let bad_send = pair
        .side_a
        .send(0, pair.mr_a.addr(), 1024, pair.mr_a.lkey())
        .expect("send");

    assert!(matches!(
        bad_send.wait(),
        Err(Error::LengthMismatch {
            stream_id: 0,
            local: 1024,
            remote: 2048,
        })
    ));
    assert!(matches!(
        bad_recv.wait(),
        Err(Error::LengthMismatch {
            stream_id: 0,
            local: 2048,
            remote: 1024,
        })
    ));

    // the stream stays usable for subsequent matched pairs
    let good_recv = pair
        .side_b
        .recv(0, pair.mr_b.addr(), 4096, pair.mr_b.rkey())
        .expect("recv");
    let good_send = pair
        .side_a
        .send(0, pair.mr_a.addr(), 4096, pair.mr_a.lkey())
        .expect("send");
    good_send.wait().expect("send after mismatch");
    good_recv.wait().expect("recv after mismatch");
    assert!(buffers_equal(&pair.mr_a, &pair.mr_b, 4096));
}

#[test]
#[ignore = "requires two RDMA devices"]
fn shutdown_cancels_pending_recv() {
    init_logging();
    let pair = transfer_pair(4096).expect("setup");

    let orphan = pair
        .side_b
        .recv(7, pair.mr_b.addr(), 4096, pair.mr_b.rkey())
        .expect("recv");

    // nothing ever sends on stream 7; dropping the engine must resolve the
    // future within the shutdown grace interval
    drop(pair.side_b);
    assert!(matches!(orphan.wait(), Err(Error::Cancelled)));

    // calls after shutdown are refused
    drop(pair.side_a);
}
