use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::time::{sleep, timeout, Duration};
use tokio_test::assert_ok;

use super::*;

fn now_gen() -> NowGen {
    Arc::new(SystemTime::now)
}

fn packet(seq: u16, payload: &[u8]) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            sequence_number: seq,
            ssrc: 1000,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

#[tokio::test]
async fn test_duplication_buffer() {
    let buffer = DuplicationBuffer::new(1000, now_gen(), 0);
    assert_eq!(buffer.ssrc(), 1000);

    // Write twice
    assert_ok!(buffer.write(&packet(1, &[0, 1])).await);
    assert_ok!(buffer.write(&packet(2, &[2, 3])).await);
    assert_eq!(buffer.count().await, 2);

    // Read twice, FIFO
    let (pkt, _) = assert_ok!(buffer.read().await);
    assert_eq!(pkt.header.sequence_number, 1);
    let (pkt, _) = assert_ok!(buffer.read().await);
    assert_eq!(pkt.header.sequence_number, 2);

    // Write once prior to close.
    assert_ok!(buffer.write(&packet(3, &[4])).await);

    // Close
    buffer.close().await;
    assert!(buffer.is_closed().await);

    // Future writes will error
    let result = buffer.write(&packet(4, &[5])).await;
    assert_eq!(result.unwrap_err(), Error::ErrBufferClosed);

    // But we can read the remaining data.
    let (pkt, _) = assert_ok!(buffer.read().await);
    assert_eq!(pkt.header.sequence_number, 3);

    // Until depleted
    let result = buffer.read().await;
    assert_eq!(result.unwrap_err(), Error::ErrBufferClosed);

    // close is idempotent
    buffer.close().await;
}

#[tokio::test]
async fn test_duplication_buffer_blocking_read_woken_by_write() {
    let buffer = Arc::new(DuplicationBuffer::new(1000, now_gen(), 0));

    let reader = Arc::clone(&buffer);
    let handle = tokio::spawn(async move { reader.read().await });

    // Give the reader time to block before writing.
    sleep(Duration::from_millis(20)).await;
    assert_ok!(buffer.write(&packet(7, &[9])).await);

    let (pkt, _) = timeout(Duration::from_secs(1), handle)
        .await
        .expect("reader was not woken")
        .unwrap()
        .unwrap();
    assert_eq!(pkt.header.sequence_number, 7);
}

#[tokio::test]
async fn test_duplication_buffer_blocking_read_woken_by_close() {
    let buffer = Arc::new(DuplicationBuffer::new(1000, now_gen(), 0));

    let reader = Arc::clone(&buffer);
    let handle = tokio::spawn(async move { reader.read().await });

    sleep(Duration::from_millis(20)).await;
    buffer.close().await;

    let result = timeout(Duration::from_secs(1), handle)
        .await
        .expect("reader was not woken")
        .unwrap();
    assert_eq!(result.unwrap_err(), Error::ErrBufferClosed);
}

#[tokio::test]
async fn test_duplication_buffer_two_blocked_readers_woken_by_writes() {
    let buffer = Arc::new(DuplicationBuffer::new(1000, now_gen(), 0));

    let r1 = Arc::clone(&buffer);
    let h1 = tokio::spawn(async move { r1.read().await });
    let r2 = Arc::clone(&buffer);
    let h2 = tokio::spawn(async move { r2.read().await });

    // Let both readers block before anything is written.
    sleep(Duration::from_millis(20)).await;
    assert_ok!(buffer.write(&packet(1, &[1])).await);
    assert_ok!(buffer.write(&packet(2, &[2])).await);

    let (p1, _) = timeout(Duration::from_secs(1), h1)
        .await
        .expect("first reader was not woken")
        .unwrap()
        .unwrap();
    let (p2, _) = timeout(Duration::from_secs(1), h2)
        .await
        .expect("second reader was not woken")
        .unwrap()
        .unwrap();

    // Each reader got one of the two packets, in either order.
    let mut seqs = vec![p1.header.sequence_number, p2.header.sequence_number];
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_duplication_buffer_close_wakes_all_blocked_readers() {
    let buffer = Arc::new(DuplicationBuffer::new(1000, now_gen(), 0));

    let r1 = Arc::clone(&buffer);
    let h1 = tokio::spawn(async move { r1.read().await });
    let r2 = Arc::clone(&buffer);
    let h2 = tokio::spawn(async move { r2.read().await });

    sleep(Duration::from_millis(20)).await;
    buffer.close().await;

    for handle in [h1, h2] {
        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader was not woken")
            .unwrap();
        assert_eq!(result.unwrap_err(), Error::ErrBufferClosed);
    }
}

#[tokio::test]
async fn test_duplication_buffer_overflow_drops_oldest() {
    let buffer = DuplicationBuffer::new(1000, now_gen(), 3);

    for seq in 1..=5u16 {
        assert_ok!(buffer.write(&packet(seq, &[seq as u8])).await);
    }

    // Two packets dropped from the head, the freshest three remain.
    assert_eq!(buffer.dropped(), 2);
    assert_eq!(buffer.count().await, 3);
    for expected in 3..=5u16 {
        let (pkt, _) = assert_ok!(buffer.read().await);
        assert_eq!(pkt.header.sequence_number, expected);
    }
}

#[tokio::test]
async fn test_duplication_buffer_listener_swallows_write_to_closed() {
    let buffer = DuplicationBuffer::new(1000, now_gen(), 0);
    buffer.close().await;

    // Delivery racing stop() must not propagate an error.
    buffer.on_packet(&packet(1, &[1])).await;
    assert_eq!(buffer.dropped(), 0);
}

#[tokio::test]
async fn test_duplication_buffer_timestamps_monotonic_with_now_gen() {
    let base = SystemTime::UNIX_EPOCH;
    let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    let now_gen: NowGen = Arc::new(move || {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        base + Duration::from_millis(n)
    });

    let buffer = DuplicationBuffer::new(1000, now_gen, 0);
    assert_ok!(buffer.write(&packet(1, &[1])).await);
    assert_ok!(buffer.write(&packet(2, &[2])).await);

    let (_, t1) = assert_ok!(buffer.read().await);
    let (_, t2) = assert_ok!(buffer.read().await);
    assert_eq!(t1, base);
    assert_eq!(t2, base + Duration::from_millis(1));
}
