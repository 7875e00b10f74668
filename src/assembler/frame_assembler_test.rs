use std::time::SystemTime;

use bytes::Bytes;
use tokio_test::assert_ok;

use super::*;
use crate::buffer::NowGen;

fn now_gen() -> NowGen {
    Arc::new(SystemTime::now)
}

fn packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            sequence_number: seq,
            timestamp: ts,
            marker,
            ssrc: 1000,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

fn video_assembler() -> (Arc<DuplicationBuffer>, FrameAssembler) {
    let buffer = Arc::new(DuplicationBuffer::new(1000, now_gen(), 0));
    let assembler = FrameAssembler::new(Arc::clone(&buffer), MediaKind::Video);
    (buffer, assembler)
}

#[tokio::test]
async fn test_video_frame_spans_packets_until_marker() {
    let (buffer, assembler) = video_assembler();

    assert_ok!(buffer.write(&packet(1, 100, false, &[1, 2])).await);
    assert_ok!(buffer.write(&packet(2, 100, false, &[3])).await);
    assert_ok!(buffer.write(&packet(3, 100, true, &[4, 5])).await);

    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[1, 2, 3, 4, 5]));
    assert_eq!(frame.timestamp, 100);
    assert_eq!(frame.packet_count, 3);
    assert_eq!(assembler.discarded_frames(), 0);
}

#[tokio::test]
async fn test_video_sequence_gap_discards_partial_frame() {
    let (buffer, assembler) = video_assembler();

    // Frame start, then a gap (seq 3 lost), then a complete frame.
    assert_ok!(buffer.write(&packet(1, 100, false, &[1])).await);
    assert_ok!(buffer.write(&packet(2, 100, false, &[2])).await);
    assert_ok!(buffer.write(&packet(4, 200, false, &[4])).await);
    assert_ok!(buffer.write(&packet(5, 200, true, &[5])).await);

    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[4, 5]));
    assert_eq!(frame.timestamp, 200);
    assert_eq!(assembler.discarded_frames(), 1);
}

#[tokio::test]
async fn test_video_lost_marker_resyncs_on_timestamp_change() {
    let (buffer, assembler) = video_assembler();

    // The marker packet of ts=100 never arrives; the seq numbers stay
    // contiguous, so only the timestamp change reveals the lost frame end.
    assert_ok!(buffer.write(&packet(1, 100, false, &[1])).await);
    assert_ok!(buffer.write(&packet(2, 200, false, &[2])).await);
    assert_ok!(buffer.write(&packet(3, 200, true, &[3])).await);

    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[2, 3]));
    assert_eq!(frame.timestamp, 200);
    assert_eq!(assembler.discarded_frames(), 1);
}

#[tokio::test]
async fn test_audio_packet_per_frame() {
    let buffer = Arc::new(DuplicationBuffer::new(2000, now_gen(), 0));
    let assembler = FrameAssembler::new(Arc::clone(&buffer), MediaKind::Audio);

    // Audio rarely sets the marker bit; every packet is a frame.
    assert_ok!(buffer.write(&packet(1, 160, false, &[1])).await);
    assert_ok!(buffer.write(&packet(2, 320, false, &[2])).await);

    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[1]));
    assert_eq!(frame.packet_count, 1);
    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[2]));
    assert_eq!(frame.timestamp, 320);
}

#[tokio::test]
async fn test_padding_only_packets_skipped() {
    let (buffer, assembler) = video_assembler();

    assert_ok!(buffer.write(&packet(1, 100, false, &[])).await);
    assert_ok!(buffer.write(&packet(2, 100, true, &[9])).await);

    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[9]));
    assert_eq!(frame.packet_count, 1);
}

#[tokio::test]
async fn test_read_frame_after_buffer_close() {
    let (buffer, assembler) = video_assembler();

    assert_ok!(buffer.write(&packet(1, 100, true, &[1])).await);
    buffer.close().await;

    // Buffered data still assembles, then the stream ends.
    let frame = assert_ok!(assembler.read_frame().await);
    assert_eq!(frame.data, Bytes::from_static(&[1]));
    let result = assembler.read_frame().await;
    assert_eq!(result.unwrap_err(), Error::ErrBufferClosed);
}

#[tokio::test]
async fn test_stop_fails_fast_and_is_idempotent() {
    let (buffer, assembler) = video_assembler();
    assert_ok!(buffer.write(&packet(1, 100, true, &[1])).await);

    assembler.stop();
    assembler.stop();

    let result = assembler.read_frame().await;
    assert_eq!(result.unwrap_err(), Error::ErrAssemblerStopped);
}
