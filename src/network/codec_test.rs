use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::MsgType;
use super::SendFrame;
use super::WireCodec;
use crate::Error;
use crate::NetworkError;

fn frame_bytes(msg_type: MsgType, control: &[u8], payload: &[u8]) -> Vec<u8> {
    let frame = SendFrame::new(msg_type, control.to_vec(), payload.to_vec());
    frame.flattened().to_vec()
}

/// # Case 1: a frame split at every possible byte boundary still decodes
/// once, exercising the header-phase/payload-phase resume
#[test]
fn test_partial_reads_resume_across_phases() {
    let bytes = frame_bytes(MsgType::Rep, &[1, 2, 3, 4], b"payload");
    for split in 1..bytes.len() {
        let mut codec = WireCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_slice(&bytes[..split]);
        let first = codec.decode(&mut buf).unwrap();
        if split < bytes.len() {
            assert!(first.is_none(), "decoded early at split {}", split);
        }
        buf.put_slice(&bytes[split..]);
        let frame = codec.decode(&mut buf).unwrap().expect("whole frame buffered");
        assert_eq!(frame.msg_type, MsgType::Rep);
        assert_eq!(&frame.control[..], &[1, 2, 3, 4]);
        assert_eq!(&frame.payload[..], b"payload");
    }
}

/// # Case 2: two frames on the wire come out in order, the first fully
/// dispatched before the second's header is touched
#[test]
fn test_frames_decode_in_order() {
    let mut buf = BytesMut::new();
    buf.put_slice(&frame_bytes(MsgType::Handshake, &[9; 10], b"a\0"));
    buf.put_slice(&frame_bytes(MsgType::Ack, &[7; 12], b""));

    let mut codec = WireCodec::new(1024);
    let first = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(first.msg_type, MsgType::Handshake);
    assert_eq!(&first.payload[..], b"a\0");
    let second = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(second.msg_type, MsgType::Ack);
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

/// # Case 3: zero-length control and payload are legal; the length fields
/// are always present
#[test]
fn test_empty_parts() {
    let mut buf = BytesMut::from(&frame_bytes(MsgType::Rep, &[], &[])[..]);
    let frame = WireCodec::new(64).decode(&mut buf).unwrap().unwrap();
    assert!(frame.control.is_empty());
    assert!(frame.payload.is_empty());
}

/// # Case 4: an unknown type byte is a bad frame
#[test]
fn test_unknown_type_rejected() {
    let mut bytes = frame_bytes(MsgType::Rep, &[], &[]);
    bytes[0] = 0xEE;
    let mut buf = BytesMut::from(&bytes[..]);
    match WireCodec::new(64).decode(&mut buf) {
        Err(Error::Network(NetworkError::BadFrame(_))) => {}
        other => panic!("expected BadFrame, got {:?}", other),
    }
}

/// # Case 5: length fields above the ceiling are rejected before any
/// allocation
#[test]
fn test_oversized_length_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u8(MsgType::Rep as u8);
    buf.put_u32(u32::MAX);
    buf.put_u32(0);
    match WireCodec::new(1024).decode(&mut buf) {
        Err(Error::Network(NetworkError::FrameTooLarge { .. })) => {}
        other => panic!("expected FrameTooLarge, got {:?}", other),
    }
}

/// # Case 6: scatter slices and the flattened copy describe the same bytes
#[test]
fn test_slices_match_flattened() {
    let frame = SendFrame::new(MsgType::Rep, vec![1, 2, 3], vec![4, 5, 6, 7]);
    let flat = frame.flattened();
    assert_eq!(flat.len(), frame.len());
    for offset in 0..frame.len() {
        let gathered: Vec<u8> = frame
            .slices_from(offset)
            .iter()
            .flat_map(|s| s.iter().copied())
            .collect();
        assert_eq!(&gathered[..], &flat[offset..], "offset {}", offset);
    }
    assert!(frame.slices_from(frame.len()).is_empty());
}
