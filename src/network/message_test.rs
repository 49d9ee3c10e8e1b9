use super::Ack;
use super::Handshake;
use super::RepControl;
use super::RepMessage;
use crate::constants::WIRE_VERSION;
use crate::Error;
use crate::Lsn;
use crate::NetworkError;
use crate::RecordType;

fn round_trip(msg: &RepMessage) -> RepMessage {
    let (control, payload) = msg.to_wire(3, 1);
    assert_eq!(control.generation, 3);
    let decoded_ctl = RepControl::decode(&control.encode()).unwrap();
    assert_eq!(decoded_ctl, control);
    RepMessage::from_wire(&decoded_ctl, &payload).unwrap()
}

/// # Case 1: every message kind survives the wire
#[test]
fn test_rep_message_round_trips() {
    let messages = [
        RepMessage::Log {
            lsn: Lsn::new(2, 64),
            rec_type: RecordType::Commit,
            flags: 0x3,
            payload: vec![1, 2, 3],
        },
        RepMessage::LogMore {
            lsn: Lsn::new(2, 80),
            rec_type: RecordType::Data,
            flags: 0,
            payload: vec![9; 10],
        },
        RepMessage::BulkLog {
            first_lsn: Lsn::new(1, 16),
            flags: 0x1,
            payload: vec![0; 32],
        },
        RepMessage::AllReq { from: Lsn::ZERO },
        RepMessage::LogReq {
            from: Lsn::new(1, 16),
            end: Some(Lsn::new(1, 128)),
        },
        RepMessage::LogReq {
            from: Lsn::new(1, 16),
            end: None,
        },
        RepMessage::NewFile {
            end_of_file: Lsn::new(3, 4096),
            log_version: 1,
        },
        RepMessage::VerifyFail { lsn: Lsn::new(4, 16) },
        RepMessage::PrimaryQuery,
    ];
    for msg in messages {
        assert_eq!(round_trip(&msg), msg);
    }
}

/// # Case 2: handshake control is fixed-width, the hostname rides the
/// payload NUL-terminated
#[test]
fn test_handshake_round_trip() {
    let hs = Handshake {
        version: WIRE_VERSION,
        priority: 100,
        port: 7780,
        hostname: "replica-3.example".into(),
    };
    let control = hs.encode_control();
    assert_eq!(control.len(), 10);
    let payload = hs.encode_payload();
    assert_eq!(*payload.last().unwrap(), 0);
    assert_eq!(Handshake::decode(&control, &payload).unwrap(), hs);
}

/// # Case 3: a handshake from a newer protocol is rejected as a version
/// mismatch, not garbled
#[test]
fn test_handshake_version_mismatch() {
    let hs = Handshake {
        version: WIRE_VERSION,
        priority: 1,
        port: 1,
        hostname: "x".into(),
    };
    let mut control = hs.encode_control();
    control[0..4].copy_from_slice(&(WIRE_VERSION + 1).to_be_bytes());
    match Handshake::decode(&control, &hs.encode_payload()) {
        Err(Error::Network(NetworkError::VersionMismatch { .. })) => {}
        other => panic!("expected VersionMismatch, got {:?}", other),
    }
}

/// # Case 4: unterminated hostnames are rejected
#[test]
fn test_handshake_requires_nul() {
    let hs = Handshake {
        version: WIRE_VERSION,
        priority: 1,
        port: 1,
        hostname: "host".into(),
    };
    match Handshake::decode(&hs.encode_control(), b"host") {
        Err(Error::Network(NetworkError::BadFrame(_))) => {}
        other => panic!("expected BadFrame, got {:?}", other),
    }
}

/// # Case 5: acks carry an LSN and generation and nothing else
#[test]
fn test_ack_round_trip() {
    let ack = Ack {
        lsn: Lsn::new(3, 128),
        generation: 7,
    };
    assert_eq!(Ack::decode(&ack.encode_control(), &[]).unwrap(), ack);
    assert!(Ack::decode(&ack.encode_control(), &[1]).is_err());
    assert!(Ack::decode(&ack.encode_control()[..8], &[]).is_err());
}

/// # Case 6: a replication control from a newer wire version is refused
#[test]
fn test_rep_control_version_check() {
    let msg = RepMessage::AllReq { from: Lsn::ZERO };
    let (control, _) = msg.to_wire(0, 1);
    let mut raw = control.encode();
    raw[0..4].copy_from_slice(&(WIRE_VERSION + 9).to_be_bytes());
    match RepControl::decode(&raw) {
        Err(Error::Network(NetworkError::VersionMismatch { .. })) => {}
        other => panic!("expected VersionMismatch, got {:?}", other),
    }
}

/// # Case 7: a range request with a mangled end LSN is a bad frame
#[test]
fn test_log_req_bad_range_end() {
    let msg = RepMessage::LogReq {
        from: Lsn::new(1, 16),
        end: Some(Lsn::new(1, 64)),
    };
    let (control, payload) = msg.to_wire(0, 1);
    match RepMessage::from_wire(&control, &payload[..5]) {
        Err(Error::Network(NetworkError::BadFrame(_))) => {}
        other => panic!("expected BadFrame, got {:?}", other),
    }
}
