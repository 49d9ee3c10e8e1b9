use super::split_bulk;
use super::BulkBuffer;
use crate::Lsn;
use crate::RepMessage;

/// # Case 1: records accumulate and drain as one message
#[test]
fn test_push_and_take() {
    let mut bulk = BulkBuffer::new(1024, 16);
    assert!(bulk.is_empty());
    bulk.push(Lsn::new(1, 16), b"aaaa", 0);
    bulk.push(Lsn::new(1, 28), b"bb", 0x1);
    let msg = bulk.take().expect("buffer had records");
    let RepMessage::BulkLog {
        first_lsn,
        flags,
        payload,
    } = msg
    else {
        panic!("expected a bulk message");
    };
    assert_eq!(first_lsn, Lsn::new(1, 16));
    assert_eq!(flags, 0x1);

    let entries = split_bulk(&payload).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (Lsn::new(1, 16), &b"aaaa"[..]));
    assert_eq!(entries[1], (Lsn::new(1, 28), &b"bb"[..]));
    assert!(bulk.is_empty());
    assert!(bulk.take().is_none());
}

/// # Case 2: fit checks against the byte ceiling and the record ceiling
#[test]
fn test_fits_and_oversize() {
    let mut bulk = BulkBuffer::new(64, 2);
    assert!(bulk.oversize(64));
    assert!(!bulk.oversize(16));

    bulk.push(Lsn::new(1, 16), &[0u8; 16], 0);
    assert!(!bulk.fits(40)); // 28 + 12 + 40 > 64
    assert!(bulk.fits(8));

    bulk.push(Lsn::new(1, 40), &[0u8; 8], 0);
    // Record ceiling reached; nothing more fits regardless of bytes.
    assert!(!bulk.fits(1));
}

/// # Case 3: truncated bulk payloads are rejected
#[test]
fn test_split_rejects_truncation() {
    let mut bulk = BulkBuffer::new(256, 8);
    bulk.push(Lsn::new(2, 16), b"payload", 0);
    let RepMessage::BulkLog { payload, .. } = bulk.take().unwrap() else {
        panic!("expected a bulk message");
    };
    assert!(split_bulk(&payload[..payload.len() - 1]).is_err());
    assert!(split_bulk(&payload[..6]).is_err());
    assert!(split_bulk(&[]).unwrap().is_empty());
}
