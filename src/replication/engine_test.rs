use std::sync::Arc;
use std::sync::Mutex;

use tempfile::TempDir;

use super::Destination;
use super::ElectionSnapshot;
use super::MockElectionView;
use super::RepSender;
use super::ReplicationEngine;
use super::SendOutcome;
use super::SharedElectionView;
use crate::config::LogSettings;
use crate::config::ReplicationSettings;
use crate::config::SyncPolicy;
use crate::network::rep_flags;
use crate::Ack;
use crate::Error;
use crate::LogStore;
use crate::Lsn;
use crate::RecordType;
use crate::RepMessage;
use crate::ReplicationError;
use crate::Result;
use crate::StorageError;

/// Sender that records everything; cloned handles share the logs.
#[derive(Clone, Default)]
struct VecSender {
    sent: Arc<Mutex<Vec<(Destination, RepMessage)>>>,
    acks: Arc<Mutex<Vec<(u32, Ack)>>>,
}

impl VecSender {
    fn take(&self) -> Vec<(Destination, RepMessage)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn take_acks(&self) -> Vec<(u32, Ack)> {
        std::mem::take(&mut self.acks.lock().unwrap())
    }
}

impl RepSender for VecSender {
    fn send(&self, dest: Destination, msg: &RepMessage) -> Result<SendOutcome> {
        self.sent.lock().unwrap().push((dest, msg.clone()));
        Ok(SendOutcome { sites: 1, peers: 1 })
    }

    fn send_ack(&self, eid: u32, ack: Ack) -> Result<()> {
        self.acks.lock().unwrap().push((eid, ack));
        Ok(())
    }
}

fn store_with(dir: &TempDir, max_file_size: u32) -> Arc<LogStore> {
    let settings = LogSettings {
        dir: dir.path().to_path_buf(),
        max_file_size,
        sync: SyncPolicy::Batched,
        file_mode: 0o600,
    };
    Arc::new(LogStore::open(settings).unwrap())
}

fn rep_settings(bulk: u32, throttle: u64) -> ReplicationSettings {
    ReplicationSettings {
        group_size: 2,
        bulk_buffer_size: bulk,
        throttle_bytes: throttle,
        ..ReplicationSettings::default()
    }
}

/// Primary seen as eid 1 by itself; sites address each other as eid 0.
const PEER_EID: u32 = 0;

fn primary_engine(
    store: Arc<LogStore>,
    settings: ReplicationSettings,
) -> (ReplicationEngine<VecSender>, VecSender) {
    let sender = VecSender::default();
    let election = Arc::new(SharedElectionView::new(
        1,
        ElectionSnapshot {
            primary: Some(1),
            generation: 1,
        },
    ));
    let engine = ReplicationEngine::new(store, election, sender.clone(), settings);
    (engine, sender)
}

fn replica_engine(
    store: Arc<LogStore>,
    settings: ReplicationSettings,
) -> (ReplicationEngine<VecSender>, VecSender) {
    let sender = VecSender::default();
    let election = Arc::new(SharedElectionView::new(
        2,
        ElectionSnapshot {
            primary: Some(PEER_EID),
            generation: 1,
        },
    ));
    let engine = ReplicationEngine::new(store, election, sender.clone(), settings);
    (engine, sender)
}

/// Ferries messages between the two engines until both go quiet, returning
/// every message that crossed the wire.
fn pump(
    primary: &ReplicationEngine<VecSender>,
    primary_sender: &VecSender,
    replica: &ReplicationEngine<VecSender>,
    replica_sender: &VecSender,
) -> Vec<RepMessage> {
    let mut trace = Vec::new();
    loop {
        let mut progressed = false;
        for (_, msg) in primary_sender.take() {
            trace.push(msg.clone());
            replica.process_message(PEER_EID, msg).unwrap();
            progressed = true;
        }
        for (_, msg) in replica_sender.take() {
            trace.push(msg.clone());
            primary.process_message(PEER_EID, msg).unwrap();
            progressed = true;
        }
        if !progressed {
            return trace;
        }
    }
}

fn walk_lsns(store: &LogStore) -> Vec<Lsn> {
    let mut lsns = Vec::new();
    let mut cursor = store.cursor();
    if let Ok(rec) = cursor.first() {
        lsns.push(rec.lsn());
        while let Ok(rec) = cursor.next() {
            lsns.push(rec.lsn());
        }
    }
    lsns
}

/// # Case 1: a full catch-up leaves the replica with exactly the
/// primary's records, with no duplicates and no gaps
#[test]
fn test_catch_up_closes_all_gaps() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(0, 0));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(0, 0));

    for i in 0..20u8 {
        let rec_type = if i % 5 == 4 {
            RecordType::Commit
        } else {
            RecordType::Data
        };
        store_a.append(rec_type, &[i; 10]).unwrap();
    }

    primary
        .process_message(PEER_EID, RepMessage::AllReq { from: Lsn::ZERO })
        .unwrap();
    pump(&primary, &ps, &replica, &rs);

    assert_eq!(store_b.head_lsn(), store_a.head_lsn());
    assert_eq!(walk_lsns(&store_b), walk_lsns(&store_a));
    for lsn in walk_lsns(&store_a) {
        assert_eq!(
            store_b.read(lsn).unwrap().payload(),
            store_a.read(lsn).unwrap().payload()
        );
    }
    // Commit records were acknowledged as they became contiguous.
    assert!(!rs.take_acks().is_empty());
}

/// # Case 2: rotation on the primary reaches the replica through
/// new-file markers, never by splitting or skipping records
#[test]
fn test_catch_up_across_file_rotations() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 128);
    let store_b = store_with(&dir_b, 128);
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(0, 0));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(0, 0));

    for i in 0..12u8 {
        store_a.append(RecordType::Data, &[i; 24]).unwrap();
    }
    assert!(store_a.head_lsn().file > 1, "test needs rotations");

    primary
        .process_message(PEER_EID, RepMessage::AllReq { from: Lsn::ZERO })
        .unwrap();
    let trace = pump(&primary, &ps, &replica, &rs);

    assert!(trace
        .iter()
        .any(|m| matches!(m, RepMessage::NewFile { .. })));
    assert_eq!(store_b.head_lsn(), store_a.head_lsn());
    assert_eq!(walk_lsns(&store_b), walk_lsns(&store_a));
}

/// # Case 3: a throttled stream pauses with log-more and the replica
/// keeps requesting until it has caught up
#[test]
fn test_throttled_catch_up_converges() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    // A one-byte budget turns every record into a log-more pause.
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(0, 1));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(0, 1));

    for i in 0..10u8 {
        store_a.append(RecordType::Data, &[i; 16]).unwrap();
    }

    primary
        .process_message(PEER_EID, RepMessage::AllReq { from: Lsn::ZERO })
        .unwrap();
    let trace = pump(&primary, &ps, &replica, &rs);

    assert!(trace
        .iter()
        .any(|m| matches!(m, RepMessage::LogMore { .. })));
    assert_eq!(store_b.head_lsn(), store_a.head_lsn());
}

/// # Case 4: with bulk batching enabled, records travel batched and
/// still apply exactly once
#[test]
fn test_bulk_catch_up() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(4096, 0));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(4096, 0));

    for i in 0..15u8 {
        let rec_type = if i == 14 {
            RecordType::Commit
        } else {
            RecordType::Data
        };
        store_a.append(rec_type, &[i; 20]).unwrap();
    }

    primary
        .process_message(PEER_EID, RepMessage::AllReq { from: Lsn::ZERO })
        .unwrap();
    let trace = pump(&primary, &ps, &replica, &rs);

    assert!(trace
        .iter()
        .any(|m| matches!(m, RepMessage::BulkLog { .. })));
    assert_eq!(store_b.head_lsn(), store_a.head_lsn());
    assert_eq!(walk_lsns(&store_b), walk_lsns(&store_a));
}

/// # Case 5: out-of-order singles are buffered and the hole is requested
/// and healed
#[test]
fn test_out_of_order_delivery_heals() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(0, 0));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(0, 0));

    let mut lsns = Vec::new();
    for i in 0..4u8 {
        lsns.push(store_a.append(RecordType::Data, &[i; 8]).unwrap());
    }

    // Deliver 0, then 2 and 3 out of order; the replica must ask for 1.
    for &i in &[0usize, 2, 3] {
        let rec = store_a.read(lsns[i]).unwrap();
        replica
            .process_message(
                PEER_EID,
                RepMessage::Log {
                    lsn: rec.lsn(),
                    rec_type: rec.rec_type(),
                    flags: rep_flags::RESEND,
                    payload: rec.payload().to_vec(),
                },
            )
            .unwrap();
    }
    let requests = rs.take();
    assert!(requests
        .iter()
        .any(|(_, m)| matches!(m, RepMessage::LogReq { .. })));

    // Let the request round-trip; everything drains.
    for (_, msg) in requests {
        primary.process_message(PEER_EID, msg).unwrap();
    }
    pump(&primary, &ps, &replica, &rs);
    assert_eq!(store_b.head_lsn(), store_a.head_lsn());
    assert_eq!(walk_lsns(&store_b), walk_lsns(&store_a));
    assert_eq!(replica.gap().ready_lsn(), store_b.head_lsn());
}

/// # Case 6: a retransmitted record is an idempotent no-op
#[test]
fn test_duplicate_is_noop() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    let (primary, ps) = primary_engine(store_a.clone(), rep_settings(0, 0));
    let (replica, rs) = replica_engine(store_b.clone(), rep_settings(0, 0));

    store_a.append(RecordType::Data, &[1; 8]).unwrap();
    primary
        .process_message(PEER_EID, RepMessage::AllReq { from: Lsn::ZERO })
        .unwrap();
    let trace = pump(&primary, &ps, &replica, &rs);
    let head = store_b.head_lsn();

    // Replay the whole stream.
    for msg in trace {
        if matches!(msg, RepMessage::Log { .. }) {
            replica.process_message(PEER_EID, msg).unwrap();
        }
    }
    assert_eq!(store_b.head_lsn(), head);
    assert!(rs.take().is_empty(), "duplicates must not trigger requests");
}

/// # Case 7: a cold-start request against a log whose first files are
/// gone is answered with verify-fail, not a silently incomplete stream
#[test]
fn test_cold_start_against_trimmed_log() {
    let dir = TempDir::new().unwrap();
    let settings = LogSettings {
        dir: dir.path().to_path_buf(),
        max_file_size: 96,
        sync: SyncPolicy::Batched,
        file_mode: 0o600,
    };
    {
        let store = LogStore::open(settings.clone()).unwrap();
        for i in 0..10u8 {
            store.append(RecordType::Data, &[i; 24]).unwrap();
        }
        assert!(store.head_lsn().file >= 4);
        store.flush().unwrap();
    }
    // Log archiving (external to this subsystem) removed files 1..3.
    for file in 1..4u32 {
        std::fs::remove_file(dir.path().join(format!("log.{:010}", file))).unwrap();
    }

    let store = Arc::new(LogStore::open(settings).unwrap());
    assert_eq!(store.first_lsn().file, 4);
    let (primary, ps) = primary_engine(store, rep_settings(0, 0));

    primary.serve_all_request(PEER_EID, Lsn::ZERO).unwrap();
    let sent = ps.take();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].1, RepMessage::VerifyFail { .. }));
}

/// # Case 8: a relay holding only part of a requested range propagates
/// the miss; the primary treats its own log end as the natural stop
#[test]
fn test_relay_partial_range_propagates_miss() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, 1024 * 1024);
    let mut lsns = Vec::new();
    for i in 0..3u8 {
        lsns.push(store.append(RecordType::Data, &[i; 8]).unwrap());
    }
    let beyond = Lsn::new(1, store.head_lsn().offset + 1000);

    // As a relay (not primary), the partial range is a hard miss.
    let (relay, _rsend) = replica_engine(store.clone(), rep_settings(0, 0));
    match relay.serve_log_request(PEER_EID, lsns[1], Some(beyond)) {
        Err(Error::Storage(StorageError::NotFound { .. })) => {}
        other => panic!("expected NotFound from relay, got {:?}", other),
    }

    // As the primary, reaching its own log end is simply the end.
    let (primary, _psend) = primary_engine(store, rep_settings(0, 0));
    primary
        .serve_log_request(PEER_EID, lsns[1], Some(beyond))
        .unwrap();
}

/// # Case 9: mid-election, a log-more pause asks who the primary is
/// instead of requesting records from nobody
#[test]
fn test_log_more_without_primary_queries() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, 1024 * 1024);
    let sender = VecSender::default();
    let election = Arc::new(SharedElectionView::new(
        2,
        ElectionSnapshot {
            primary: None,
            generation: 1,
        },
    ));
    let engine = ReplicationEngine::new(store, election, sender.clone(), rep_settings(0, 0));

    engine
        .process_message(
            PEER_EID,
            RepMessage::LogMore {
                lsn: Lsn::new(1, 16),
                rec_type: RecordType::Data,
                flags: 0,
                payload: vec![7; 8],
            },
        )
        .unwrap();

    let sent = sender.take();
    assert!(sent
        .iter()
        .any(|(d, m)| *d == Destination::Broadcast && matches!(m, RepMessage::PrimaryQuery)));
    assert!(
        !sent
            .iter()
            .any(|(_, m)| matches!(m, RepMessage::AllReq { .. } | RepMessage::LogReq { .. })),
        "gap requests are suppressed while no primary is known"
    );
}

/// # Case 10: a verify-fail reply surfaces as an outdated-client error
#[test]
fn test_verify_fail_surfaces() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, 1024 * 1024);
    let sender = VecSender::default();
    let mut election = MockElectionView::new();
    election.expect_self_eid().return_const(2u32);
    election.expect_primary().return_const(Some(PEER_EID));
    election.expect_generation().return_const(1u32);
    let engine =
        ReplicationEngine::new(store, Arc::new(election), sender.clone(), rep_settings(0, 0));

    match engine.process_message(PEER_EID, RepMessage::VerifyFail { lsn: Lsn::new(4, 16) }) {
        Err(Error::Replication(ReplicationError::OutdatedClient { file: 4, .. })) => {}
        other => panic!("expected OutdatedClient, got {:?}", other),
    }
}

/// # Case 11: the primary commit path broadcasts the record with the
/// needs-ack flag set
#[test]
fn test_append_broadcasts_needs_ack() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, 1024 * 1024);
    let (primary, ps) = primary_engine(store, rep_settings(0, 0));

    let (lsn, outcome) = primary.append(RecordType::Commit, b"commit!").unwrap();
    assert_eq!(outcome, SendOutcome { sites: 1, peers: 1 });

    let sent = ps.take();
    assert_eq!(sent.len(), 1);
    let (dest, msg) = &sent[0];
    assert_eq!(*dest, Destination::Broadcast);
    let RepMessage::Log {
        lsn: sent_lsn,
        flags,
        ..
    } = msg
    else {
        panic!("expected a log record");
    };
    assert_eq!(*sent_lsn, lsn);
    assert!(flags & rep_flags::NEEDS_ACK != 0);
}

/// # Case 12: applying a needs-ack record acknowledges the highest one
/// that became contiguous
#[test]
fn test_ack_emitted_for_commit() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = store_with(&dir_a, 1024 * 1024);
    let store_b = store_with(&dir_b, 1024 * 1024);
    let (_primary, _ps) = primary_engine(store_a.clone(), rep_settings(0, 0));
    let (replica, rs) = replica_engine(store_b, rep_settings(0, 0));

    store_a.append(RecordType::Data, &[0; 8]).unwrap();
    let commit = store_a.append(RecordType::Commit, &[1; 8]).unwrap();

    for lsn in walk_lsns(&store_a) {
        let rec = store_a.read(lsn).unwrap();
        let mut flags = rep_flags::RESEND;
        if rec.rec_type().needs_ack() {
            flags |= rep_flags::NEEDS_ACK;
        }
        replica
            .process_message(
                PEER_EID,
                RepMessage::Log {
                    lsn,
                    rec_type: rec.rec_type(),
                    flags,
                    payload: rec.payload().to_vec(),
                },
            )
            .unwrap();
    }

    let acks = rs.take_acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, PEER_EID);
    assert_eq!(acks[0].1.lsn, commit);
    assert_eq!(acks[0].1.generation, 1);
}
