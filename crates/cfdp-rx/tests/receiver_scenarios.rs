// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::too_many_lines)] // Scenario walkthroughs
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end receiver scenarios.
//!
//! Drives a [`Channel`] the way the outer scheduler would: deliver decoded
//! PDUs, tick, drain the outbox, and assert on emitted PDUs, filesystem
//! contents, and counters.
//!
//! Scenarios:
//! - Clean Class 1 and Class 2 transfers
//! - Class 2 gap repair via NAK
//! - Metadata arriving after file data (temp-file rename)
//! - Checksum mismatch, NAK retry exhaustion, inactivity
//! - Duplicate-PDU idempotence, NAK budget reload on progress
//! - Round-trip law under a seeded adversarial loss/reorder pattern

use std::collections::VecDeque;
use std::path::PathBuf;

use cfdp_rx::checksum::FileChecksum;
use cfdp_rx::pdu::{
    AckPdu, ConditionCode, DeliveryCode, DirectiveCode, EofPdu, FileDataPdu, FileStatus,
    MetadataPdu, OutgoingPayload, OutgoingPdu, Pdu, PduHeader, PduPayload,
};
use cfdp_rx::{Channel, ChannelConfig, EngineConfig, RxEvent, ServiceClass, TransactionId};

/// `ticks_per_second = 10` everywhere in this suite; timer seconds below
/// convert to ticks with this.
const TPS: u32 = 10;
const NAK_TIMER_TICKS: u32 = 5 * TPS;

const LOCAL_EID: u32 = 2;
const PEER_EID: u32 = 1;

/// Helper: deterministic payload of `size` bytes.
fn make_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

struct Harness {
    channel: Channel,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ChannelConfig {
            ack_timer_s: 5,
            nak_timer_s: 5,
            inactivity_timer_s: 30,
            ack_limit: 3,
            nak_limit: 3,
            rx_max_messages_per_wakeup: 32,
            max_outgoing_messages_per_wakeup: 8,
            max_rx_transactions: 4,
            nak_max_segments: 16,
        })
    }

    fn with_config(chan: ChannelConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineConfig {
            ticks_per_second: TPS,
            rx_crc_calc_bytes_per_wakeup: 4096,
            tmp_dir: dir.path().to_path_buf(),
            local_eid: LOCAL_EID,
        };
        let channel = Channel::new(engine, chan).unwrap();
        Self { channel, dir }
    }

    fn dest(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn header(&self, seq: u32, class: ServiceClass) -> PduHeader {
        PduHeader {
            class,
            source: PEER_EID,
            destination: LOCAL_EID,
            sequence: seq,
        }
    }

    fn md(&mut self, seq: u32, class: ServiceClass, size: u64, name: &str) {
        let dest_name = self.dest(name).to_string_lossy().into_owned();
        let pdu = Pdu {
            header: self.header(seq, class),
            payload: PduPayload::Metadata(MetadataPdu {
                file_size: size,
                source_name: format!("/sender/{name}"),
                dest_name,
                options: Vec::new(),
            }),
        };
        self.channel.recv(&pdu);
    }

    fn fd(&mut self, seq: u32, class: ServiceClass, offset: u64, data: &[u8]) {
        let pdu = Pdu {
            header: self.header(seq, class),
            payload: PduPayload::FileData(FileDataPdu { offset, data }),
        };
        self.channel.recv(&pdu);
    }

    fn eof(&mut self, seq: u32, class: ServiceClass, size: u64, checksum: u32) {
        self.eof_cc(seq, class, ConditionCode::NoError, size, checksum);
    }

    fn eof_cc(&mut self, seq: u32, class: ServiceClass, cc: ConditionCode, size: u64, crc: u32) {
        let pdu = Pdu {
            header: self.header(seq, class),
            payload: PduPayload::Eof(EofPdu {
                condition: cc,
                file_size: size,
                checksum: crc,
            }),
        };
        self.channel.recv(&pdu);
    }

    fn fin_ack(&mut self, seq: u32) {
        let pdu = Pdu {
            header: self.header(seq, ServiceClass::Class2),
            payload: PduPayload::Ack(AckPdu {
                directive: DirectiveCode::Fin,
                condition: ConditionCode::NoError,
            }),
        };
        self.channel.recv(&pdu);
    }

    /// Tick `n` times, then drain whatever was queued.
    fn ticks(&mut self, n: u32) -> Vec<OutgoingPdu> {
        for _ in 0..n {
            self.channel.tick();
        }
        self.channel.take_outgoing().collect()
    }
}

fn naks(out: &[OutgoingPdu]) -> Vec<&cfdp_rx::pdu::NakPdu> {
    out.iter()
        .filter_map(|p| match &p.payload {
            OutgoingPayload::Nak(n) => Some(n),
            _ => None,
        })
        .collect()
}

fn fins(out: &[OutgoingPdu]) -> Vec<&cfdp_rx::pdu::FinPdu> {
    out.iter()
        .filter_map(|p| match &p.payload {
            OutgoingPayload::Fin(f) => Some(f),
            _ => None,
        })
        .collect()
}

fn acks(out: &[OutgoingPdu]) -> Vec<&AckPdu> {
    out.iter()
        .filter_map(|p| match &p.payload {
            OutgoingPayload::Ack(a) => Some(a),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: clean Class 1 transfer
// ---------------------------------------------------------------------------

#[test]
fn test_clean_class1_transfer() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class1, 1024, "a.bin");
    h.fd(1, ServiceClass::Class1, 0, &payload[..512]);
    h.fd(1, ServiceClass::Class1, 512, &payload[512..]);
    h.eof(1, ServiceClass::Class1, 1024, crc);

    // Class 1 retires on EOF, emits nothing.
    let out = h.ticks(5);
    assert!(out.is_empty(), "Class 1 must not emit PDUs: {out:?}");
    assert_eq!(std::fs::read(h.dest("a.bin")).unwrap(), payload);
    assert_eq!(h.channel.stats().completed, 1);
    assert_eq!(h.channel.stats().failed_total(), 0);
    assert_eq!(h.channel.active_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 2: Class 2 with a single lost segment
// ---------------------------------------------------------------------------

#[test]
fn test_class2_single_gap_repair() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 1024, "b.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    // FD(512, 512) lost.
    h.eof(1, ServiceClass::Class2, 1024, crc);

    // EOF-ACK and the gap NAK go out on the next tick, well within 5 s.
    let out = h.ticks(1);
    let a = acks(&out);
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].directive, DirectiveCode::Eof);
    let n = naks(&out);
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].scope_end, 1024);
    assert_eq!(n[0].segments.len(), 1);
    assert_eq!((n[0].segments[0].start, n[0].segments[0].end), (512, 1024));

    // Retransmission fills the gap; the checksum pass runs, then FIN.
    h.fd(1, ServiceClass::Class2, 512, &payload[512..]);
    let out = h.ticks(3);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::NoError);
    assert_eq!(f[0].delivery, DeliveryCode::Complete);
    assert_eq!(f[0].file_status, FileStatus::Retained);

    h.fin_ack(1);
    assert_eq!(std::fs::read(h.dest("b.bin")).unwrap(), payload);
    assert_eq!(h.channel.stats().completed, 1);
    assert_eq!(h.channel.active_transactions(), 0);
    assert_eq!(h.channel.stats().event_count(RxEvent::FinAckRecv), 1);
}

// ---------------------------------------------------------------------------
// Scenario 3: metadata arrives after file data
// ---------------------------------------------------------------------------

#[test]
fn test_metadata_late_arrival() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);

    // Data accumulates in a temp file, and the metadata request (0, 0)
    // goes out before metadata arrives.
    let out = h.ticks(1);
    let n = naks(&out);
    assert_eq!(n.len(), 1);
    assert_eq!(n[0].segments.len(), 1);
    assert_eq!((n[0].segments[0].start, n[0].segments[0].end), (0, 0));
    let tmp_files: Vec<_> = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert_eq!(tmp_files.len(), 1, "expected one temp file");

    h.fd(1, ServiceClass::Class2, 512, &payload[512..]);
    h.md(1, ServiceClass::Class2, 1024, "c.bin");

    // Temp renamed to the final destination on metadata arrival.
    assert!(h.dest("c.bin").exists());
    let tmp_left = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(tmp_left, 0, "temp file must be gone after rename");

    h.eof(1, ServiceClass::Class2, 1024, crc);
    let out = h.ticks(3);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::NoError);

    h.fin_ack(1);
    assert_eq!(std::fs::read(h.dest("c.bin")).unwrap(), payload);
    assert_eq!(h.channel.stats().completed, 1);
}

// ---------------------------------------------------------------------------
// Scenario 4: checksum mismatch
// ---------------------------------------------------------------------------

#[test]
fn test_checksum_mismatch_class2() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let bad_crc = FileChecksum::of(&payload) ^ 0xDEAD_BEEF;

    h.md(1, ServiceClass::Class2, 1024, "d.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    h.fd(1, ServiceClass::Class2, 512, &payload[512..]);
    h.eof(1, ServiceClass::Class2, 1024, bad_crc);

    let out = h.ticks(3);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::FileChecksumFailure);
    assert_eq!(f[0].delivery, DeliveryCode::Incomplete);
    assert_eq!(h.channel.stats().event_count(RxEvent::CrcMismatch), 1);

    h.fin_ack(1);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::FileChecksumFailure),
        1
    );
}

#[test]
fn test_checksum_mismatch_class1() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let bad_crc = FileChecksum::of(&payload) ^ 1;

    h.md(1, ServiceClass::Class1, 1024, "d1.bin");
    h.fd(1, ServiceClass::Class1, 0, &payload[..512]);
    h.fd(1, ServiceClass::Class1, 512, &payload[512..]);
    h.eof(1, ServiceClass::Class1, 1024, bad_crc);

    assert_eq!(h.channel.stats().event_count(RxEvent::CrcMismatch), 1);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::FileChecksumFailure),
        1
    );
    assert_eq!(h.channel.active_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 5: NAK retry exhaustion
// ---------------------------------------------------------------------------

#[test]
fn test_nak_retry_exhaustion() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 1024, "e.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    // The rest of the file never arrives.
    h.eof(1, ServiceClass::Class2, 1024, crc);

    // First NAK immediately, then one per NAK timer period; the third
    // expiry with an empty budget terminates the transaction.
    let mut all = h.ticks(1);
    for _ in 0..3 {
        all.extend(h.ticks(NAK_TIMER_TICKS));
    }
    assert_eq!(naks(&all).len(), 3, "nak_limit NAKs total: {all:?}");
    let f = fins(&all);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::CheckLimitReached);
    assert_eq!(
        h.channel.stats().event_count(RxEvent::CheckLimitReached),
        1
    );

    h.fin_ack(1);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::CheckLimitReached),
        1
    );
}

// ---------------------------------------------------------------------------
// Scenario 6: inactivity
// ---------------------------------------------------------------------------

#[test]
fn test_inactivity_abandons_transaction() {
    let mut h = Harness::new();

    h.md(1, ServiceClass::Class2, 1024, "f.bin");
    assert_eq!(h.channel.active_transactions(), 1);

    // 30 s at 10 ticks/s with no further PDUs.
    let out = h.ticks(30 * TPS);
    assert!(fins(&out).is_empty(), "inactivity resets without FIN");
    assert_eq!(h.channel.stats().event_count(RxEvent::Inactivity), 1);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::InactivityDetected),
        1
    );
    assert_eq!(h.channel.active_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Duplicates and retry-budget reload
// ---------------------------------------------------------------------------

#[test]
fn test_duplicate_pdus_are_idempotent() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 1024, "g.bin");
    h.md(1, ServiceClass::Class2, 1024, "g.bin"); // duplicate MD: ignored
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]); // duplicate FD: merged
    h.fd(1, ServiceClass::Class2, 512, &payload[512..]);
    h.eof(1, ServiceClass::Class2, 1024, crc);

    let out = h.ticks(1);
    assert_eq!(acks(&out).len(), 1);

    // A duplicate EOF in a later wakeup is re-ACKed without disturbing
    // the transaction.
    h.eof(1, ServiceClass::Class2, 1024, crc);
    let out = h.ticks(2);
    assert_eq!(acks(&out).len(), 1, "duplicate EOF gets its own EOF-ACK");
    assert_eq!(fins(&out).len(), 1);
    assert_eq!(h.channel.stats().duplicate_file_data, 1);
    assert_eq!(h.channel.stats().duplicate_data_mismatches, 0);

    let txn = h.channel.transaction(TransactionId::new(PEER_EID, 1)).unwrap();
    assert_eq!(txn.bytes_received(), 1024);

    h.fin_ack(1);
    assert_eq!(std::fs::read(h.dest("g.bin")).unwrap(), payload);
    assert_eq!(h.channel.stats().completed, 1);
}

#[test]
fn test_file_data_reloads_nak_budget() {
    let mut h = Harness::new();
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 1024, "h.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..256]);
    h.eof(1, ServiceClass::Class2, 1024, crc);

    // Burn the whole NAK budget...
    let mut all = h.ticks(1);
    all.extend(h.ticks(NAK_TIMER_TICKS));
    all.extend(h.ticks(NAK_TIMER_TICKS));
    assert_eq!(naks(&all).len(), 3);

    // ...then make progress: the budget reloads and NAKs keep flowing
    // instead of hitting the check limit.
    h.fd(1, ServiceClass::Class2, 256, &payload[256..512]);
    let out = h.ticks(NAK_TIMER_TICKS);
    assert_eq!(naks(&out).len(), 1);
    assert_eq!(
        h.channel.stats().event_count(RxEvent::CheckLimitReached),
        0
    );

    // Finish the transfer cleanly.
    h.fd(1, ServiceClass::Class2, 512, &payload[512..]);
    let out = h.ticks(3);
    assert_eq!(fins(&out).len(), 1);
    h.fin_ack(1);
    assert_eq!(h.channel.stats().completed, 1);
}

// ---------------------------------------------------------------------------
// FIN retransmission and cancellation
// ---------------------------------------------------------------------------

#[test]
fn test_fin_resent_until_acknowledged() {
    let mut h = Harness::new();
    let payload = make_payload(512);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 512, "i.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload);
    h.eof(1, ServiceClass::Class2, 512, crc);

    let out = h.ticks(3);
    assert_eq!(fins(&out).len(), 1);

    // No FIN-ACK: the ACK timer resends the FIN.
    let out = h.ticks(5 * TPS);
    assert_eq!(fins(&out).len(), 1, "one FIN per ACK timer period");

    h.fin_ack(1);
    assert_eq!(h.channel.stats().completed, 1);
    assert_eq!(h.channel.active_transactions(), 0);
}

#[test]
fn test_fin_retry_exhaustion_terminates() {
    let mut h = Harness::new();
    let payload = make_payload(512);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 512, "j.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload);
    h.eof(1, ServiceClass::Class2, 512, crc);

    // FIN never acknowledged: initial send plus ack_limit resends, then
    // the transaction retires with Check Limit Reached.
    let all = h.ticks(30 * TPS);
    assert_eq!(fins(&all).len(), 4);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::CheckLimitReached),
        1
    );
    assert_eq!(h.channel.active_transactions(), 0);
}

#[test]
fn test_local_cancel_class2_runs_fin_handshake() {
    let mut h = Harness::new();
    let payload = make_payload(1024);

    h.md(1, ServiceClass::Class2, 1024, "k.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);

    assert!(h.channel.cancel(TransactionId::new(PEER_EID, 1)));
    let out = h.ticks(1);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::CancelRequestReceived);
    assert_eq!(h.channel.stats().event_count(RxEvent::Cancel), 1);

    h.fin_ack(1);
    assert_eq!(
        h.channel
            .stats()
            .failed_count(ConditionCode::CancelRequestReceived),
        1
    );
}

#[test]
fn test_peer_cancel_via_eof_condition() {
    let mut h = Harness::new();
    let payload = make_payload(1024);

    h.md(1, ServiceClass::Class2, 1024, "l.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    h.eof_cc(
        1,
        ServiceClass::Class2,
        ConditionCode::CancelRequestReceived,
        0,
        0,
    );

    let out = h.ticks(1);
    assert_eq!(acks(&out).len(), 1, "canceling EOF is still ACKed");
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::CancelRequestReceived);
    assert_eq!(f[0].delivery, DeliveryCode::Incomplete);
}

#[test]
fn test_filestore_rejection_sends_fin() {
    let mut h = Harness::new();
    let payload = make_payload(256);

    // Destination inside a directory that does not exist.
    let bad = h.dest("no-such-dir").join("m.bin");
    let pdu = Pdu {
        header: h.header(1, ServiceClass::Class2),
        payload: PduPayload::Metadata(MetadataPdu {
            file_size: 256,
            source_name: "/sender/m.bin".into(),
            dest_name: bad.to_string_lossy().into_owned(),
            options: Vec::new(),
        }),
    };
    h.channel.recv(&pdu);
    h.fd(1, ServiceClass::Class2, 0, &payload);

    let out = h.ticks(1);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::FilestoreRejection);
    assert_eq!(f[0].file_status, FileStatus::Discarded);
    assert_eq!(h.channel.stats().event_count(RxEvent::FilestoreReject), 1);
}

// ---------------------------------------------------------------------------
// EOF size disagreement
// ---------------------------------------------------------------------------

#[test]
fn test_data_beyond_eof_size_fails() {
    let mut h = Harness::new();
    let payload = make_payload(1024);

    h.md(1, ServiceClass::Class2, 1024, "n.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload);
    // EOF claims the file is shorter than what already arrived.
    h.eof(1, ServiceClass::Class2, 512, 0);

    let out = h.ticks(1);
    let f = fins(&out);
    assert_eq!(f.len(), 1);
    assert_eq!(f[0].condition, ConditionCode::FileSizeError);
}

// ---------------------------------------------------------------------------
// Outgoing quota
// ---------------------------------------------------------------------------

#[test]
fn test_outgoing_quota_defers_pdus() {
    let mut h = Harness::with_config(ChannelConfig {
        max_outgoing_messages_per_wakeup: 1,
        ..ChannelConfig::default()
    });
    let payload = make_payload(1024);
    let crc = FileChecksum::of(&payload);

    h.md(1, ServiceClass::Class2, 1024, "o.bin");
    h.fd(1, ServiceClass::Class2, 0, &payload[..512]);
    h.eof(1, ServiceClass::Class2, 1024, crc);

    // ACK and NAK are both pending but only one PDU fits per wakeup.
    let out = h.ticks(1);
    assert_eq!(out.len(), 1);
    assert_eq!(acks(&out).len(), 1);
    let out = h.ticks(1);
    assert_eq!(out.len(), 1);
    assert_eq!(naks(&out).len(), 1);
}

// ---------------------------------------------------------------------------
// Round-trip law: adversarial loss, reordering, duplication
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_under_adversarial_loss() {
    let mut rng = fastrand::Rng::with_seed(0x5EED);
    let mut h = Harness::new();
    let payload = make_payload(8000);
    let crc = FileChecksum::of(&payload);
    const SEG: usize = 500;

    // Sender-side queue of (offset, len); None entries stand for MD/EOF.
    #[derive(Clone, Copy, PartialEq)]
    enum Item {
        Md,
        Fd(usize),
        Eof,
    }
    let mut queue: VecDeque<Item> = VecDeque::new();
    queue.push_back(Item::Md);
    let mut offsets: Vec<usize> = (0..payload.len()).step_by(SEG).collect();
    rng.shuffle(&mut offsets);
    for off in offsets {
        queue.push_back(Item::Fd(off));
    }
    queue.push_back(Item::Eof);

    let mut first_pass = true;
    let mut eof_delivered = false;
    let mut steps = 0u32;
    while h.channel.stats().completed == 0 {
        steps += 1;
        assert!(steps < 5000, "transfer did not converge");

        // Deliver a few items; on the first pass each may be "lost".
        for _ in 0..4 {
            let Some(item) = queue.pop_front() else { break };
            if first_pass && rng.bool() {
                continue; // lost on the air; retransmission brings it back
            }
            // Occasional duplicate delivery.
            let times = if rng.u8(0..10) == 0 { 2 } else { 1 };
            for _ in 0..times {
                match item {
                    Item::Md => h.md(9, ServiceClass::Class2, payload.len() as u64, "big.bin"),
                    Item::Fd(off) => {
                        let end = (off + SEG).min(payload.len());
                        h.fd(9, ServiceClass::Class2, off as u64, &payload[off..end]);
                    }
                    Item::Eof => {
                        h.eof(9, ServiceClass::Class2, payload.len() as u64, crc);
                        eof_delivered = true;
                    }
                }
            }
        }
        if queue.is_empty() {
            first_pass = false;
            // A real sender re-sends EOF from its own ACK timer until the
            // EOF-ACK comes back; NAKs cannot ask for a lost EOF.
            if !eof_delivered {
                queue.push_back(Item::Eof);
            }
        }

        h.channel.tick();
        for out in h.channel.take_outgoing().collect::<Vec<_>>() {
            match out.payload {
                OutgoingPayload::Nak(nak) => {
                    for seg in &nak.segments {
                        if (seg.start, seg.end) == (0, 0) {
                            if !queue.contains(&Item::Md) {
                                queue.push_back(Item::Md);
                            }
                            continue;
                        }
                        let mut off = (seg.start as usize / SEG) * SEG;
                        while (off as u64) < seg.end {
                            if !queue.contains(&Item::Fd(off)) {
                                queue.push_back(Item::Fd(off));
                            }
                            off += SEG;
                        }
                    }
                    if !queue.contains(&Item::Eof) {
                        queue.push_back(Item::Eof);
                    }
                }
                OutgoingPayload::Fin(fin) => {
                    assert_eq!(fin.condition, ConditionCode::NoError);
                    h.fin_ack(9);
                }
                OutgoingPayload::Ack(_) => {}
            }
        }
    }

    assert_eq!(std::fs::read(h.dest("big.bin")).unwrap(), payload);
    assert_eq!(h.channel.stats().failed_total(), 0);
    assert_eq!(h.channel.active_transactions(), 0);
}
