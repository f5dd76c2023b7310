// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-channel receive engine
//!
//! A channel owns a fixed pool of transaction slots, an outbox, and its
//! statistics; nothing is shared across channels and nothing blocks. The
//! outer scheduler drives it with exactly three calls:
//!
//! - [`Channel::recv`] for every decoded inbound PDU (at most
//!   `rx_max_messages_per_wakeup` are accepted per wakeup, the rest are
//!   dropped and counted),
//! - [`Channel::tick`] once per wakeup (timers, retransmissions, the
//!   background checksum pass; also resets the per-wakeup budgets),
//! - [`Channel::take_outgoing`] to drain queued ACK/NAK/FIN PDUs, in
//!   emission order, into the transmit path.
//!
//! Per-transaction faults never escape these calls; they are recovered to
//! a terminal condition code on the transaction (and a counter here).

use crate::config::{ChannelConfig, ConfigError, EngineConfig};
use crate::events::RxEvent;
use crate::pdu::{ConditionCode, OutgoingPdu, Pdu, PduPayload, ServiceClass, TransactionId};
use crate::recv::{r1, r2, tick, RxContext, Transaction};

/// Queue of PDUs awaiting transmission, with a per-wakeup quota.
#[derive(Debug)]
pub struct Outbox {
    queue: Vec<OutgoingPdu>,
    budget_left: u32,
}

impl Outbox {
    fn new(quota: u32) -> Self {
        let mut outbox = Self {
            queue: Vec::with_capacity(64),
            budget_left: 0,
        };
        outbox.reset_budget(quota);
        outbox
    }

    /// Re-open the per-wakeup window. A quota of 0 means unlimited.
    fn reset_budget(&mut self, quota: u32) {
        self.budget_left = if quota == 0 { u32::MAX } else { quota };
    }

    /// Queue a PDU if the wakeup quota allows it.
    ///
    /// Returning `false` leaves the caller's `send_*` flag set, so the
    /// PDU is retried next wakeup.
    pub(crate) fn try_enqueue(&mut self, pdu: OutgoingPdu) -> bool {
        if self.budget_left == 0 {
            log::debug!("[chan] outgoing quota exhausted, {} deferred", pdu.payload.kind());
            return false;
        }
        self.budget_left -= 1;
        self.queue.push(pdu);
        true
    }

    fn drain(&mut self) -> std::vec::Drain<'_, OutgoingPdu> {
        self.queue.drain(..)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Per-channel counters: PDUs in/out by type, outcomes, named events.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub recv_file_data: u64,
    pub recv_eof: u64,
    pub recv_metadata: u64,
    pub recv_ack: u64,
    pub recv_other: u64,
    /// PDUs whose directive made no sense in the transaction's substate.
    pub recv_unexpected: u64,
    pub sent_ack: u64,
    pub sent_nak: u64,
    pub sent_fin: u64,
    /// Inbound PDUs discarded (budget, no slot, wrong destination, ...).
    pub pdus_dropped: u64,
    /// File-data segments already fully covered by received ranges.
    pub duplicate_file_data: u64,
    /// Duplicate segments whose payload differed from the stored bytes.
    pub duplicate_data_mismatches: u64,
    /// Duplicate metadata PDUs disagreeing with the first one.
    pub metadata_mismatches: u64,
    /// Transactions retired with No Error.
    pub completed: u64,
    /// Transactions retired with an error, indexed per condition code.
    pub failed: [u64; ConditionCode::COUNT],
    events: [u64; RxEvent::COUNT],
}

impl ChannelStats {
    fn count_received(&mut self, payload: &PduPayload<'_>) {
        match payload {
            PduPayload::FileData(_) => self.recv_file_data += 1,
            PduPayload::Eof(_) => self.recv_eof += 1,
            PduPayload::Metadata(_) => self.recv_metadata += 1,
            PduPayload::Ack(_) => self.recv_ack += 1,
            PduPayload::Nak(_) | PduPayload::Fin(_) => self.recv_other += 1,
        }
    }

    pub(crate) fn record_event(&mut self, event: RxEvent) {
        self.events[event.index()] += 1;
    }

    /// How many times a named event fired.
    #[must_use]
    pub fn event_count(&self, event: RxEvent) -> u64 {
        self.events[event.index()]
    }

    /// Failures retired under one condition code.
    #[must_use]
    pub fn failed_count(&self, condition: ConditionCode) -> u64 {
        self.failed[condition.index()]
    }

    /// All failures, any condition.
    #[must_use]
    pub fn failed_total(&self) -> u64 {
        self.failed.iter().sum()
    }
}

/// One receive channel: transaction pool, outbox, statistics.
#[derive(Debug)]
pub struct Channel {
    engine: EngineConfig,
    chan: ChannelConfig,
    pool: Vec<Transaction>,
    outbox: Outbox,
    stats: ChannelStats,
    rx_budget_left: u32,
    sweep_origin: usize,
}

impl Channel {
    /// Validate configuration and allocate the transaction pool.
    ///
    /// This is the only allocation point; slots, range sets, and the
    /// outbox never grow past what is reserved here.
    pub fn new(engine: EngineConfig, chan: ChannelConfig) -> Result<Self, ConfigError> {
        engine.validate()?;
        chan.validate()?;
        let pool = (0..chan.max_rx_transactions)
            .map(|_| Transaction::idle(chan.nak_max_segments))
            .collect();
        let outbox = Outbox::new(chan.max_outgoing_messages_per_wakeup);
        let rx_budget_left = chan.rx_max_messages_per_wakeup;
        Ok(Self {
            engine,
            chan,
            pool,
            outbox,
            stats: ChannelStats::default(),
            rx_budget_left,
            sweep_origin: 0,
        })
    }

    /// Ingest one decoded inbound PDU.
    ///
    /// Routes to the owning transaction, starting one on a free slot when
    /// a transaction-initiating PDU (FD, EOF, MD) arrives for an unknown
    /// id. Never fails: anything unroutable is dropped and counted.
    pub fn recv(&mut self, pdu: &Pdu<'_>) {
        self.stats.count_received(&pdu.payload);

        if self.rx_budget_left == 0 {
            self.stats.pdus_dropped += 1;
            log::debug!("[chan] rx budget exhausted, dropping {}", pdu.payload.kind());
            return;
        }
        self.rx_budget_left -= 1;

        if pdu.header.destination != self.engine.local_eid {
            self.stats.pdus_dropped += 1;
            log::warn!(
                "[chan] PDU for entity {} is not ours ({})",
                pdu.header.destination,
                self.engine.local_eid
            );
            return;
        }

        let id = pdu.header.transaction_id();
        let idx = match self.pool.iter().position(|t| t.is_active() && t.id() == id) {
            Some(idx) => idx,
            None => {
                let initiating = matches!(
                    pdu.payload,
                    PduPayload::FileData(_) | PduPayload::Eof(_) | PduPayload::Metadata(_)
                );
                if !initiating {
                    self.stats.pdus_dropped += 1;
                    log::debug!("[chan] {} for unknown txn={id}", pdu.payload.kind());
                    return;
                }
                let Some(free) = self.pool.iter().position(|t| !t.is_active()) else {
                    self.stats.pdus_dropped += 1;
                    log::warn!("[chan] no free transaction slot for txn={id}");
                    return;
                };
                self.pool[free].activate(id, pdu.header.class, &self.engine, &self.chan);
                free
            }
        };

        let Self {
            engine,
            chan,
            pool,
            outbox,
            stats,
            ..
        } = self;
        let txn = &mut pool[idx];
        let mut ctx = RxContext {
            engine,
            chan,
            outbox,
            stats,
        };
        match txn.class() {
            ServiceClass::Class1 => r1::recv(txn, pdu, &mut ctx),
            ServiceClass::Class2 => r2::recv(txn, pdu, &mut ctx),
        }
    }

    /// Per-wakeup sweep: reset budgets, then tick every active
    /// transaction, round-robin so no slot monopolizes the quota.
    pub fn tick(&mut self) {
        self.rx_budget_left = self.chan.rx_max_messages_per_wakeup;
        self.outbox
            .reset_budget(self.chan.max_outgoing_messages_per_wakeup);

        let n = self.pool.len();
        let origin = self.sweep_origin;
        let Self {
            engine,
            chan,
            pool,
            outbox,
            stats,
            ..
        } = self;
        let mut ctx = RxContext {
            engine,
            chan,
            outbox,
            stats,
        };
        for k in 0..n {
            tick::run(&mut pool[(origin + k) % n], &mut ctx);
        }
        self.sweep_origin = (origin + 1) % n;
    }

    /// Request cancellation of an active transaction.
    ///
    /// Class 2 runs the normal FIN handshake with Cancel Request
    /// Received; Class 1 resets immediately. Returns whether the
    /// transaction was found.
    pub fn cancel(&mut self, id: TransactionId) -> bool {
        let Some(idx) = self.pool.iter().position(|t| t.is_active() && t.id() == id) else {
            return false;
        };
        let Self {
            engine,
            chan,
            pool,
            outbox,
            stats,
            ..
        } = self;
        let txn = &mut pool[idx];
        let mut ctx = RxContext {
            engine,
            chan,
            outbox,
            stats,
        };
        match txn.class() {
            ServiceClass::Class1 => r1::cancel(txn, &mut ctx),
            ServiceClass::Class2 => r2::cancel(txn, &mut ctx),
        }
        true
    }

    /// Drain queued outgoing PDUs, oldest first.
    pub fn take_outgoing(&mut self) -> std::vec::Drain<'_, OutgoingPdu> {
        self.outbox.drain()
    }

    /// Outgoing PDUs currently queued.
    #[must_use]
    pub fn outgoing_len(&self) -> usize {
        self.outbox.len()
    }

    #[must_use]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Active transaction count (occupied pool slots).
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.pool.iter().filter(|t| t.is_active()).count()
    }

    /// Inspect an active transaction.
    #[must_use]
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.pool.iter().find(|t| t.is_active() && t.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{EofPdu, FileDataPdu, FinPdu, DeliveryCode, FileStatus, PduHeader};

    fn test_channel(dir: &std::path::Path) -> Channel {
        let engine = EngineConfig {
            tmp_dir: dir.to_path_buf(),
            local_eid: 2,
            ..EngineConfig::default()
        };
        Channel::new(engine, ChannelConfig::default()).unwrap()
    }

    fn header(seq: u32) -> PduHeader {
        PduHeader {
            class: ServiceClass::Class2,
            source: 1,
            destination: 2,
            sequence: seq,
        }
    }

    fn fd_pdu(seq: u32, offset: u64, data: &[u8]) -> Pdu<'_> {
        Pdu {
            header: header(seq),
            payload: PduPayload::FileData(FileDataPdu { offset, data }),
        }
    }

    #[test]
    fn test_initiating_pdu_starts_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut ch = test_channel(dir.path());

        ch.recv(&fd_pdu(1, 0, b"abc"));
        assert_eq!(ch.active_transactions(), 1);
        assert!(ch.transaction(TransactionId::new(1, 1)).is_some());
        assert_eq!(ch.stats().recv_file_data, 1);
    }

    #[test]
    fn test_non_initiating_pdu_for_unknown_txn_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ch = test_channel(dir.path());

        ch.recv(&Pdu {
            header: header(1),
            payload: PduPayload::Fin(FinPdu {
                condition: ConditionCode::NoError,
                delivery: DeliveryCode::Complete,
                file_status: FileStatus::Retained,
            }),
        });
        assert_eq!(ch.active_transactions(), 0);
        assert_eq!(ch.stats().pdus_dropped, 1);
    }

    #[test]
    fn test_wrong_destination_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ch = test_channel(dir.path());

        let mut pdu = fd_pdu(1, 0, b"abc");
        pdu.header.destination = 9;
        ch.recv(&pdu);
        assert_eq!(ch.active_transactions(), 0);
        assert_eq!(ch.stats().pdus_dropped, 1);
    }

    #[test]
    fn test_pool_exhaustion_drops_new_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineConfig {
            tmp_dir: dir.path().to_path_buf(),
            local_eid: 2,
            ..EngineConfig::default()
        };
        let chan = ChannelConfig {
            max_rx_transactions: 1,
            ..ChannelConfig::default()
        };
        let mut ch = Channel::new(engine, chan).unwrap();

        ch.recv(&fd_pdu(1, 0, b"a"));
        ch.recv(&fd_pdu(2, 0, b"b"));
        assert_eq!(ch.active_transactions(), 1);
        assert_eq!(ch.stats().pdus_dropped, 1);
    }

    #[test]
    fn test_rx_budget_enforced_per_wakeup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineConfig {
            tmp_dir: dir.path().to_path_buf(),
            local_eid: 2,
            ..EngineConfig::default()
        };
        let chan = ChannelConfig {
            rx_max_messages_per_wakeup: 2,
            ..ChannelConfig::default()
        };
        let mut ch = Channel::new(engine, chan).unwrap();

        ch.recv(&fd_pdu(1, 0, b"a"));
        ch.recv(&fd_pdu(1, 1, b"b"));
        ch.recv(&fd_pdu(1, 2, b"c")); // over budget
        assert_eq!(ch.stats().pdus_dropped, 1);

        ch.tick(); // budget replenished
        ch.recv(&fd_pdu(1, 3, b"d"));
        assert_eq!(ch.stats().pdus_dropped, 1);
    }

    #[test]
    fn test_eof_ack_emitted_under_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut ch = test_channel(dir.path());

        ch.recv(&Pdu {
            header: header(1),
            payload: PduPayload::Eof(EofPdu {
                condition: ConditionCode::NoError,
                file_size: 4,
                checksum: 0,
            }),
        });
        ch.tick();
        let out: Vec<_> = ch.take_outgoing().collect();
        // EOF-ACK plus the metadata-request NAK.
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].payload, crate::pdu::OutgoingPayload::Ack(_)));
        assert!(matches!(out[1].payload, crate::pdu::OutgoingPayload::Nak(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let engine = EngineConfig {
            rx_crc_calc_bytes_per_wakeup: 1000,
            ..EngineConfig::default()
        };
        assert!(Channel::new(engine, ChannelConfig::default()).is_err());
    }
}
