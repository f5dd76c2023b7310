// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive-side transaction state
//!
//! One [`Transaction`] tracks a single inbound file transfer from first
//! PDU to retirement. The per-class behavior lives in [`r1`] (best-effort)
//! and [`r2`] (acknowledged); [`tick`] drives everything time-based.
//!
//! ## Substates
//!
//! ```text
//!                      MD                       EOF (no gaps, after
//!  AwaitingMetadata ───────► ReceivingFileData   checksum pass)
//!        │  FD/EOF: temp file,     │    EOF ┌──────────────────┐
//!        │  NAK for metadata       ▼        ▼                  │
//!        │                   AwaitingEof  AwaitingGapFill ──► SendingFin
//!        │                   (all provisional data,  │ FIN      │
//!        └──────────────────► seen, EOF pending)     ▼          ▼
//!                                            NAK / FD fill  AwaitingFinAck
//!                                                               │ FIN-ACK
//!                                                               ▼
//!                                                            Finished
//! ```
//!
//! Multiple `send_*` signals may be pending at once inside one substate
//! (EOF arriving with gaps leaves both the EOF-ACK and a NAK to emit), so
//! they are independent flags rather than substates of their own.

pub(crate) mod r1;
pub(crate) mod r2;
pub(crate) mod tick;

use std::path::PathBuf;

use crate::channel::{ChannelStats, Outbox};
use crate::checksum::FileChecksum;
use crate::chunks::ChunkList;
use crate::config::{ChannelConfig, EngineConfig};
use crate::events::RxEvent;
use crate::filestore::{FileSink, FilestoreError};
use crate::pdu::{ConditionCode, ServiceClass, TransactionId};
use crate::timer::Timer;

/// Receiver-side phase of a transaction.
///
/// `Finished` doubles as the pool's free-slot marker: a slot is available
/// exactly when its transaction is `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSubstate {
    /// Nothing (or only file data / EOF) received; metadata outstanding.
    AwaitingMetadata,
    /// Metadata processed; file data arriving.
    ReceivingFileData,
    /// All data up to the provisional (metadata) size received; EOF
    /// outstanding. Handled identically to `ReceivingFileData`.
    AwaitingEof,
    /// EOF processed; filling gaps and/or running the checksum pass.
    AwaitingGapFill,
    /// Terminal condition decided; FIN queued for transmission.
    SendingFin,
    /// FIN transmitted; waiting for the sender's FIN-ACK.
    AwaitingFinAck,
    /// Retired (slot free).
    Finished,
}

/// Pending-work and history flags, independent of substate.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RxFlags {
    pub md_received: bool,
    pub eof_received: bool,
    /// EOF-ACK queued for emission.
    pub send_ack: bool,
    /// NAK queued for emission.
    pub send_nak: bool,
    /// FIN (re)queued for emission.
    pub send_fin: bool,
    /// At least one NAK has gone out.
    pub nak_sent: bool,
    pub inactivity_fired: bool,
    /// Metadata + EOF + no gaps: checksum pass scheduled/running.
    pub complete: bool,
    pub crc_done: bool,
    pub canceled: bool,
}

/// Outcome of one background-checksum step.
#[derive(Debug)]
pub(crate) enum CrcStep {
    /// More bytes remain; budget for this wakeup is spent.
    Pending,
    /// Whole file digested; value is the computed checksum.
    Done(u32),
    /// Read failed; the transaction must fail with Filestore Rejection.
    Failed(FilestoreError),
}

/// One receive transaction (a pool slot).
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) class: ServiceClass,
    pub(crate) substate: RxSubstate,
    /// Expected file size: provisional from metadata, firm from EOF.
    pub(crate) fsize: u64,
    /// Sum of accepted, non-duplicate file-data fragment lengths.
    pub(crate) bytes_received: u64,
    pub(crate) chunks: ChunkList,
    pub(crate) sink: Option<FileSink>,
    pub(crate) checksum: FileChecksum,
    /// Read cursor of the background checksum pass.
    pub(crate) crc_cursor: u64,
    pub(crate) eof_crc: u32,
    pub(crate) eof_condition: ConditionCode,
    pub(crate) source_name: String,
    pub(crate) dest_name: PathBuf,
    /// Terminal condition code (NoError until something goes wrong).
    pub(crate) condition: ConditionCode,
    pub(crate) flags: RxFlags,
    pub(crate) ack_timer: Timer,
    pub(crate) nak_timer: Timer,
    pub(crate) inactivity_timer: Timer,
    pub(crate) ack_retries_left: u8,
    pub(crate) nak_retries_left: u8,
}

impl Transaction {
    /// Create an idle pool slot with its range set preallocated.
    pub(crate) fn idle(nak_max_segments: usize) -> Self {
        Self {
            id: TransactionId::default(),
            class: ServiceClass::Class1,
            substate: RxSubstate::Finished,
            fsize: 0,
            bytes_received: 0,
            chunks: ChunkList::new(nak_max_segments),
            sink: None,
            checksum: FileChecksum::new(),
            crc_cursor: 0,
            eof_crc: 0,
            eof_condition: ConditionCode::NoError,
            source_name: String::new(),
            dest_name: PathBuf::new(),
            condition: ConditionCode::NoError,
            flags: RxFlags::default(),
            ack_timer: Timer::default(),
            nak_timer: Timer::default(),
            inactivity_timer: Timer::default(),
            ack_retries_left: 0,
            nak_retries_left: 0,
        }
    }

    /// Bind a free slot to a new transaction and arm its timers.
    pub(crate) fn activate(
        &mut self,
        id: TransactionId,
        class: ServiceClass,
        engine: &EngineConfig,
        chan: &ChannelConfig,
    ) {
        debug_assert!(!self.is_active());
        self.id = id;
        self.class = class;
        self.substate = RxSubstate::AwaitingMetadata;
        self.condition = ConditionCode::NoError;
        self.inactivity_timer
            .arm_secs(chan.inactivity_timer_s, engine.ticks_per_second);
        self.nak_timer
            .arm_secs(chan.nak_timer_s, engine.ticks_per_second);
        self.ack_retries_left = chan.ack_limit;
        self.nak_retries_left = chan.nak_limit;
        log::debug!("[rx] txn={id} started ({class:?})");
    }

    /// Return the slot to the pool, releasing every owned resource.
    ///
    /// Dropping a still-temp sink unlinks its file; a final file is left
    /// in place.
    pub(crate) fn reset(&mut self) {
        self.sink = None;
        self.chunks.clear();
        self.checksum.reset();
        self.flags = RxFlags::default();
        self.fsize = 0;
        self.bytes_received = 0;
        self.crc_cursor = 0;
        self.eof_crc = 0;
        self.eof_condition = ConditionCode::NoError;
        self.source_name.clear();
        self.dest_name.clear();
        self.ack_timer = Timer::default();
        self.nak_timer = Timer::default();
        self.inactivity_timer = Timer::default();
        self.ack_retries_left = 0;
        self.nak_retries_left = 0;
        self.substate = RxSubstate::Finished;
    }

    /// Any PDU for this transaction counts as liveness.
    pub(crate) fn touch(&mut self, engine: &EngineConfig, chan: &ChannelConfig) {
        self.inactivity_timer
            .arm_secs(chan.inactivity_timer_s, engine.ticks_per_second);
    }

    /// Advance the background checksum pass by at most `budget` bytes.
    ///
    /// Reads the reassembled file back in 1024-byte slices so a large
    /// per-wakeup budget still uses a fixed buffer.
    pub(crate) fn crc_step(&mut self, budget: u64) -> CrcStep {
        let mut buf = [0u8; crate::config::CRC_CHUNK_ALIGN as usize];
        let mut remaining = budget;
        while remaining > 0 && self.crc_cursor < self.fsize {
            let want = remaining
                .min(buf.len() as u64)
                .min(self.fsize - self.crc_cursor) as usize;
            let Some(sink) = self.sink.as_mut() else {
                return CrcStep::Failed(FilestoreError::Read {
                    path: PathBuf::new(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no sink"),
                });
            };
            match sink.read_at(self.crc_cursor, &mut buf[..want]) {
                Ok(n) if n == want => {
                    self.checksum.digest(&buf[..n]);
                    self.crc_cursor += n as u64;
                    remaining -= n as u64;
                }
                Ok(n) => {
                    // Shorter file than the range set claims.
                    return CrcStep::Failed(FilestoreError::Read {
                        path: sink.path().to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("short read at {} ({n}/{want})", self.crc_cursor),
                        ),
                    });
                }
                Err(e) => return CrcStep::Failed(e),
            }
        }
        if self.crc_cursor >= self.fsize {
            CrcStep::Done(self.checksum.finalize())
        } else {
            CrcStep::Pending
        }
    }

    // ------------------------------------------------------------------
    // Read-only inspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn class(&self) -> ServiceClass {
        self.class
    }

    #[must_use]
    pub fn substate(&self) -> RxSubstate {
        self.substate
    }

    /// Terminal (or pending-terminal) condition code.
    #[must_use]
    pub fn condition(&self) -> ConditionCode {
        self.condition
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Expected file size; 0 until metadata or EOF declared one.
    #[must_use]
    pub fn expected_file_size(&self) -> u64 {
        self.fsize
    }

    /// Received byte ranges (Class 2 only; Class 1 does not track them).
    #[must_use]
    pub fn received_ranges(&self) -> &ChunkList {
        &self.chunks
    }

    /// Source file name announced by metadata (empty until then).
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// A cancel, local or peer-initiated, has been recorded.
    #[must_use]
    pub fn canceled(&self) -> bool {
        self.flags.canceled
    }

    /// Occupies a pool slot (anything but `Finished`).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.substate != RxSubstate::Finished
    }
}

/// Everything a state-machine handler needs besides the transaction:
/// borrowed configuration plus the channel's outbox and statistics.
///
/// Passed explicitly; there is no process-wide state.
pub(crate) struct RxContext<'a> {
    pub engine: &'a EngineConfig,
    pub chan: &'a ChannelConfig,
    pub outbox: &'a mut Outbox,
    pub stats: &'a mut ChannelStats,
}

impl RxContext<'_> {
    /// Count and log a named event.
    pub fn emit(&mut self, event: RxEvent, id: TransactionId) {
        self.stats.record_event(event);
        if event == RxEvent::FdRecv {
            log::debug!("[rx] {event} txn={id}");
        } else {
            log::info!("[rx] {event} txn={id}");
        }
    }
}

/// Retire a transaction: count the outcome, then release the slot.
///
/// The single exit point for every path: clean finish, inactivity,
/// retry exhaustion, cancellation, filestore failure.
pub(crate) fn finish(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    if txn.condition == ConditionCode::NoError {
        ctx.stats.completed += 1;
        log::info!("[rx] txn={} finished: {}", txn.id, txn.dest_name.display());
    } else {
        ctx.stats.failed[txn.condition.index()] += 1;
        log::warn!("[rx] txn={} failed: {}", txn.id, txn.condition);
    }
    txn.reset();
}
