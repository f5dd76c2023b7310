// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class 2 (acknowledged) receive path
//!
//! R2 must tolerate arbitrary PDU reordering, loss in both directions,
//! metadata arriving after file data, and peer-initiated cancellation.
//! The handlers here mutate the transaction and raise `send_*` flags; the
//! tick driver turns those flags into PDUs under the outgoing quota.
//!
//! Key behaviors:
//!
//! - File data before metadata accumulates in a temp file; metadata
//!   arrival renames it to the real destination. Every such early PDU
//!   raises a NAK carrying the `(0, 0)` metadata-request segment.
//! - EOF is always ACKed, duplicates included. An EOF with a non-NoError
//!   condition code is the sender abandoning the transaction: adopt the
//!   code and go straight to the FIN handshake.
//! - A transaction is complete when metadata and EOF are in and the range
//!   set covers `[0, file_size)`. Completion schedules the background
//!   checksum pass; only its verdict moves the transaction to SendingFin.
//! - Progress resets the NAK budget: any file data PDU reloads
//!   `nak_retries_left`.

use crate::filestore::FileSink;
use crate::pdu::{
    ConditionCode, DeliveryCode, DirectiveCode, EofPdu, FileDataPdu, FileStatus, FinPdu,
    MetadataPdu, NakPdu, Pdu, PduPayload, SegmentRequest,
};
use crate::recv::{finish, RxContext, RxSubstate, Transaction};

/// Dispatch one inbound PDU to the Class 2 handlers.
pub(crate) fn recv(txn: &mut Transaction, pdu: &Pdu<'_>, ctx: &mut RxContext<'_>) {
    txn.touch(ctx.engine, ctx.chan);
    match &pdu.payload {
        PduPayload::Metadata(md) => recv_metadata(txn, md, ctx),
        PduPayload::FileData(fd) => recv_file_data(txn, fd, ctx),
        PduPayload::Eof(eof) => recv_eof(txn, eof, ctx),
        PduPayload::Ack(ack) if ack.directive == DirectiveCode::Fin => recv_fin_ack(txn, ctx),
        other => {
            ctx.stats.recv_unexpected += 1;
            log::debug!(
                "[r2] txn={} dropping {} in {:?}",
                txn.id,
                other.kind(),
                txn.substate
            );
        }
    }
}

/// Record the terminal condition and head for the FIN handshake.
///
/// The first non-NoError condition wins; later faults do not overwrite
/// it. Safe to call from any substate.
pub(crate) fn set_fin_status(txn: &mut Transaction, condition: ConditionCode) {
    if txn.condition == ConditionCode::NoError {
        txn.condition = condition;
    }
    txn.flags.send_fin = true;
    if !matches!(
        txn.substate,
        RxSubstate::SendingFin | RxSubstate::AwaitingFinAck
    ) {
        txn.substate = RxSubstate::SendingFin;
    }
}

/// Fail the transaction on a filestore error, releasing the sink.
pub(crate) fn fail_filestore(
    txn: &mut Transaction,
    ctx: &mut RxContext<'_>,
    err: &crate::filestore::FilestoreError,
) {
    log::error!("[r2] txn={} filestore: {err}", txn.id);
    ctx.emit(crate::events::RxEvent::FilestoreReject, txn.id);
    txn.sink = None;
    set_fin_status(txn, ConditionCode::FilestoreRejection);
}

fn recv_metadata(txn: &mut Transaction, md: &MetadataPdu, ctx: &mut RxContext<'_>) {
    if txn.flags.md_received {
        // First metadata wins; a differing duplicate is suspicious but
        // failing the transfer over it would be worse.
        if txn.dest_name.as_os_str() != std::ffi::OsStr::new(&md.dest_name)
            || (!txn.flags.eof_received && txn.fsize != md.file_size)
        {
            ctx.stats.metadata_mismatches += 1;
            log::warn!(
                "[r2] txn={} duplicate metadata disagrees (dst={}, size={}), keeping first",
                txn.id,
                md.dest_name,
                md.file_size
            );
        }
        return;
    }
    if matches!(
        txn.substate,
        RxSubstate::SendingFin | RxSubstate::AwaitingFinAck
    ) {
        log::debug!("[r2] txn={} late metadata ignored", txn.id);
        return;
    }

    txn.source_name = md.source_name.clone();
    txn.dest_name = std::path::PathBuf::from(&md.dest_name);
    if !txn.flags.eof_received {
        txn.fsize = md.file_size;
    }
    txn.flags.md_received = true;
    if !md.options.is_empty() {
        log::debug!(
            "[r2] txn={} metadata carries {} option TLV(s)",
            txn.id,
            md.options.len()
        );
    }

    match txn.sink.as_mut() {
        None => match FileSink::open_final(&txn.dest_name) {
            Ok(sink) => txn.sink = Some(sink),
            Err(e) => {
                fail_filestore(txn, ctx, &e);
                return;
            }
        },
        Some(sink) if sink.is_temp() => {
            let dest = txn.dest_name.clone();
            if let Err(e) = sink.move_temp_to_final(&dest) {
                fail_filestore(txn, ctx, &e);
                return;
            }
        }
        Some(_) => {}
    }

    ctx.emit(crate::events::RxEvent::MdRecv, txn.id);
    // The metadata request is satisfied; data gaps are re-evaluated below.
    txn.flags.send_nak = false;

    if txn.flags.eof_received {
        txn.substate = RxSubstate::AwaitingGapFill;
        complete_check(txn, true);
    } else if txn.fsize > 0 && txn.chunks.is_contiguous(txn.fsize) {
        txn.substate = RxSubstate::AwaitingEof;
    } else {
        txn.substate = RxSubstate::ReceivingFileData;
    }
}

fn recv_file_data(txn: &mut Transaction, fd: &FileDataPdu<'_>, ctx: &mut RxContext<'_>) {
    if matches!(
        txn.substate,
        RxSubstate::SendingFin | RxSubstate::AwaitingFinAck
    ) {
        log::debug!("[r2] txn={} file data after terminal decision", txn.id);
        return;
    }

    // Progress: the sender is alive and responding, reload the NAK budget.
    txn.nak_retries_left = ctx.chan.nak_limit;

    let end = fd.offset + fd.data.len() as u64;
    if txn.flags.eof_received && end > txn.fsize {
        log::warn!(
            "[r2] txn={} file data to {} beyond EOF size {}",
            txn.id,
            end,
            txn.fsize
        );
        set_fin_status(txn, ConditionCode::FileSizeError);
        return;
    }

    if txn.sink.is_none() {
        match FileSink::open_temp(&ctx.engine.tmp_dir, txn.id) {
            Ok(sink) => txn.sink = Some(sink),
            Err(e) => {
                fail_filestore(txn, ctx, &e);
                return;
            }
        }
    }

    if !fd.data.is_empty() {
        if txn.chunks.covers(fd.offset, end) {
            ctx.stats.duplicate_file_data += 1;
            verify_duplicate(txn, fd, ctx);
        } else if let Some(sink) = txn.sink.as_mut() {
            match sink.write_at(fd.offset, fd.data) {
                Ok(()) => {
                    let added = txn.chunks.insert(fd.offset, end);
                    txn.bytes_received += added;
                }
                Err(e) => {
                    // Transient: the range is not recorded, so the gap
                    // will be re-requested and the segment retransmitted.
                    log::warn!("[r2] txn={} write at {} failed: {e}", txn.id, fd.offset);
                }
            }
        }
    }

    ctx.emit(crate::events::RxEvent::FdRecv, txn.id);
    txn.ack_timer
        .arm_secs(ctx.chan.ack_timer_s, ctx.engine.ticks_per_second);

    match txn.substate {
        RxSubstate::AwaitingMetadata => {
            txn.flags.send_nak = true;
        }
        RxSubstate::ReceivingFileData | RxSubstate::AwaitingEof => {
            if txn.flags.nak_sent {
                complete_check(txn, false);
            }
            if txn.substate == RxSubstate::ReceivingFileData
                && txn.fsize > 0
                && txn.chunks.is_contiguous(txn.fsize)
            {
                txn.substate = RxSubstate::AwaitingEof;
            }
        }
        RxSubstate::AwaitingGapFill => {
            complete_check(txn, false);
        }
        _ => {}
    }
}

/// Compare a fully-duplicate segment against what is on disk.
///
/// Retransmissions legally re-deliver identical bytes; a *differing*
/// payload at an already-written offset is an error event, but the first
/// data wins and the transaction continues.
fn verify_duplicate(txn: &mut Transaction, fd: &FileDataPdu<'_>, ctx: &mut RxContext<'_>) {
    let Some(sink) = txn.sink.as_mut() else {
        return;
    };
    let mut buf = [0u8; crate::config::CRC_CHUNK_ALIGN as usize];
    let mut checked = 0usize;
    while checked < fd.data.len() {
        let want = (fd.data.len() - checked).min(buf.len());
        match sink.read_at(fd.offset + checked as u64, &mut buf[..want]) {
            Ok(n) if n == want => {
                if buf[..n] != fd.data[checked..checked + n] {
                    ctx.stats.duplicate_data_mismatches += 1;
                    log::warn!(
                        "[r2] txn={} duplicate at offset {} differs from stored data",
                        txn.id,
                        fd.offset
                    );
                    return;
                }
                checked += n;
            }
            _ => return, // comparison is best-effort only
        }
    }
}

fn recv_eof(txn: &mut Transaction, eof: &EofPdu, ctx: &mut RxContext<'_>) {
    ctx.emit(crate::events::RxEvent::EofRecv, txn.id);
    // Every EOF, duplicates included, gets an EOF-ACK.
    txn.flags.send_ack = true;
    if txn.flags.eof_received
        || matches!(
            txn.substate,
            RxSubstate::SendingFin | RxSubstate::AwaitingFinAck
        )
    {
        return;
    }

    txn.eof_condition = eof.condition;
    txn.eof_crc = eof.checksum;

    if eof.condition != ConditionCode::NoError {
        // Sender abandoned the transaction; adopt its condition code and
        // go straight to the FIN handshake.
        log::warn!("[r2] txn={} EOF with condition: {}", txn.id, eof.condition);
        ctx.emit(crate::events::RxEvent::Cancel, txn.id);
        txn.flags.canceled = true;
        set_fin_status(txn, eof.condition);
        return;
    }

    txn.flags.eof_received = true;

    if txn.chunks.highest_end() > eof.file_size {
        log::warn!(
            "[r2] txn={} received data to {} beyond EOF size {}",
            txn.id,
            txn.chunks.highest_end(),
            eof.file_size
        );
        set_fin_status(txn, ConditionCode::FileSizeError);
        return;
    }
    if txn.flags.md_received && txn.fsize != eof.file_size {
        log::warn!(
            "[r2] txn={} metadata size {} disagrees with EOF size {}",
            txn.id,
            txn.fsize,
            eof.file_size
        );
    }
    txn.fsize = eof.file_size;

    match txn.substate {
        RxSubstate::AwaitingMetadata => {
            // Still need the metadata PDU; keep asking.
            txn.flags.send_nak = true;
        }
        RxSubstate::ReceivingFileData | RxSubstate::AwaitingEof => {
            txn.substate = RxSubstate::AwaitingGapFill;
            complete_check(txn, true);
        }
        _ => {}
    }
}

fn recv_fin_ack(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    if txn.substate != RxSubstate::AwaitingFinAck {
        ctx.stats.recv_unexpected += 1;
        log::debug!("[r2] txn={} FIN-ACK in {:?}", txn.id, txn.substate);
        return;
    }
    ctx.emit(crate::events::RxEvent::FinAckRecv, txn.id);
    finish(txn, ctx);
}

/// Operator cancel: graceful FIN with Cancel Request Received.
pub(crate) fn cancel(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    ctx.emit(crate::events::RxEvent::Cancel, txn.id);
    txn.flags.canceled = true;
    set_fin_status(txn, ConditionCode::CancelRequestReceived);
}

/// Completion test: metadata in, EOF in, no gaps.
///
/// On completion the background checksum pass is scheduled; any pending
/// NAK is withdrawn. Otherwise, when `nak_if_gaps` is set (EOF / metadata
/// arrival), a NAK is raised for the remaining gaps. File-data arrivals
/// pass `false`: their retransmission cadence belongs to the NAK timer.
pub(crate) fn complete_check(txn: &mut Transaction, nak_if_gaps: bool) {
    if txn.flags.complete || !txn.flags.md_received || !txn.flags.eof_received {
        if nak_if_gaps && !txn.flags.complete {
            txn.flags.send_nak = true;
        }
        return;
    }
    if txn.chunks.is_contiguous(txn.fsize) {
        txn.flags.complete = true;
        txn.flags.send_nak = false;
        txn.flags.crc_done = false;
        txn.crc_cursor = 0;
        txn.checksum.reset();
        log::debug!(
            "[r2] txn={} all {} bytes in, starting checksum pass",
            txn.id,
            txn.fsize
        );
    } else if nak_if_gaps {
        txn.flags.send_nak = true;
    }
}

/// Assemble the NAK the tick driver is about to emit.
///
/// Without metadata the single `(0, 0)` segment requests its
/// retransmission. Otherwise the gap set is enumerated up to the declared
/// file size (or the highest received offset when no size is known yet)
/// and packed until the segment budget `cap` is full.
pub(crate) fn build_nak(txn: &Transaction, cap: usize) -> NakPdu {
    let mut segments = Vec::with_capacity(cap);

    if !txn.flags.md_received {
        segments.push(SegmentRequest::METADATA);
        return NakPdu {
            scope_start: 0,
            scope_end: txn.fsize,
            segments,
        };
    }

    let limit = if txn.fsize > 0 {
        txn.fsize
    } else {
        txn.chunks.highest_end()
    };
    let mut truncated = false;
    for gap in txn.chunks.gaps(limit) {
        if segments.len() == cap {
            truncated = true;
            break;
        }
        segments.push(SegmentRequest {
            start: gap.start,
            end: gap.end,
        });
    }
    if truncated {
        log::debug!(
            "[r2] txn={} NAK truncated to {cap} segment requests",
            txn.id
        );
    }
    NakPdu {
        scope_start: 0,
        scope_end: limit,
        segments,
    }
}

/// Assemble the FIN reporting this transaction's outcome.
///
/// Delivery is Complete only for No Error; the file status reports
/// whether anything usable remains in the filestore (a temp file whose
/// metadata never arrived is unlinked on reset, hence Discarded).
pub(crate) fn build_fin(txn: &Transaction) -> FinPdu {
    let delivery = if txn.condition == ConditionCode::NoError {
        DeliveryCode::Complete
    } else {
        DeliveryCode::Incomplete
    };
    let file_status = match &txn.sink {
        Some(sink) if !sink.is_temp() => FileStatus::Retained,
        // No file, or a temp file that will be unlinked on reset.
        _ => FileStatus::Discarded,
    };
    FinPdu {
        condition: txn.condition,
        delivery,
        file_status,
    }
}
