// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class 1 (unacknowledged) receive path
//!
//! Single forward pass: no NAK, no ACK, no FIN. Data is written at its
//! stated offset and digested into the checksum in arrival order; Class 1
//! assumes in-order delivery, so out-of-order data still lands at the
//! right offset but the terminal checksum comparison will flag it. The
//! EOF PDU decides the outcome and retires the transaction on the spot.

use crate::events::RxEvent;
use crate::filestore::FileSink;
use crate::pdu::{ConditionCode, EofPdu, FileDataPdu, MetadataPdu, Pdu, PduPayload};
use crate::recv::{finish, RxContext, RxSubstate, Transaction};

/// Dispatch one inbound PDU to the Class 1 handlers.
pub(crate) fn recv(txn: &mut Transaction, pdu: &Pdu<'_>, ctx: &mut RxContext<'_>) {
    txn.touch(ctx.engine, ctx.chan);
    match &pdu.payload {
        PduPayload::Metadata(md) => recv_metadata(txn, md, ctx),
        PduPayload::FileData(fd) => recv_file_data(txn, fd, ctx),
        PduPayload::Eof(eof) => recv_eof(txn, eof, ctx),
        other => {
            ctx.stats.recv_unexpected += 1;
            log::debug!("[r1] txn={} dropping {}", txn.id, other.kind());
        }
    }
}

fn recv_metadata(txn: &mut Transaction, md: &MetadataPdu, ctx: &mut RxContext<'_>) {
    if txn.flags.md_received {
        if txn.dest_name.as_os_str() != std::ffi::OsStr::new(&md.dest_name) {
            ctx.stats.metadata_mismatches += 1;
            log::warn!("[r1] txn={} duplicate metadata disagrees, keeping first", txn.id);
        }
        return;
    }
    txn.source_name = md.source_name.clone();
    txn.dest_name = std::path::PathBuf::from(&md.dest_name);
    txn.fsize = md.file_size;
    txn.flags.md_received = true;

    match FileSink::open_final(&txn.dest_name) {
        Ok(sink) => txn.sink = Some(sink),
        Err(e) => {
            // Class 1 has no FIN to report through; fail locally.
            log::error!("[r1] txn={} filestore: {e}", txn.id);
            ctx.emit(RxEvent::FilestoreReject, txn.id);
            txn.condition = ConditionCode::FilestoreRejection;
            finish(txn, ctx);
            return;
        }
    }
    ctx.emit(RxEvent::MdRecv, txn.id);
    txn.substate = RxSubstate::ReceivingFileData;
}

fn recv_file_data(txn: &mut Transaction, fd: &FileDataPdu<'_>, ctx: &mut RxContext<'_>) {
    if !txn.flags.md_received {
        // Without metadata there is no file to write and, in Class 1,
        // no way to ask for it again.
        ctx.stats.pdus_dropped += 1;
        log::debug!("[r1] txn={} file data before metadata dropped", txn.id);
        return;
    }
    let Some(sink) = txn.sink.as_mut() else {
        return;
    };
    if let Err(e) = sink.write_at(fd.offset, fd.data) {
        // Unrecoverable in Class 1; the checksum comparison will fail.
        log::warn!("[r1] txn={} write at {} failed: {e}", txn.id, fd.offset);
        return;
    }
    txn.checksum.digest(fd.data);
    txn.bytes_received += fd.data.len() as u64;
    ctx.emit(RxEvent::FdRecv, txn.id);
}

fn recv_eof(txn: &mut Transaction, eof: &EofPdu, ctx: &mut RxContext<'_>) {
    ctx.emit(RxEvent::EofRecv, txn.id);

    if eof.condition != ConditionCode::NoError {
        log::warn!("[r1] txn={} EOF with condition: {}", txn.id, eof.condition);
        ctx.emit(RxEvent::Cancel, txn.id);
        txn.condition = eof.condition;
        finish(txn, ctx);
        return;
    }

    txn.fsize = eof.file_size;
    if txn.bytes_received != eof.file_size {
        log::warn!(
            "[r1] txn={} received {} of {} bytes",
            txn.id,
            txn.bytes_received,
            eof.file_size
        );
        txn.condition = ConditionCode::FileSizeError;
    } else {
        let computed = txn.checksum.finalize();
        if computed != eof.checksum {
            ctx.emit(RxEvent::CrcMismatch, txn.id);
            log::warn!(
                "[r1] txn={} checksum {computed:#010x} != declared {:#010x}",
                txn.id,
                eof.checksum
            );
            txn.condition = ConditionCode::FileChecksumFailure;
        }
    }
    finish(txn, ctx);
}

/// Operator cancel: Class 1 has no FIN handshake, reset immediately.
pub(crate) fn cancel(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    ctx.emit(RxEvent::Cancel, txn.id);
    txn.flags.canceled = true;
    txn.condition = ConditionCode::CancelRequestReceived;
    finish(txn, ctx);
}
