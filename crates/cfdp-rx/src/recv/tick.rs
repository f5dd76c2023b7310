// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-transaction time-based processing
//!
//! Runs once per wakeup for every active transaction, in a fixed order:
//!
//! 1. inactivity timer (abandons the transaction when it fires),
//! 2. ACK and NAK timers (retransmission cadence, retry exhaustion),
//! 3. pending `send_*` flags, serialized into PDUs under the channel's
//!    per-wakeup outgoing quota (a flag that does not fit stays set and
//!    is retried next wakeup),
//! 4. the background checksum pass, bounded bytes per wakeup.

use crate::events::RxEvent;
use crate::pdu::{AckPdu, ConditionCode, DirectiveCode, OutgoingPayload, OutgoingPdu, ServiceClass};
use crate::recv::r2;
use crate::recv::{finish, CrcStep, RxContext, RxSubstate, Transaction};

/// One tick for one transaction.
pub(crate) fn run(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    if !txn.is_active() {
        return;
    }

    // Inactivity: no PDU for the configured window abandons the
    // transaction in any substate, both classes.
    txn.inactivity_timer.tick();
    if txn.inactivity_timer.expired() && !txn.flags.inactivity_fired {
        txn.flags.inactivity_fired = true;
        ctx.emit(RxEvent::Inactivity, txn.id);
        if txn.condition == ConditionCode::NoError {
            txn.condition = ConditionCode::InactivityDetected;
        }
        finish(txn, ctx);
        return;
    }

    if txn.class == ServiceClass::Class1 {
        return;
    }

    run_ack_timer(txn, ctx);
    if !txn.is_active() {
        return;
    }
    run_nak_timer(txn, ctx);
    service_flags(txn, ctx);

    if txn.substate == RxSubstate::AwaitingGapFill && txn.flags.complete && !txn.flags.crc_done {
        advance_crc(txn, ctx);
    }
}

/// ACK timer: FIN retransmission while waiting for FIN-ACK.
fn run_ack_timer(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    if txn.substate != RxSubstate::AwaitingFinAck {
        return;
    }
    txn.ack_timer.tick();
    if !txn.ack_timer.expired() {
        return;
    }
    if txn.ack_retries_left > 0 {
        txn.ack_retries_left -= 1;
        txn.flags.send_fin = true;
        txn.ack_timer
            .arm_secs(ctx.chan.ack_timer_s, ctx.engine.ticks_per_second);
        log::debug!(
            "[tick] txn={} FIN unacknowledged, resending ({} retries left)",
            txn.id,
            txn.ack_retries_left
        );
    } else {
        ctx.emit(RxEvent::CheckLimitReached, txn.id);
        if txn.condition == ConditionCode::NoError {
            txn.condition = ConditionCode::CheckLimitReached;
        }
        finish(txn, ctx);
    }
}

/// NAK timer: retransmission-request cadence.
///
/// Runs while metadata is outstanding (re-request via the `(0, 0)`
/// convention) and while gaps remain after EOF. Expiry with an empty
/// retry budget terminates the transaction with Check Limit Reached.
fn run_nak_timer(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    let receiving = matches!(
        txn.substate,
        RxSubstate::AwaitingMetadata
            | RxSubstate::ReceivingFileData
            | RxSubstate::AwaitingEof
            | RxSubstate::AwaitingGapFill
    );
    let metadata_outstanding =
        !txn.flags.md_received && (txn.flags.eof_received || !txn.chunks.is_empty());
    let gap_filling = txn.substate == RxSubstate::AwaitingGapFill && !txn.flags.complete;
    if !receiving || !(metadata_outstanding || gap_filling) {
        return;
    }

    txn.nak_timer.tick();
    if !txn.nak_timer.expired() {
        return;
    }
    if txn.nak_retries_left > 0 {
        // The send path decrements the budget and re-arms the timer.
        txn.flags.send_nak = true;
    } else {
        ctx.emit(RxEvent::CheckLimitReached, txn.id);
        log::warn!("[tick] txn={} NAK limit reached with gaps outstanding", txn.id);
        r2::set_fin_status(txn, ConditionCode::CheckLimitReached);
    }
    // Keep the timer armed either way so expiry does not refire each tick.
    txn.nak_timer
        .arm_secs(ctx.chan.nak_timer_s, ctx.engine.ticks_per_second);
}

/// Serialize pending `send_*` flags, in ACK, NAK, FIN order.
fn service_flags(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    if txn.flags.send_ack {
        let pdu = OutgoingPdu {
            transaction: txn.id,
            payload: OutgoingPayload::Ack(AckPdu {
                directive: DirectiveCode::Eof,
                condition: txn.eof_condition,
            }),
        };
        if ctx.outbox.try_enqueue(pdu) {
            txn.flags.send_ack = false;
            ctx.stats.sent_ack += 1;
        }
    }

    if txn.flags.send_nak {
        let nak = r2::build_nak(txn, ctx.chan.nak_max_segments);
        let pdu = OutgoingPdu {
            transaction: txn.id,
            payload: OutgoingPayload::Nak(nak),
        };
        if ctx.outbox.try_enqueue(pdu) {
            txn.flags.send_nak = false;
            txn.flags.nak_sent = true;
            txn.nak_retries_left = txn.nak_retries_left.saturating_sub(1);
            txn.nak_timer
                .arm_secs(ctx.chan.nak_timer_s, ctx.engine.ticks_per_second);
            ctx.emit(RxEvent::NakSent, txn.id);
            ctx.stats.sent_nak += 1;
        }
    }

    if txn.flags.send_fin
        && matches!(
            txn.substate,
            RxSubstate::SendingFin | RxSubstate::AwaitingFinAck
        )
    {
        let pdu = OutgoingPdu {
            transaction: txn.id,
            payload: OutgoingPayload::Fin(r2::build_fin(txn)),
        };
        if ctx.outbox.try_enqueue(pdu) {
            txn.flags.send_fin = false;
            ctx.emit(RxEvent::FinSent, txn.id);
            ctx.stats.sent_fin += 1;
            if txn.substate == RxSubstate::SendingFin {
                txn.substate = RxSubstate::AwaitingFinAck;
                txn.ack_retries_left = ctx.chan.ack_limit;
            }
            txn.ack_timer
                .arm_secs(ctx.chan.ack_timer_s, ctx.engine.ticks_per_second);
        }
    }
}

/// Advance the background checksum pass and judge the result.
fn advance_crc(txn: &mut Transaction, ctx: &mut RxContext<'_>) {
    match txn.crc_step(u64::from(ctx.engine.rx_crc_calc_bytes_per_wakeup)) {
        CrcStep::Pending => {}
        CrcStep::Done(computed) => {
            txn.flags.crc_done = true;
            if computed == txn.eof_crc {
                log::debug!("[tick] txn={} checksum verified ({computed:#010x})", txn.id);
                r2::set_fin_status(txn, ConditionCode::NoError);
            } else {
                ctx.emit(RxEvent::CrcMismatch, txn.id);
                log::warn!(
                    "[tick] txn={} checksum {computed:#010x} != declared {:#010x}",
                    txn.id,
                    txn.eof_crc
                );
                r2::set_fin_status(txn, ConditionCode::FileChecksumFailure);
            }
        }
        CrcStep::Failed(e) => {
            r2::fail_filestore(txn, ctx, &e);
        }
    }
}
