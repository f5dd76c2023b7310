// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named engine events
//!
//! Protocol milestones and faults are reported by stable name, not by
//! numeric code: ground tooling greps logs for these strings, and the
//! per-channel statistics count them under the same identity.

use std::fmt;

/// One observable receive-engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    MdRecv,
    FdRecv,
    EofRecv,
    NakSent,
    FinSent,
    FinAckRecv,
    Inactivity,
    CrcMismatch,
    FilestoreReject,
    CheckLimitReached,
    Cancel,
}

impl RxEvent {
    /// Number of event variants (for counter arrays).
    pub const COUNT: usize = 11;

    /// Stable wire/log name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RxEvent::MdRecv => "MD_RECV",
            RxEvent::FdRecv => "FD_RECV",
            RxEvent::EofRecv => "EOF_RECV",
            RxEvent::NakSent => "NAK_SENT",
            RxEvent::FinSent => "FIN_SENT",
            RxEvent::FinAckRecv => "FINACK_RECV",
            RxEvent::Inactivity => "INACTIVITY",
            RxEvent::CrcMismatch => "CRC_MISMATCH",
            RxEvent::FilestoreReject => "FILESTORE_REJECT",
            RxEvent::CheckLimitReached => "CHECK_LIMIT_REACHED",
            RxEvent::Cancel => "CANCEL",
        }
    }

    /// Dense index into per-event counters.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            RxEvent::MdRecv => 0,
            RxEvent::FdRecv => 1,
            RxEvent::EofRecv => 2,
            RxEvent::NakSent => 3,
            RxEvent::FinSent => 4,
            RxEvent::FinAckRecv => 5,
            RxEvent::Inactivity => 6,
            RxEvent::CrcMismatch => 7,
            RxEvent::FilestoreReject => 8,
            RxEvent::CheckLimitReached => 9,
            RxEvent::Cancel => 10,
        }
    }
}

impl fmt::Display for RxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
