// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logical CFDP PDU view
//!
//! Typed accessors over an already-decoded PDU. Byte-level marshalling
//! (bit-packed CCSDS 727.0-B headers) belongs to the codec layer; the
//! receive engine only ever sees these structures:
//!
//! - File Data: a byte segment at an explicit file offset
//! - EOF: declared file size, checksum, terminal condition from the sender
//! - Metadata: file names and provisional size
//! - NAK: scope plus segment requests (receive engine emits these)
//! - FIN: terminal report of the receive side
//! - ACK: acknowledgment of EOF (receive side) or FIN (send side)

use std::fmt;

/// CFDP entity identifier (one endpoint on the network of CFDP nodes).
pub type EntityId = u32;

/// Identifies one transaction on the wire.
///
/// CFDP names a transaction by the *source* entity plus a sequence number
/// the source chose; the pair stays unique for the transaction's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId {
    /// Entity that initiated the transaction (the file sender).
    pub source: EntityId,
    /// Sender-assigned transaction sequence number.
    pub sequence: u32,
}

impl TransactionId {
    #[must_use]
    pub fn new(source: EntityId, sequence: u32) -> Self {
        Self { source, sequence }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.sequence)
    }
}

/// CFDP service class, from the transmission-mode bit of the PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClass {
    /// Unacknowledged (best effort, no retransmission).
    Class1,
    /// Acknowledged (NAK-driven retransmission, FIN handshake).
    Class2,
}

/// Terminal outcome of a transaction (CFDP condition code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionCode {
    #[default]
    NoError,
    /// Could not open, move, or write the destination file.
    FilestoreRejection,
    /// Computed file checksum disagrees with the EOF-declared checksum.
    FileChecksumFailure,
    /// Received data extends past, or falls short of, the declared size.
    FileSizeError,
    /// ACK or NAK retransmission limit exhausted.
    CheckLimitReached,
    /// No progress within the inactivity window.
    InactivityDetected,
    /// Local operator or peer requested cancellation.
    CancelRequestReceived,
}

impl ConditionCode {
    /// Number of condition code variants (for counter arrays).
    pub const COUNT: usize = 7;

    /// Stable dense index, used by per-condition failure counters.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            ConditionCode::NoError => 0,
            ConditionCode::FilestoreRejection => 1,
            ConditionCode::FileChecksumFailure => 2,
            ConditionCode::FileSizeError => 3,
            ConditionCode::CheckLimitReached => 4,
            ConditionCode::InactivityDetected => 5,
            ConditionCode::CancelRequestReceived => 6,
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionCode::NoError => "no error",
            ConditionCode::FilestoreRejection => "filestore rejection",
            ConditionCode::FileChecksumFailure => "file checksum failure",
            ConditionCode::FileSizeError => "file size error",
            ConditionCode::CheckLimitReached => "check limit reached",
            ConditionCode::InactivityDetected => "inactivity detected",
            ConditionCode::CancelRequestReceived => "cancel request received",
        };
        f.write_str(name)
    }
}

/// File directive being acknowledged by an ACK PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveCode {
    Eof,
    Fin,
}

/// FIN delivery code: did all file data arrive?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryCode {
    Complete,
    Incomplete,
}

/// FIN file status: what happened to the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// File was kept in the filestore.
    Retained,
    /// File (or the unnamed temp file) was discarded.
    Discarded,
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// File Data PDU: one segment of file content at an explicit offset.
#[derive(Debug, Clone, Copy)]
pub struct FileDataPdu<'a> {
    /// Byte offset of this segment within the file.
    pub offset: u64,
    /// Segment payload (borrowed from the decoded inbound buffer).
    pub data: &'a [u8],
}

/// EOF PDU: the sender has transmitted everything it intends to.
///
/// A condition code other than `NoError` announces a sender-side fault or
/// cancellation; the declared size and checksum are then meaningless.
#[derive(Debug, Clone, Copy)]
pub struct EofPdu {
    pub condition: ConditionCode,
    /// Total file size in bytes as the sender declares it.
    pub file_size: u64,
    /// Sender-computed CFDP checksum over the whole file.
    pub checksum: u32,
}

/// Metadata option TLV (filestore requests, messages to user, ...).
///
/// Carried through for the application; the receive engine does not
/// interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataOption {
    pub kind: u8,
    pub value: Vec<u8>,
}

/// Metadata PDU: names the file and gives a provisional size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    /// File size as declared at transaction start (EOF is authoritative).
    pub file_size: u64,
    /// Source file name at the sending entity.
    pub source_name: String,
    /// Destination file name to create locally.
    pub dest_name: String,
    /// Uninterpreted option TLVs.
    pub options: Vec<MetadataOption>,
}

/// One retransmission request within a NAK PDU.
///
/// Half-open byte range `[start, end)`. The pair `(0, 0)` is the CFDP
/// convention requesting retransmission of the Metadata PDU itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRequest {
    pub start: u64,
    pub end: u64,
}

impl SegmentRequest {
    /// The metadata-request convention: an empty `(0, 0)` segment.
    pub const METADATA: SegmentRequest = SegmentRequest { start: 0, end: 0 };
}

/// NAK PDU: scope plus the segment requests inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    pub scope_start: u64,
    pub scope_end: u64,
    pub segments: Vec<SegmentRequest>,
}

/// FIN PDU: terminal report from the receiving entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinPdu {
    pub condition: ConditionCode,
    pub delivery: DeliveryCode,
    pub file_status: FileStatus,
}

/// ACK PDU: acknowledges an EOF or FIN directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPdu {
    /// Which directive is being acknowledged.
    pub directive: DirectiveCode,
    /// Condition code echoed from the acknowledged directive.
    pub condition: ConditionCode,
}

// ============================================================================
// PDU envelope
// ============================================================================

/// Decoded fixed PDU header fields the receive engine cares about.
#[derive(Debug, Clone, Copy)]
pub struct PduHeader {
    /// Service class from the transmission-mode bit.
    pub class: ServiceClass,
    /// Source entity (the file sender for inbound traffic).
    pub source: EntityId,
    /// Destination entity (must match the local entity id).
    pub destination: EntityId,
    /// Transaction sequence number assigned by the source.
    pub sequence: u32,
}

impl PduHeader {
    /// Transaction identity carried by this header.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source, self.sequence)
    }
}

/// Payload of a decoded inbound PDU.
#[derive(Debug, Clone)]
pub enum PduPayload<'a> {
    FileData(FileDataPdu<'a>),
    Eof(EofPdu),
    Metadata(MetadataPdu),
    Nak(NakPdu),
    Fin(FinPdu),
    Ack(AckPdu),
}

impl PduPayload<'_> {
    /// Short name for logs and drop diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PduPayload::FileData(_) => "FD",
            PduPayload::Eof(_) => "EOF",
            PduPayload::Metadata(_) => "MD",
            PduPayload::Nak(_) => "NAK",
            PduPayload::Fin(_) => "FIN",
            PduPayload::Ack(_) => "ACK",
        }
    }
}

/// One decoded inbound PDU: header plus typed payload.
#[derive(Debug, Clone)]
pub struct Pdu<'a> {
    pub header: PduHeader,
    pub payload: PduPayload<'a>,
}

// ============================================================================
// Outbound PDUs
// ============================================================================

/// Payload of a PDU the receive engine wants transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPayload {
    Ack(AckPdu),
    Nak(NakPdu),
    Fin(FinPdu),
}

impl OutgoingPayload {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingPayload::Ack(_) => "ACK",
            OutgoingPayload::Nak(_) => "NAK",
            OutgoingPayload::Fin(_) => "FIN",
        }
    }
}

/// One PDU queued for transmission, tagged with its transaction.
///
/// The codec layer marshals this into wire bytes; the engine only decides
/// what to send and in which order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPdu {
    pub transaction: TransactionId,
    pub payload: OutgoingPayload,
}
