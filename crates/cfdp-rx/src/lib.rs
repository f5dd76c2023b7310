// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # cfdp-rx - CCSDS File Delivery Protocol receive engine
//!
//! Receive-side transaction state machine for CFDP (CCSDS 727.0-B) over
//! constrained, high-latency links: ingest decoded PDUs, reassemble the
//! file to local storage, request retransmission of gaps, verify
//! end-to-end integrity, and close the transaction out with the sender.
//!
//! Both service classes are supported: Class 1 (unacknowledged, single
//! forward pass) and Class 2 (acknowledged: NAK-driven gap repair and the
//! EOF-ACK / FIN / FIN-ACK handshake).
//!
//! ## Protocol Flow (Class 2, one lost segment)
//!
//! ```text
//! Sender                                   Receiver
//!   |--- METADATA (size, names) ------------->|  open destination file
//!   |--- FILE DATA (offset 0) --------------->|  write, record range
//!   |--- FILE DATA (offset 512) ----X (lost)  |
//!   |--- EOF (size, checksum) --------------->|  record EOF
//!   |<-- ACK-EOF -----------------------------|
//!   |<-- NAK (512, 1024) ---------------------|  gap from range set
//!   |--- FILE DATA (offset 512) ------------->|  gap filled
//!   |                                         |  checksum pass over file
//!   |<-- FIN (No Error) ----------------------|
//!   |--- ACK-FIN ---------------------------->|  transaction retired
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cfdp_rx::{Channel, ChannelConfig, EngineConfig};
//!
//! let engine = EngineConfig {
//!     local_eid: 2,
//!     tmp_dir: "/data/cfdp/tmp".into(),
//!     ..EngineConfig::default()
//! };
//! let mut channel = Channel::new(engine, ChannelConfig::default()).unwrap();
//!
//! // Outer loop, once per wakeup:
//! //   for pdu in inbound { channel.recv(&pdu); }
//! //   channel.tick();
//! //   for out in channel.take_outgoing() { transmit(out); }
//! # fn transmit(_p: cfdp_rx::OutgoingPdu) {}
//! ```
//!
//! ## Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Channel`] | Pool of transaction slots, dispatch, tick sweep, outbox |
//! | [`recv::Transaction`] | One transfer: substate, flags, timers, retry budgets |
//! | [`ChunkList`](chunks::ChunkList) | Received byte ranges; gap enumeration for NAKs |
//! | [`FileChecksum`](checksum::FileChecksum) | Incremental CFDP modular checksum |
//! | [`FileSink`](filestore::FileSink) | Positional file writes, temp-to-final rename |
//! | [`Timer`](timer::Timer) | Tick-quantized countdowns (ACK, NAK, inactivity) |
//!
//! The engine is single-threaded and cooperative: one logical task per
//! channel, no blocking, no shared state between channels, time advancing
//! only through [`Channel::tick`]. PDU marshalling, transport, and
//! sender-side machinery live outside this crate; the engine consumes the
//! logical PDU view in [`pdu`] and emits logical PDUs back.

/// Per-channel receive engine: dispatch, tick sweep, outbox, statistics.
pub mod channel;
/// Incremental CFDP file checksum.
pub mod checksum;
/// Received byte-range set with gap enumeration.
pub mod chunks;
/// Engine and channel configuration.
pub mod config;
/// Named observable events.
pub mod events;
/// Offset-addressed file sink with temp-to-final handling.
pub mod filestore;
/// Logical (decoded) PDU view, inbound and outbound.
pub mod pdu;
/// Transaction state and the R1/R2/tick state machines.
pub mod recv;
/// Tick-quantized countdown timers.
pub mod timer;

pub use channel::{Channel, ChannelStats};
pub use config::{ChannelConfig, ConfigError, EngineConfig};
pub use events::RxEvent;
pub use pdu::{
    ConditionCode, EntityId, OutgoingPayload, OutgoingPdu, Pdu, PduHeader, PduPayload,
    ServiceClass, TransactionId,
};
pub use recv::{RxSubstate, Transaction};
