#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for streaming HTTP payments.
//!
//! This crate provides the stream ledger that backs automatic payment
//! negotiation over HTTP 402 flows. A *stream* is a ledger record that
//! authorizes a continuous, time-proportional transfer of value from a
//! sender to a recipient: the sender escrows a fixed amount up front, the
//! recipient withdraws what has accrued at any time, and either party can
//! cancel to settle the accrued share and refund the rest.
//!
//! The ledger is deliberately agnostic to the settlement substrate that
//! actually moves funds. Escrow operations go through the [`escrow::Escrow`]
//! trait; [`escrow::InMemoryVault`] is provided for tests, demos, and
//! single-process deployments.
//!
//! # Modules
//!
//! - [`amount`] - Human-readable decimal amount parsing
//! - [`escrow`] - Settlement substrate abstraction and in-memory vault
//! - [`ledger`] - The authoritative stream ledger
//! - [`proto`] - Wire format types for payment terms
//! - [`timestamp`] - Unix timestamps and the clock abstraction
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation for debugging and monitoring

pub mod amount;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod proto;
pub mod timestamp;

pub use error::LedgerError;
pub use escrow::{Escrow, EscrowError, InMemoryVault};
pub use ledger::{Address, Cancellation, Stream, StreamId, StreamLedger};
pub use proto::{PaymentMode, PaymentRequired, PaymentTerms};
pub use timestamp::{Clock, ManualClock, SystemClock, UnixTimestamp};
