#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP transport for automatic streaming-payment negotiation.
//!
//! This crate connects the stream ledger in [`streampay`] to HTTP traffic
//! on both sides of a 402 Payment Required exchange:
//!
//! - The [`client`] module provides [`StreamClient`](client::StreamClient),
//!   a `reqwest` middleware that intercepts 402 responses, opens a stream
//!   matching the provider's terms, retries the request once with the
//!   stream id attached, and transparently reuses the stream for every
//!   later request to the same target.
//! - The [`server`] module provides [`StreamGate`](server::StreamGate), a
//!   per-route tower layer that admits requests carrying a valid stream id
//!   and answers everything else with 402 and the route's payment terms.
//!
//! Payment terms travel base64-encoded in the `Payment-Stream-Terms`
//! response header; the stream reference travels as a plain decimal id in
//! the `Payment-Stream-Id` request header.
//!
//! # Feature Flags
//!
//! - `client` *(default)* - reqwest middleware for buyers
//! - `server` *(default)* - tower layer for providers
//! - `telemetry` - tracing instrumentation

pub mod constants;
pub mod error;
pub mod headers;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use error::{ClientError, HttpError};

#[cfg(feature = "client")]
pub use client::{
    LedgerFunder, NegotiationMetrics, NegotiatorConfig, ReqwestWithStreaming, StreamClient,
    StreamFunder,
};
#[cfg(feature = "server")]
pub use server::{LedgerValidator, RouteTerms, StreamGate, StreamValidator};
