//! Reqwest middleware for automatic streaming-payment negotiation.
//!
//! This module provides a [`StreamClient`] that can be attached to a
//! `reqwest` client as middleware. When a request receives a
//! `402 Payment Required` response, the middleware reads the provider's
//! payment terms, opens a stream through its [`StreamFunder`], and retries
//! the request with the stream id attached. The stream id is cached per
//! target host, so later requests to the same provider ride the existing
//! stream without touching the ledger again.
//!
//! ## Wiring it up
//!
//! ```ignore
//! use std::sync::Arc;
//! use streampay::{InMemoryVault, StreamLedger, SystemClock};
//! use streampay_http::client::{LedgerFunder, ReqwestWithStreaming, StreamClient};
//!
//! let ledger = Arc::new(StreamLedger::new(vault, SystemClock));
//! let funder = LedgerFunder::new(ledger, "0xAgent".to_owned());
//! let negotiator = Arc::new(StreamClient::new(funder));
//!
//! let http = reqwest::Client::new()
//!     .with_streaming(Arc::clone(&negotiator))
//!     .build();
//! // ... issue requests; read negotiator.metrics() at any time.
//! ```

mod funder;
mod middleware;

pub use funder::{LedgerFunder, StreamFunder};
pub use middleware::{NegotiationMetrics, NegotiatorConfig, StreamClient};

use std::sync::Arc;

use reqwest_middleware as rqm;

/// Trait for adding streaming-payment handling to reqwest clients.
///
/// Implemented on [`reqwest::Client`]; the negotiator is taken as an
/// [`Arc`] so the caller keeps a handle for reading metrics after the
/// client is built.
pub trait ReqwestWithStreaming {
    /// Attaches the negotiation middleware, returning a builder that
    /// further middleware can be stacked onto.
    fn with_streaming<F>(self, negotiator: Arc<StreamClient<F>>) -> rqm::ClientBuilder
    where
        F: StreamFunder + 'static;
}

impl ReqwestWithStreaming for reqwest::Client {
    fn with_streaming<F>(self, negotiator: Arc<StreamClient<F>>) -> rqm::ClientBuilder
    where
        F: StreamFunder + 'static,
    {
        rqm::ClientBuilder::new(self).with_arc(negotiator)
    }
}
