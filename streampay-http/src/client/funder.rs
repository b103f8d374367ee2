//! The seam between the negotiator and stream creation.
//!
//! The negotiator itself never talks to a ledger directly; it asks a
//! [`StreamFunder`] to open a stream matching the provider's terms. The
//! bundled [`LedgerFunder`] funds streams on an in-process
//! [`StreamLedger`]; deployments settling elsewhere implement the trait
//! over their own substrate client.

use std::sync::Arc;

use streampay::escrow::Escrow;
use streampay::ledger::{Address, StreamId, StreamLedger};
use streampay::proto::PaymentTerms;
use streampay::timestamp::{Clock, SystemClock};
use streampay::LedgerError;

/// Opens streams on behalf of the negotiator.
#[async_trait::async_trait]
pub trait StreamFunder: Send + Sync {
    /// Creates a stream of `total_amount` base units over `duration`
    /// seconds paying the recipient named by `terms`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the stream cannot be created; the
    /// negotiator surfaces it without retrying.
    async fn open_stream(
        &self,
        terms: &PaymentTerms,
        total_amount: u64,
        duration: u64,
        metadata: &str,
    ) -> Result<StreamId, LedgerError>;
}

/// A [`StreamFunder`] backed by an in-process [`StreamLedger`].
#[derive(Debug)]
pub struct LedgerFunder<E, C = SystemClock> {
    ledger: Arc<StreamLedger<E, C>>,
    sender: Address,
}

impl<E, C> LedgerFunder<E, C> {
    /// Creates a funder that opens streams from `sender`'s deposit.
    pub fn new(ledger: Arc<StreamLedger<E, C>>, sender: Address) -> Self {
        Self { ledger, sender }
    }
}

#[async_trait::async_trait]
impl<E, C> StreamFunder for LedgerFunder<E, C>
where
    E: Escrow,
    C: Clock,
{
    async fn open_stream(
        &self,
        terms: &PaymentTerms,
        total_amount: u64,
        duration: u64,
        metadata: &str,
    ) -> Result<StreamId, LedgerError> {
        self.ledger
            .create_stream(
                self.sender.clone(),
                terms.pay_to.clone(),
                total_amount,
                duration,
                metadata.to_owned(),
            )
            .await
    }
}
