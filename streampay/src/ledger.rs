//! The authoritative stream ledger.
//!
//! A stream escrows a fixed deposit from a sender and releases it to a
//! recipient linearly over a fixed window. The ledger is the single source
//! of truth for stream state: accrual is recomputed on demand from the
//! clock, withdrawals and cancellations settle through the [`Escrow`], and
//! records persist after they stop changing so they stay auditable.
//!
//! # Accrual
//!
//! The flow rate is `total_amount / duration` in truncating integer
//! division. The truncation remainder is intentional: it never accrues to
//! the recipient, and is reclaimed by the sender on cancellation or left
//! in escrow at natural expiry.
//!
//! # Activity flag
//!
//! `is_active` is flipped exactly once, by [`StreamLedger::cancel`].
//! A stream past its `stop_time` that was never cancelled still reports
//! `is_active == true`; callers that need "still streaming funds"
//! semantics must additionally compare the clock against `stop_time`.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
#[cfg(feature = "telemetry")]
use tracing::{info, instrument};

use crate::error::LedgerError;
use crate::escrow::Escrow;
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};

/// An opaque party identity (wallet address, account id, ...).
pub type Address = String;

/// Identifier of a stream, assigned monotonically by the ledger.
///
/// Serializes as a decimal string so the id survives JSON consumers that
/// cannot represent 64-bit integers exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Creates a stream id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = <u64 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A stream record.
///
/// `sender`, `recipient`, `total_amount`, `flow_rate`, `start_time`, and
/// `stop_time` never change after creation. `amount_withdrawn` only grows,
/// and `is_active` is cleared at most once, by cancellation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    /// The stream's ledger-assigned id.
    pub id: StreamId,
    /// The party whose deposit funds the stream.
    pub sender: Address,
    /// The party value accrues to.
    pub recipient: Address,
    /// Total escrowed deposit, in base units.
    pub total_amount: u64,
    /// Base units accrued per second (`total_amount / duration`, truncated).
    pub flow_rate: u64,
    /// When accrual starts.
    pub start_time: UnixTimestamp,
    /// When accrual stops (`start_time + duration`).
    pub stop_time: UnixTimestamp,
    /// Base units already withdrawn by the recipient.
    pub amount_withdrawn: u64,
    /// Cleared by cancellation only; natural expiry leaves it set.
    pub is_active: bool,
    /// Snapshot of the accrual cutoff taken by cancellation.
    pub cancelled_at: Option<UnixTimestamp>,
    /// Caller-supplied informational tag.
    pub metadata: String,
}

impl Stream {
    /// The accrual cutoff at time `now`: never past `stop_time`, and
    /// frozen at the cancellation snapshot once cancelled.
    fn accrual_cutoff(&self, now: UnixTimestamp) -> UnixTimestamp {
        let mut cutoff = now.min(self.stop_time);
        if let Some(frozen) = self.cancelled_at {
            cutoff = cutoff.min(frozen);
        }
        cutoff
    }

    /// Base units streamed to the recipient as of `now`.
    ///
    /// Bounded by `flow_rate * duration`, which never exceeds
    /// `total_amount`.
    #[must_use]
    pub fn streamed(&self, now: UnixTimestamp) -> u64 {
        let elapsed = self.accrual_cutoff(now).seconds_since(self.start_time);
        elapsed * self.flow_rate
    }

    /// Base units accrued but not yet withdrawn as of `now`.
    #[must_use]
    pub fn claimable(&self, now: UnixTimestamp) -> u64 {
        self.streamed(now).saturating_sub(self.amount_withdrawn)
    }
}

/// Amounts settled by a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    /// Unstreamed deposit returned to the sender, including the
    /// flow-rate truncation remainder.
    pub sender_refund: u64,
    /// Accrued-but-unwithdrawn value settled to the recipient.
    pub recipient_settlement: u64,
}

/// The stream ledger.
///
/// Each stream lives behind its own lock, held across the escrow call, so
/// concurrent withdrawals and cancellations of the same stream serialize
/// and settlement amounts never double-count. Streams of different ids
/// never contend.
#[derive(Debug)]
pub struct StreamLedger<E, C = SystemClock> {
    escrow: E,
    clock: C,
    streams: DashMap<StreamId, Arc<Mutex<Stream>>>,
    by_sender: DashMap<Address, Vec<StreamId>>,
    next_id: AtomicU64,
}

impl<E, C> StreamLedger<E, C>
where
    E: Escrow,
    C: Clock,
{
    /// Creates a ledger over the given escrow and clock.
    pub fn new(escrow: E, clock: C) -> Self {
        Self {
            escrow,
            clock,
            streams: DashMap::new(),
            by_sender: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the ledger's view of the current time.
    pub fn now(&self) -> UnixTimestamp {
        self.clock.now()
    }

    /// Creates a stream, escrowing `total_amount` from `sender`.
    ///
    /// The deposit is released to `recipient` linearly over `duration`
    /// seconds starting now. The sender must have authorized at least
    /// `total_amount` of escrow capacity beforehand.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTerms`] if `total_amount` or
    /// `duration` is zero, and [`LedgerError::InsufficientAuthorization`]
    /// if the escrow deposit fails.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, metadata), err))]
    pub async fn create_stream(
        &self,
        sender: Address,
        recipient: Address,
        total_amount: u64,
        duration: u64,
        metadata: String,
    ) -> Result<StreamId, LedgerError> {
        if total_amount == 0 {
            return Err(LedgerError::InvalidTerms(
                "total amount must be positive".into(),
            ));
        }
        if duration == 0 {
            return Err(LedgerError::InvalidTerms("duration must be positive".into()));
        }

        self.escrow
            .lock(&sender, total_amount)
            .await
            .map_err(LedgerError::InsufficientAuthorization)?;

        let id = StreamId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let start_time = self.clock.now();
        let stream = Stream {
            id,
            sender: sender.clone(),
            recipient,
            total_amount,
            flow_rate: total_amount / duration,
            start_time,
            stop_time: start_time + duration,
            amount_withdrawn: 0,
            is_active: true,
            cancelled_at: None,
            metadata,
        };

        #[cfg(feature = "telemetry")]
        info!(
            stream = %id,
            sender = %stream.sender,
            recipient = %stream.recipient,
            total_amount,
            duration,
            "stream created"
        );

        self.streams.insert(id, Arc::new(Mutex::new(stream)));
        self.by_sender.entry(sender).or_default().push(id);
        Ok(id)
    }

    /// Returns the amount the recipient could withdraw right now.
    ///
    /// Zero for cancelled streams whose settlement was already taken.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownStream`] if the id does not exist.
    pub async fn claimable_balance(&self, id: StreamId) -> Result<u64, LedgerError> {
        let slot = self.slot(id)?;
        let stream = slot.lock().await;
        Ok(stream.claimable(self.clock.now()))
    }

    /// Withdraws everything currently claimable to the recipient.
    ///
    /// Returns the amount transferred; a zero-claimable withdrawal is a
    /// no-op returning 0, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unauthorized`] if `caller` is not the
    /// recipient, [`LedgerError::UnknownStream`] for an invalid id, and
    /// [`LedgerError::Escrow`] if the payout fails.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn withdraw(&self, id: StreamId, caller: &str) -> Result<u64, LedgerError> {
        let slot = self.slot(id)?;
        let mut stream = slot.lock().await;
        if caller != stream.recipient {
            return Err(LedgerError::Unauthorized {
                id,
                caller: caller.to_owned(),
                action: "withdraw from",
            });
        }

        let claimable = stream.claimable(self.clock.now());
        if claimable == 0 {
            return Ok(0);
        }

        self.escrow
            .release(&stream.recipient, claimable)
            .await
            .map_err(LedgerError::Escrow)?;
        stream.amount_withdrawn += claimable;

        #[cfg(feature = "telemetry")]
        info!(stream = %id, amount = claimable, "withdrawal settled");

        Ok(claimable)
    }

    /// Cancels a stream, settling the accrued share to the recipient and
    /// refunding the rest (truncation remainder included) to the sender.
    ///
    /// Afterwards the claimable balance is 0 and further withdrawals are
    /// no-ops; the record remains queryable.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unauthorized`] unless `caller` is the
    /// sender or the recipient, [`LedgerError::AlreadyCancelled`] on a
    /// second cancellation, [`LedgerError::UnknownStream`] for an invalid
    /// id, and [`LedgerError::Escrow`] if a payout fails.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), err))]
    pub async fn cancel(&self, id: StreamId, caller: &str) -> Result<Cancellation, LedgerError> {
        let slot = self.slot(id)?;
        let mut stream = slot.lock().await;
        if caller != stream.sender && caller != stream.recipient {
            return Err(LedgerError::Unauthorized {
                id,
                caller: caller.to_owned(),
                action: "cancel",
            });
        }
        if !stream.is_active {
            return Err(LedgerError::AlreadyCancelled(id));
        }

        let cutoff = stream.accrual_cutoff(self.clock.now());
        let streamed = stream.streamed(cutoff);
        let recipient_settlement = streamed.saturating_sub(stream.amount_withdrawn);
        let sender_refund = stream.total_amount - streamed;

        if recipient_settlement > 0 {
            self.escrow
                .release(&stream.recipient, recipient_settlement)
                .await
                .map_err(LedgerError::Escrow)?;
        }
        // Record the settlement before attempting the refund: if the refund
        // fails the stream stays active and a retried cancel settles only
        // what accrued since, never double-paying the recipient.
        stream.amount_withdrawn = streamed;
        if sender_refund > 0 {
            self.escrow
                .release(&stream.sender, sender_refund)
                .await
                .map_err(LedgerError::Escrow)?;
        }
        stream.is_active = false;
        stream.cancelled_at = Some(cutoff);

        #[cfg(feature = "telemetry")]
        info!(
            stream = %id,
            sender_refund,
            recipient_settlement,
            "stream cancelled"
        );

        Ok(Cancellation {
            sender_refund,
            recipient_settlement,
        })
    }

    /// Returns the raw activity flag.
    ///
    /// `true` for a stream past `stop_time` that was never cancelled;
    /// compare [`Self::now`] against the record's `stop_time` when "still
    /// streaming funds" semantics are needed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownStream`] if the id does not exist.
    pub async fn is_stream_active(&self, id: StreamId) -> Result<bool, LedgerError> {
        let slot = self.slot(id)?;
        let stream = slot.lock().await;
        Ok(stream.is_active)
    }

    /// Returns a snapshot of the stream record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownStream`] if the id does not exist.
    pub async fn get(&self, id: StreamId) -> Result<Stream, LedgerError> {
        let slot = self.slot(id)?;
        let stream = slot.lock().await;
        Ok(stream.clone())
    }

    /// Lists the ids of all streams funded by `sender`, in creation order.
    #[must_use]
    pub fn streams_for(&self, sender: &str) -> Vec<StreamId> {
        self.by_sender
            .get(sender)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn slot(&self, id: StreamId) -> Result<Arc<Mutex<Stream>>, LedgerError> {
        self.streams
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::UnknownStream(id))
    }
}
