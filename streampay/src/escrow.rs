//! Settlement substrate abstraction.
//!
//! The ledger never moves funds itself; it asks an [`Escrow`] to lock a
//! sender's deposit when a stream is created and to release escrowed funds
//! to a party on withdrawal, settlement, or refund. Real deployments back
//! this trait with whatever substrate finalizes transfers; tests, demos,
//! and single-process deployments use [`InMemoryVault`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::ledger::Address;

/// Errors surfaced by a settlement substrate.
///
/// Substrate timeouts and transport failures are reported through
/// [`EscrowError::Backend`]; they are never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscrowError {
    /// The payer has not authorized enough escrow capacity.
    #[error("allowance too low: needed {needed}, available {available}")]
    InsufficientAllowance {
        /// Amount the operation required.
        needed: u64,
        /// Amount currently authorized.
        available: u64,
    },

    /// The payer's balance cannot cover the deposit.
    #[error("balance too low: needed {needed}, available {available}")]
    InsufficientBalance {
        /// Amount the operation required.
        needed: u64,
        /// Balance currently held.
        available: u64,
    },

    /// The substrate failed to execute the transfer.
    #[error("settlement backend error: {0}")]
    Backend(String),
}

/// Moves funds between parties and the escrow pool on behalf of the ledger.
#[async_trait::async_trait]
pub trait Escrow: Send + Sync {
    /// Moves `amount` from `payer` into escrow.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError`] if the payer's authorization or balance is
    /// insufficient, or if the substrate fails.
    async fn lock(&self, payer: &str, amount: u64) -> Result<(), EscrowError>;

    /// Moves `amount` out of escrow to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError`] if the substrate fails.
    async fn release(&self, to: &str, amount: u64) -> Result<(), EscrowError>;
}

#[async_trait::async_trait]
impl<T: Escrow + ?Sized> Escrow for Arc<T> {
    async fn lock(&self, payer: &str, amount: u64) -> Result<(), EscrowError> {
        (**self).lock(payer, amount).await
    }

    async fn release(&self, to: &str, amount: u64) -> Result<(), EscrowError> {
        (**self).release(to, amount).await
    }
}

/// An in-memory token vault implementing [`Escrow`].
///
/// Models the usual token flow: balances per address, a spending allowance
/// granted to the ledger, and a pooled escrow balance. [`Self::lock`]
/// debits both the payer's balance and allowance; [`Self::release`] pays
/// out of the pool.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    balances: DashMap<Address, u64>,
    allowances: DashMap<Address, u64>,
    escrowed: AtomicU64,
}

impl InMemoryVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits `amount` to `owner`'s balance.
    pub fn mint(&self, owner: &str, amount: u64) {
        *self.balances.entry(owner.to_owned()).or_insert(0) += amount;
    }

    /// Sets the escrow allowance `owner` grants to the ledger.
    pub fn approve(&self, owner: &str, amount: u64) {
        self.allowances.insert(owner.to_owned(), amount);
    }

    /// Returns `owner`'s current balance.
    #[must_use]
    pub fn balance_of(&self, owner: &str) -> u64 {
        self.balances.get(owner).map_or(0, |b| *b)
    }

    /// Returns the unspent escrow allowance of `owner`.
    #[must_use]
    pub fn allowance_of(&self, owner: &str) -> u64 {
        self.allowances.get(owner).map_or(0, |a| *a)
    }

    /// Returns the total amount currently held in escrow.
    #[must_use]
    pub fn escrowed(&self) -> u64 {
        self.escrowed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Escrow for InMemoryVault {
    async fn lock(&self, payer: &str, amount: u64) -> Result<(), EscrowError> {
        // Allowance first, then balance; both entries stay locked until the
        // debit completes so concurrent locks cannot overspend.
        let mut allowance = self.allowances.entry(payer.to_owned()).or_insert(0);
        if *allowance < amount {
            return Err(EscrowError::InsufficientAllowance {
                needed: amount,
                available: *allowance,
            });
        }
        let mut balance = self.balances.entry(payer.to_owned()).or_insert(0);
        if *balance < amount {
            return Err(EscrowError::InsufficientBalance {
                needed: amount,
                available: *balance,
            });
        }
        *allowance -= amount;
        *balance -= amount;
        self.escrowed.fetch_add(amount, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, to: &str, amount: u64) -> Result<(), EscrowError> {
        let pool = self.escrowed.load(Ordering::SeqCst);
        if pool < amount {
            return Err(EscrowError::Backend(format!(
                "escrow pool underflow: pool {pool}, release {amount}"
            )));
        }
        self.escrowed.fetch_sub(amount, Ordering::SeqCst);
        *self.balances.entry(to.to_owned()).or_insert(0) += amount;
        Ok(())
    }
}
