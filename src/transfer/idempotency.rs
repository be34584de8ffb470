//! Idempotency Index
//!
//! Process-local map from transfer ID to either an in-progress marker or the
//! terminal outcome. The durable half of the at-most-once guarantee is the
//! ledger's conditional PENDING insert; this index answers hot retries without
//! touching storage and stops two tasks in this process from running the same
//! transfer at once.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use cached::{Cached, SizedCache};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::error;

use super::error::TransferError;
use super::types::{TransferFingerprint, TransferOutcome, TransferRequest};
use crate::core_types::TransferId;

/// Terminal outcomes kept by [`IdempotencyIndex::new`]
pub const DEFAULT_OUTCOME_CAPACITY: usize = 100_000;

type Outcomes = SizedCache<TransferId, (TransferFingerprint, TransferOutcome)>;

/// Result of [`IdempotencyIndex::check_or_reserve`]
#[derive(Debug)]
pub enum Reservation<'a> {
    /// Terminal outcome of an earlier identical request
    AlreadyCompleted(TransferOutcome),
    /// Another task holds the marker
    AlreadyInProgress,
    /// Marker inserted; the caller owns the transfer until the guard is committed or dropped
    Reserved(ReservationGuard<'a>),
}

/// In-progress markers are unbounded (one per running transfer); terminal
/// outcomes live in a size-capped LRU. An evicted key falls through to the
/// ledger store, which replays the durable record.
pub struct IdempotencyIndex {
    in_flight: DashMap<TransferId, TransferFingerprint>,
    outcomes: Mutex<Outcomes>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTCOME_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            in_flight: DashMap::new(),
            outcomes: Mutex::new(SizedCache::with_size(capacity.max(1))),
        }
    }

    fn outcomes(&self) -> MutexGuard<'_, Outcomes> {
        // The cache holds no invariant a panicking writer could break
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomically look up `request.transfer_id`, inserting an in-progress
    /// marker when there is none
    pub fn check_or_reserve(
        &self,
        request: &TransferRequest,
    ) -> Result<Reservation<'_>, TransferError> {
        let fingerprint = request.fingerprint();

        if let Some((fp, outcome)) = self.outcomes().cache_get(&request.transfer_id) {
            if *fp != fingerprint {
                return Err(TransferError::IdempotencyKeyConflict(
                    request.transfer_id.clone(),
                ));
            }
            return Ok(Reservation::AlreadyCompleted(outcome.clone()));
        }

        match self.in_flight.entry(request.transfer_id.clone()) {
            Entry::Occupied(existing) => {
                if *existing.get() != fingerprint {
                    return Err(TransferError::IdempotencyKeyConflict(
                        request.transfer_id.clone(),
                    ));
                }
                Ok(Reservation::AlreadyInProgress)
            }
            Entry::Vacant(slot) => {
                slot.insert(fingerprint);
                Ok(Reservation::Reserved(ReservationGuard {
                    index: self,
                    transfer_id: request.transfer_id.clone(),
                    armed: true,
                }))
            }
        }
    }

    /// Move an in-progress marker to its terminal outcome
    pub fn record_outcome(
        &self,
        transfer_id: &TransferId,
        outcome: TransferOutcome,
    ) -> Result<(), TransferError> {
        let Some(fingerprint) = self.in_flight.get(transfer_id).map(|fp| fp.value().clone()) else {
            error!(transfer_id = %transfer_id, "Outcome recorded without reservation");
            return Err(TransferError::NotReserved(transfer_id.clone()));
        };

        // Outcome first, so a concurrent lookup sees either the marker or the outcome
        self.outcomes()
            .cache_set(transfer_id.clone(), (fingerprint, outcome));
        self.in_flight.remove(transfer_id);
        Ok(())
    }

    /// Drop an in-progress marker; terminal entries are kept
    pub fn release(&self, transfer_id: &TransferId) -> bool {
        self.in_flight.remove(transfer_id).is_some()
    }

    /// Cached terminal outcome, if still resident
    pub fn outcome(&self, transfer_id: &TransferId) -> Option<TransferOutcome> {
        self.outcomes()
            .cache_get(transfer_id)
            .map(|(_, outcome)| outcome.clone())
    }

    /// In-progress markers plus cached outcomes
    pub fn len(&self) -> usize {
        self.in_flight.len() + self.outcomes().cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdempotencyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyIndex")
            .field("in_flight", &self.in_flight.len())
            .field("outcomes", &self.outcomes().cache_size())
            .finish()
    }
}

/// Owns an in-progress marker. Dropping it without [`ReservationGuard::commit`]
/// releases the marker, so a cancelled or failed attempt never blocks a retry.
#[derive(Debug)]
pub struct ReservationGuard<'a> {
    index: &'a IdempotencyIndex,
    transfer_id: TransferId,
    armed: bool,
}

impl ReservationGuard<'_> {
    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    /// Record the terminal outcome and disarm
    pub fn commit(mut self, outcome: TransferOutcome) -> Result<(), TransferError> {
        self.armed = false;
        self.index.record_outcome(&self.transfer_id, outcome)
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.index.release(&self.transfer_id);
        }
    }
}
