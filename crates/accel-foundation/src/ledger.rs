//! Budget ledger: accelerator memory bookkeeping.
//!
//! The ledger knows nothing about tiers, timers or gateways. It is only ever
//! mutated while the scheduler state lock is held, so reserve-after-check is
//! atomic with respect to concurrent admissions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Outcome of [`BudgetLedger::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Whether the model now holds a reservation.
    pub reserved: bool,
    /// Capacity left after the call.
    pub available: u64,
}

/// Tracks total, used and available capacity per reserved model.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    total: u64,
    used: u64,
    reservations: HashMap<String, u64>,
}

impl BudgetLedger {
    /// Create a ledger with the given total capacity.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: 0,
            reservations: HashMap::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Capacity not held by any reservation.
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Usage as a percentage (0.0–100.0).
    pub fn usage_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64) * 100.0
    }

    /// Reserve `cost` for `model_id`.
    ///
    /// An id that already holds a reservation succeeds without being counted
    /// twice. Fails (without side effects) when `cost` exceeds availability.
    pub fn reserve(&mut self, model_id: &str, cost: u64) -> Reservation {
        if self.reservations.contains_key(model_id) {
            return Reservation {
                reserved: true,
                available: self.available(),
            };
        }
        if cost > self.available() {
            return Reservation {
                reserved: false,
                available: self.available(),
            };
        }
        self.reservations.insert(model_id.to_string(), cost);
        self.used += cost;
        Reservation {
            reserved: true,
            available: self.available(),
        }
    }

    /// Release the reservation held by `model_id`, returning the freed cost.
    ///
    /// Releasing an id without a reservation is a no-op.
    pub fn release(&mut self, model_id: &str) -> Option<u64> {
        let cost = self.reservations.remove(model_id)?;
        self.used = self.used.saturating_sub(cost);
        Some(cost)
    }

    pub fn is_active(&self, model_id: &str) -> bool {
        self.reservations.contains_key(model_id)
    }

    /// Cost currently reserved for `model_id`.
    pub fn reserved_cost(&self, model_id: &str) -> Option<u64> {
        self.reservations.get(model_id).copied()
    }

    /// Number of reservations held.
    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}
