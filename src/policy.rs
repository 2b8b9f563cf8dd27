// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Retry budget and cancel-run detection shared by both engines

use tracing::warn;

use crate::error::TransferError;
use crate::protocol::CAN;

// ============================================================================
// Retry Budget
// ============================================================================

/// Bounded count of consecutive failures.
///
/// `max` counts retries after the first attempt, so the budget gives out on
/// failure `max + 1`. Every retryable failure spends one unit; verified
/// progress refills the budget.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max: u32,
    spent: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        RetryBudget { max, spent: 0 }
    }

    /// Record a failure. Returns `RetriesExhausted` when no retry is left.
    pub fn spend(&mut self, cause: &TransferError) -> Result<(), TransferError> {
        self.spent += 1;
        warn!("retry {}/{}: {}", self.spent, self.max, cause);
        if self.spent > self.max {
            Err(TransferError::RetriesExhausted(self.max))
        } else {
            Ok(())
        }
    }

    pub fn reset(&mut self) {
        self.spent = 0;
    }

    pub fn spent(&self) -> u32 {
        self.spent
    }
}

// ============================================================================
// Cancel Detection
// ============================================================================

/// Counts consecutive CAN bytes on the receive path.
#[derive(Debug, Clone)]
pub struct CancelRun {
    threshold: usize,
    count: usize,
}

impl CancelRun {
    pub fn new(threshold: usize) -> Self {
        CancelRun { threshold, count: 0 }
    }

    /// Feed one received byte; true when the run reaches the threshold.
    pub fn observe(&mut self, byte: u8) -> bool {
        if byte == CAN {
            self.count += 1;
            self.count >= self.threshold
        } else {
            self.count = 0;
            false
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}
