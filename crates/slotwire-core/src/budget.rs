//! Flush budget for send loops.
//!
//! A flush loop keeps draining its queue in place while more work is
//! pending. To keep one busy connection from monopolizing a worker, the loop
//! spends one unit per cycle and hands control back to the scheduler once the
//! budget runs out. Idle waits reset the budget.

/// Default number of back-to-back flush cycles before handing off.
pub const DEFAULT_FLUSH_BUDGET: u32 = 1000;

#[derive(Debug, Clone)]
pub struct FlushBudget {
    limit: u32,
    used: u32,
}

impl Default for FlushBudget {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_BUDGET)
    }
}

impl FlushBudget {
    /// A limit of zero is treated as one.
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            used: 0,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Records one completed cycle.
    ///
    /// Returns `true` when the budget is exhausted; the caller must yield
    /// before the next cycle. The budget is refilled at that point.
    #[must_use]
    pub fn spend(&mut self) -> bool {
        self.used += 1;
        if self.used >= self.limit {
            self.used = 0;
            true
        } else {
            false
        }
    }

    /// Refills the budget, called after the loop went idle.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}
