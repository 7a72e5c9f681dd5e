//! Deadline budgets for blocking operations.
//!
//! Every suspension point in the control plane takes a [`TimeBudget`]: a
//! fixed deadline that shrinks as an operation progresses. The negotiation
//! engine threads one budget through every leg; the close path threads one
//! through close-output, the input-closed wait, and the final core close.
//! Running out anywhere surfaces as [`Error::Timeout`], which is distinct
//! from a fault.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// A deadline carried through a chain of blocking calls.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    deadline: Instant,
}

impl TimeBudget {
    /// Create a budget expiring `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Budget left, zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn is_elapsed(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// Run a future against the remaining budget.
    ///
    /// `operation` names the caller for the timeout report.
    pub async fn run<F, T>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(operation)),
        }
    }

    /// Build the timeout error for this budget.
    pub fn timeout_error(&self, operation: &'static str) -> Error {
        Error::Timeout {
            operation,
            legs: 0,
            remaining: self.remaining(),
        }
    }
}
