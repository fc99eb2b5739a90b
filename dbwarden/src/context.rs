//! Caller-supplied cancellation and deadlines.
//!
//! Every suspending operation in the connection layer runs under a [`Context`]. When the
//! context's token is cancelled, or its deadline passes, the operation stops at its next
//! suspension point and surfaces [`Error::Cancelled`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

/// Why an operation was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The context's token was cancelled
    Token,
    /// The context's deadline passed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Token => f.write_str("cancelled by caller"),
            CancelReason::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Cancellation token plus optional deadline, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled unless [`Context::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. one tied to process shutdown.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set a deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// A child context: cancelled along with this one, but cancelling it leaves the parent alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason if this context is already done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled {
                reason: CancelReason::Token,
            });
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Cancelled {
                reason: CancelReason::Deadline,
            });
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled { reason: CancelReason::Token }),
            _ = deadline => Err(Error::Cancelled { reason: CancelReason::Deadline }),
            out = fut => Ok(out),
        }
    }
}
