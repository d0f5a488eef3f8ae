//! Byte quota accounting shared by the built-in providers.

use std::sync::atomic::{AtomicU64, Ordering};

use crmcontent_common::{Error, Result};

/// Tracks bytes used by one provider against an optional limit.
///
/// Reservations are atomic, so concurrent writers can never jointly exceed
/// the limit.
#[derive(Debug)]
pub struct QuotaTracker {
    provider: String,
    limit: Option<u64>,
    used: AtomicU64,
}

impl QuotaTracker {
    /// Create a tracker starting at `used` bytes.
    pub fn new(provider: impl Into<String>, limit: Option<u64>, used: u64) -> Self {
        Self {
            provider: provider.into(),
            limit,
            used: AtomicU64::new(used),
        }
    }

    /// Configured limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Bytes currently accounted.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available, `None` when unlimited.
    pub fn available(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used()))
    }

    /// Fail early if `bytes` can no longer fit, without reserving.
    pub fn ensure_fits(&self, bytes: u64) -> Result<()> {
        match self.available() {
            Some(available) if bytes > available => Err(self.exceeded(bytes, available)),
            _ => Ok(()),
        }
    }

    /// Reserve `bytes`.
    ///
    /// # Errors
    /// - `Quota` if the reservation would exceed the limit
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };

        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|used| self.exceeded(bytes, limit.saturating_sub(used)))
    }

    /// Return `bytes` to the pool.
    pub fn release(&self, bytes: u64) {
        // Never underflows: the closure always returns Some.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Account for an object changing size from `old` to `new` bytes.
    pub fn resize(&self, old: u64, new: u64) -> Result<()> {
        if new > old {
            self.reserve(new - old)
        } else {
            self.release(old - new);
            Ok(())
        }
    }

    fn exceeded(&self, requested: u64, available: u64) -> Error {
        Error::Quota(format!(
            "Provider '{}' cannot store {} bytes ({} bytes available)",
            self.provider, requested, available
        ))
    }
}
