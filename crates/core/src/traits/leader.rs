use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;

/// Leader election over a shared, expiring lease. The one true mutual
/// exclusion primitive in the system: only the beat scheduler uses it, to
/// guarantee a single active instance.
///
/// A crashed leader's lock self-expires after its ttl, so another instance
/// can take over without manual intervention.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Try to acquire the lock for `holder`. Succeeds when the lock is
    /// free, expired, or already held by the same holder.
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool>;

    /// Refresh the expiry of a lock held by `holder`. Returns `false` when
    /// the lock was lost in the meantime.
    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock if held by `holder`.
    async fn release(&self, holder: &str) -> Result<()>;
}
