//! Cached premium status with single-flight refresh.

use async_trait::async_trait;
use convo_core::{EntitlementProvider, PremiumInfo, PremiumStatus, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What the caller of [`EntitlementCache::request`] has to do next.
pub enum StatusRequest<C> {
    /// Cached value is fresh; answer now.
    Fresh(C, PremiumStatus),
    /// A fetch is already outstanding.
    Queued,
    /// Start a fetch and report back through [`EntitlementCache::complete`].
    Fetch,
}

/// Outcome of a fetch as handed to queued callers.
pub struct StatusUpdate<C> {
    pub waiters: Vec<C>,
    pub result: std::result::Result<PremiumStatus, String>,
    pub changed: bool,
}

pub struct EntitlementCache<C> {
    status: PremiumStatus,
    info: Option<PremiumInfo>,
    fetched_at: Option<Instant>,
    max_age: Duration,
    in_flight: bool,
    waiters: Vec<C>,
}

impl<C> EntitlementCache<C> {
    pub fn new(max_age: Duration) -> Self {
        Self {
            status: PremiumStatus::Unknown,
            info: None,
            fetched_at: None,
            max_age,
            in_flight: false,
            waiters: Vec::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.fetched_at
            .map_or(false, |at| at.elapsed() < self.max_age)
    }

    /// `force` skips the freshness check but still joins an outstanding fetch.
    pub fn request(&mut self, callback: C, force: bool) -> StatusRequest<C> {
        if self.in_flight {
            self.waiters.push(callback);
            return StatusRequest::Queued;
        }
        if !force && self.is_fresh() {
            return StatusRequest::Fresh(callback, self.status);
        }
        debug!("Refreshing premium status (forced: {})", force);
        self.in_flight = true;
        self.waiters.push(callback);
        StatusRequest::Fetch
    }

    /// A failure keeps the last known status.
    pub fn complete(
        &mut self,
        result: std::result::Result<(PremiumStatus, Option<PremiumInfo>), String>,
    ) -> StatusUpdate<C> {
        self.in_flight = false;
        let waiters = std::mem::take(&mut self.waiters);
        match result {
            Ok((status, info)) => {
                let changed = status != self.status;
                self.status = status;
                self.info = info;
                self.fetched_at = Some(Instant::now());
                StatusUpdate {
                    waiters,
                    result: Ok(status),
                    changed,
                }
            }
            Err(reason) => {
                warn!("Premium status fetch failed, keeping {:?}: {}", self.status, reason);
                StatusUpdate {
                    waiters,
                    result: Err(reason),
                    changed: false,
                }
            }
        }
    }

    pub fn cached(&self) -> PremiumStatus {
        self.status
    }

    pub fn info(&self) -> Option<&PremiumInfo> {
        self.info.as_ref()
    }

    /// Forget queued callers without answering them.
    pub fn shutdown(&mut self) -> usize {
        self.in_flight = false;
        std::mem::take(&mut self.waiters).len()
    }
}

/// Provider that always reports a configured status. Used where no account
/// service is reachable, such as the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedEntitlementProvider {
    status: PremiumStatus,
}

impl FixedEntitlementProvider {
    pub fn new(status: PremiumStatus) -> Self {
        Self { status }
    }
}

#[async_trait]
impl EntitlementProvider for FixedEntitlementProvider {
    async fn fetch_premium_status(&self) -> Result<(PremiumStatus, Option<PremiumInfo>)> {
        Ok((self.status, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let mut cache = EntitlementCache::new(Duration::from_secs(60));
        assert!(matches!(cache.request(1, false), StatusRequest::Fetch));
        assert!(matches!(cache.request(2, false), StatusRequest::Queued));
        assert!(matches!(cache.request(3, true), StatusRequest::Queued));

        let update = cache.complete(Ok((PremiumStatus::Active, None)));
        assert_eq!(update.waiters, vec![1, 2, 3]);
        assert_eq!(update.result, Ok(PremiumStatus::Active));
        assert!(update.changed);

        assert!(matches!(
            cache.request(4, false),
            StatusRequest::Fresh(4, PremiumStatus::Active)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_value_triggers_refetch() {
        let mut cache = EntitlementCache::new(Duration::from_secs(60));
        assert!(matches!(cache.request(1, false), StatusRequest::Fetch));
        cache.complete(Ok((PremiumStatus::Inactive, None)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(cache.request(2, false), StatusRequest::Fetch));
        let update = cache.complete(Ok((PremiumStatus::Inactive, None)));
        assert!(!update.changed);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_refresh_bypasses_freshness() {
        let mut cache = EntitlementCache::new(Duration::from_secs(60));
        assert!(matches!(cache.request(1, false), StatusRequest::Fetch));
        cache.complete(Ok((PremiumStatus::Inactive, None)));
        assert!(matches!(cache.request(2, true), StatusRequest::Fetch));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_last_known_status() {
        let mut cache = EntitlementCache::new(Duration::from_secs(60));
        assert!(matches!(cache.request(1, false), StatusRequest::Fetch));
        cache.complete(Ok((PremiumStatus::Active, None)));

        assert!(matches!(cache.request(2, true), StatusRequest::Fetch));
        let update = cache.complete(Err("offline".into()));
        assert_eq!(update.waiters, vec![2]);
        assert!(update.result.is_err());
        assert_eq!(cache.cached(), PremiumStatus::Active);
    }

    #[tokio::test]
    async fn fixed_provider_reports_configured_status() {
        let provider = FixedEntitlementProvider::new(PremiumStatus::ActiveDisconnected);
        let (status, info) = provider.fetch_premium_status().await.unwrap();
        assert_eq!(status, PremiumStatus::ActiveDisconnected);
        assert!(info.is_none());
    }
}
