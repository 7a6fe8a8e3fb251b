use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convo_config::ServiceConfig;
use convo_core::{ConvoError, EntitlementProvider, PremiumInfo, PremiumStatus, Result};
use convo_service::{ConversationService, ServiceEvent};
use mockall::mock;
use tokio_stream::StreamExt;

mock! {
    pub Provider {}

    #[async_trait]
    impl EntitlementProvider for Provider {
        async fn fetch_premium_status(&self) -> Result<(PremiumStatus, Option<PremiumInfo>)>;
    }
}

fn build_service(provider: MockProvider) -> ConversationService {
    let config = ServiceConfig::from_yaml_str(
        r#"
storage:
  enabled: false
lifecycle:
  association_sweep_secs: 0
entitlement:
  max_age_secs: 60
"#,
    )
    .unwrap();
    ConversationService::new(&config, None, Arc::new(provider))
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_fetch() {
    let mut provider = MockProvider::new();
    provider
        .expect_fetch_premium_status()
        .times(1)
        .returning(|| Ok((PremiumStatus::Active, None)));
    let service = build_service(provider);

    let (a, b, c) = tokio::join!(
        service.premium_status(),
        service.premium_status(),
        service.premium_status()
    );
    assert_eq!(a.unwrap(), PremiumStatus::Active);
    assert_eq!(b.unwrap(), PremiumStatus::Active);
    assert_eq!(c.unwrap(), PremiumStatus::Active);

    // Still fresh, answered from cache
    assert_eq!(service.premium_status().await.unwrap(), PremiumStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn stale_status_is_refetched() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut provider = MockProvider::new();
    provider.expect_fetch_premium_status().returning(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok((PremiumStatus::Inactive, None))
    });
    let service = build_service(provider);

    service.premium_status().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    service.premium_status().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    service.premium_status().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    service.refresh_premium_status().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_last_known_status() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut provider = MockProvider::new();
    provider.expect_fetch_premium_status().returning(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok((
                PremiumStatus::Active,
                Some(PremiumInfo {
                    remaining_credential_count: 3,
                    next_active_at: None,
                }),
            ))
        } else {
            Err(ConvoError::Entitlement("account service offline".into()))
        }
    });
    let service = build_service(provider);

    assert_eq!(service.cached_premium_status().await.unwrap().0, PremiumStatus::Unknown);
    assert_eq!(service.premium_status().await.unwrap(), PremiumStatus::Active);

    assert!(matches!(
        service.refresh_premium_status().await,
        Err(ConvoError::Entitlement(_))
    ));
    let (status, info) = service.cached_premium_status().await.unwrap();
    assert_eq!(status, PremiumStatus::Active);
    assert_eq!(info.unwrap().remaining_credential_count, 3);
}

#[tokio::test(start_paused = true)]
async fn status_changes_are_broadcast() {
    let mut provider = MockProvider::new();
    provider
        .expect_fetch_premium_status()
        .returning(|| Ok((PremiumStatus::ActiveDisconnected, None)));
    let service = build_service(provider);
    let mut events = service.subscribe();

    service.premium_status().await.unwrap();
    match events.next().await {
        Some(Ok(ServiceEvent::PremiumStatusChanged(status))) => {
            assert_eq!(status, PremiumStatus::ActiveDisconnected);
            assert!(status.is_premium());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
