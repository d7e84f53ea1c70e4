use fieldgate::telemetry::{AdmissionEvent, IdempotencyEvent, MemorySink};
use fieldgate::{
    FingerprintGenerator, IdempotencyCache, IdempotencyStore, InMemoryIdempotencyStore, Telemetry,
};
use std::time::Duration;

fn cache(ttl: Duration) -> IdempotencyCache<InMemoryIdempotencyStore> {
    IdempotencyCache::new(
        InMemoryIdempotencyStore::new(ttl),
        FingerprintGenerator::new("integration-secret").unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn record_expires_after_ttl_without_a_sweep() {
    let cache = cache(Duration::from_millis(100));
    cache.store_result("k", 200, "ok", "text/plain").await.unwrap();
    assert!(cache.exists("k").await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!cache.exists("k").await.unwrap());
    assert!(cache.check_duplicate("k").await.unwrap().is_none());
    assert_eq!(cache.store().len(), 1);
}

#[tokio::test]
async fn store_check_delete_cycle() {
    let cache = cache(Duration::from_secs(300));
    let key = cache.generate_key(br#"{"crewId":"c1","status":"working"}"#);

    assert!(cache.check_duplicate(&key).await.unwrap().is_none());
    cache.store_result(&key, 202, r#"{"success":true}"#, "application/json").await.unwrap();

    let outcome = cache.check_duplicate(&key).await.unwrap().expect("recorded");
    assert_eq!(outcome.status_code, 202);
    assert_eq!(outcome.body_str(), Some(r#"{"success":true}"#));
    assert_eq!(outcome.content_type, "application/json");

    cache.delete(&key).await.unwrap();
    assert!(cache.check_duplicate(&key).await.unwrap().is_none());
    assert!(!cache.exists(&key).await.unwrap());
}

#[test]
fn fingerprints_are_pure_and_scoped() {
    let keys = FingerprintGenerator::new("integration-secret").unwrap();
    let body = br#"{"crewId":"c1","progressPercentage":40}"#;

    assert_eq!(keys.generate_key(body), keys.generate_key(body));
    assert_ne!(keys.generate_key(body), keys.generate_key(br#"{"crewId":"c1","progressPercentage":41}"#));
    assert_ne!(
        keys.generate_key_with_context(body, "crew-1"),
        keys.generate_key_with_context(body, "crew-2")
    );
    assert_ne!(keys.generate_key_with_context(body, "crew-1"), keys.generate_key(body));

    let other = FingerprintGenerator::new("another-secret").unwrap();
    assert_ne!(keys.generate_key(body), other.generate_key(body));
}

#[tokio::test(start_paused = true)]
async fn started_store_sweeps_in_the_background() {
    let sink = MemorySink::new();
    let store = InMemoryIdempotencyStore::new(Duration::from_millis(100))
        .with_telemetry(Telemetry::new(sink.clone()))
        .start(Duration::from_secs(1));
    for n in 0..3 {
        store
            .set(&format!("k{n}"), fieldgate::StoredOutcome::new(202, "", "application/json"))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1_050)).await;
    assert!(store.is_empty());
    assert_eq!(
        sink.events(),
        vec![AdmissionEvent::Idempotency(IdempotencyEvent::Swept { evicted: 3 })]
    );

    store.close().await.unwrap();
    assert!(!store.is_sweeping());
}

#[tokio::test]
async fn concurrent_writers_leave_one_record_per_key() {
    let cache = cache(Duration::from_secs(60));
    let writes = (0..32u16).map(|n| {
        let cache = cache.clone();
        async move { cache.store_result(&format!("k{}", n % 4), 200 + n, "", "text/plain").await }
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }
    assert_eq!(cache.store().len(), 4);
}
