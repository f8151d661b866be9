// RemoteSemaphore client path against an in-memory ledger runner: argument
// building, status decoding, retry behaviour, close semantics, and failure
// classification.

mod support;

use std::sync::Arc;
use std::time::Duration;

use xsemaphore::{
    AcquireOptions, Error, QueryOptions, RemoteConfig, RemoteSemaphore, Semaphore,
};

use support::{FakeLedgerRunner, Failure};

fn remote(runner: &Arc<FakeLedgerRunner>) -> RemoteSemaphore {
    RemoteSemaphore::with_runner(Arc::clone(runner) as _, RemoteConfig::default())
        .expect("remote semaphore should build")
}

#[tokio::test]
async fn capacity_bounds_holders_in_the_store_ledger() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(3, Duration::from_secs(60));

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(sem.try_acquire("encode", &opts).await.expect("no error").expect("slot"));
    }
    assert!(sem.try_acquire("encode", &opts).await.expect("no error").is_none());

    held.pop().expect("permits held").release().await.expect("release should succeed");
    assert!(sem.try_acquire("encode", &opts).await.expect("no error").is_some());

    assert_eq!(runner.live_keys(), vec!["xsemaphore:{encode}:permits".to_string()]);
}

#[tokio::test]
async fn tenant_ledgers_are_separate_keys_with_the_same_hash_tag() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let for_a = AcquireOptions::new(100, Duration::from_secs(60)).with_tenant("a", 2);
    let for_b = AcquireOptions::new(100, Duration::from_secs(60)).with_tenant("b", 2);

    let _a1 = sem.try_acquire("jobs", &for_a).await.expect("no error").expect("slot");
    let _a2 = sem.try_acquire("jobs", &for_a).await.expect("no error").expect("slot");
    assert!(sem.try_acquire("jobs", &for_a).await.expect("no error").is_none());
    let _b1 = sem.try_acquire("jobs", &for_b).await.expect("no error").expect("slot");

    let keys = runner.live_keys();
    assert_eq!(
        keys,
        vec![
            "xsemaphore:{jobs}:permits".to_string(),
            "xsemaphore:{jobs}:t:a".to_string(),
            "xsemaphore:{jobs}:t:b".to_string(),
        ]
    );
    assert_eq!(runner.members("xsemaphore:{jobs}:t:a").len(), 2);
    assert_eq!(runner.members("xsemaphore:{jobs}:t:b").len(), 1);
    assert_eq!(runner.members("xsemaphore:{jobs}:permits").len(), 3);
}

#[tokio::test]
async fn expired_members_are_swept_by_the_next_acquire() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(1, Duration::from_millis(100));

    let _held = sem.try_acquire("short", &opts).await.expect("no error").expect("slot");
    assert!(sem.try_acquire("short", &opts).await.expect("no error").is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        sem.try_acquire("short", &opts).await.expect("no error").is_some(),
        "acquire should sweep the expired member and take its slot"
    );
}

#[tokio::test]
async fn blocking_acquire_spaces_attempts_and_reports_exhaustion() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts =
        AcquireOptions::new(1, Duration::from_secs(60)).with_retry(3, Duration::from_millis(20));

    let _held = sem.try_acquire("contested", &opts).await.expect("no error").expect("slot");
    let before = runner.invocations("acquire");

    let err = sem.acquire("contested", &opts).await.expect_err("retries should exhaust");
    assert!(matches!(err, Error::AcquireFailed { attempts: 3 }));
    assert_eq!(runner.invocations("acquire") - before, 3, "one script call per attempt");
}

#[tokio::test]
async fn query_reads_counts_without_pruning() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(5, Duration::from_millis(80)).with_tenant("acme", 3);

    let _p1 = sem.try_acquire("observed", &opts).await.expect("no error").expect("slot");
    let _p2 = sem.try_acquire("observed", &opts).await.expect("no error").expect("slot");

    let info = sem
        .query("observed", &QueryOptions::new(5).with_tenant("acme", 3))
        .await
        .expect("query should succeed");
    assert_eq!(info.global.used, 2);
    assert_eq!(info.global.available, 3);
    let tenant = info.tenant.expect("tenant usage should be present");
    assert_eq!(tenant.used, 2);

    // After expiry the members still sit in the ledger; query reports them
    // gone but does not remove them.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let info = sem
        .query("observed", &QueryOptions::new(5).with_tenant("acme", 3))
        .await
        .expect("query should succeed");
    assert_eq!(info.global.used, 0);
    assert_eq!(runner.members("xsemaphore:{observed}:permits").len(), 2);
}

#[tokio::test]
async fn extend_advances_the_score_and_detects_external_loss() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(1, Duration::from_secs(60));

    let permit = sem.try_acquire("extended", &opts).await.expect("no error").expect("slot");
    let initial = permit.expires_at();

    tokio::time::sleep(Duration::from_millis(10)).await;
    permit.extend().await.expect("extend should succeed");
    assert!(permit.expires_at() > initial);

    // Someone else removes the member; the next extend must report the loss.
    runner.evict_member(permit.id());
    let err = permit.extend().await.expect_err("extend after loss should fail");
    assert!(matches!(err, Error::PermitNotHeld));

    // Release after loss is downgraded to success.
    permit.release().await.expect("release after loss should be absorbed");
}

#[tokio::test]
async fn close_refuses_new_work_but_not_inflight_permits() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(2, Duration::from_secs(60));

    let permit = sem.try_acquire("closing", &opts).await.expect("no error").expect("slot");

    sem.close().await.expect("close should succeed");
    sem.close().await.expect("close should be idempotent");

    let err = sem.try_acquire("closing", &opts).await.expect_err("acquire after close");
    assert!(matches!(err, Error::SemaphoreClosed));
    let err = sem.query("closing", &QueryOptions::new(2)).await.expect_err("query after close");
    assert!(matches!(err, Error::SemaphoreClosed));
    let err = sem.health().await.expect_err("health after close");
    assert!(matches!(err, Error::SemaphoreClosed));

    permit.extend().await.expect("extend must keep working after close");
    permit.release().await.expect("release must keep working after close");
}

#[tokio::test]
async fn io_failures_classify_as_store_unavailable() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(1, Duration::from_secs(60));

    runner.fail_with(Some(Failure::ConnectionRefused));
    let err = sem.try_acquire("down", &opts).await.expect_err("store failure should surface");
    assert!(err.is_store_unavailable(), "got {err:?}");

    let err = sem.health().await.expect_err("health should fail while down");
    assert!(err.is_store_unavailable());

    runner.fail_with(None);
    sem.health().await.expect("health should recover with the store");
}

#[tokio::test]
async fn unreloadable_noscript_classifies_as_store_unavailable() {
    // Scenario: the server answers NOSCRIPT to both EVALSHA and EVAL, i.e.
    // the automatic reload inside the script runner could not help.
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts = AcquireOptions::new(1, Duration::from_secs(60));

    runner.fail_with(Some(Failure::Noscript));
    let err = sem.try_acquire("proxied", &opts).await.expect_err("noscript should surface");
    assert!(err.is_store_unavailable());

    runner.fail_with(Some(Failure::UnknownCommand));
    let err = sem.try_acquire("proxied", &opts).await.expect_err("missing EVAL should surface");
    assert!(err.is_store_unavailable());
}

#[tokio::test]
async fn try_again_is_absorbed_not_escalated() {
    let runner = FakeLedgerRunner::new();
    let sem = remote(&runner);
    let opts =
        AcquireOptions::new(1, Duration::from_secs(60)).with_retry(2, Duration::from_millis(10));

    runner.fail_with(Some(Failure::TryAgain));

    // A single attempt reports "no slot" instead of erroring.
    let outcome = sem.try_acquire("churning", &opts).await.expect("tryagain should not error");
    assert!(outcome.is_none());

    // The blocking path retries through it and then gives up normally.
    let err = sem.acquire("churning", &opts).await.expect_err("retries should exhaust");
    assert!(matches!(err, Error::AcquireFailed { attempts: 2 }));
}

#[tokio::test]
async fn default_timeout_maps_to_deadline_exceeded() {
    struct StallingRunner;

    #[async_trait::async_trait]
    impl xsemaphore::ScriptRunner for StallingRunner {
        async fn invoke(
            &self,
            _script: &xsemaphore::SemScript,
            _keys: &[String],
            _args: &[String],
        ) -> Result<redis::Value, redis::RedisError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(redis::Value::Array(vec![]))
        }

        async fn ping(&self) -> Result<(), redis::RedisError> {
            Ok(())
        }
    }

    let sem = RemoteSemaphore::with_runner(
        Arc::new(StallingRunner),
        RemoteConfig::default().with_default_timeout(Duration::from_millis(50)),
    )
    .expect("remote semaphore should build");

    let err = sem
        .try_acquire("stalled", &AcquireOptions::new(1, Duration::from_secs(60)))
        .await
        .expect_err("stalled call should hit the default timeout");
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(!err.is_store_unavailable(), "a deadline is not a store outage");
}
