//! Managed-transaction retries: backoff envelope, terminal classification,
//! and bookmark propagation on commit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bolt_client::{AuthToken, Config, Driver, Error, ServerError, SessionConfig};
use bolt_test_utils::{MockBoltServer, ServerScript};

#[tokio::test]
async fn transient_failures_retry_with_exponential_jittered_delays() {
    let script = ServerScript {
        commit_bookmark: Some("bookmark:after-retry".to_owned()),
        ..ServerScript::default()
    };
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");
    let session = driver.session(SessionConfig::default());

    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_left = Arc::new(AtomicUsize::new(3));

    let value = session
        .write_transaction(|_tx| {
            let attempts = Arc::clone(&attempts);
            let failures_left = Arc::clone(&failures_left);
            async move {
                attempts.lock().unwrap().push(Instant::now());
                if failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(Error::ServiceUnavailable("synthetic outage".to_owned()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .expect("fourth attempt succeeds");
    assert_eq!(value, 42);

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 4);
    // delay_i ∈ [d0·2^i·(1−0.2), d0·2^i·(1+0.2)], d0 = 1 s; generous upper
    // slack for scheduling and the begin/rollback round-trips.
    for (i, expected_ms) in [1_000.0f64, 2_000.0, 4_000.0].iter().enumerate() {
        let gap = attempts[i + 1].duration_since(attempts[i]).as_millis() as f64;
        assert!(
            gap >= expected_ms * 0.8 - 5.0,
            "delay {i} too short: {gap} ms"
        );
        assert!(
            gap <= expected_ms * 1.2 + 300.0,
            "delay {i} too long: {gap} ms"
        );
    }

    // The successful commit advanced the session's bookmark chain.
    assert_eq!(
        session.last_bookmarks().values(),
        ["bookmark:after-retry"],
        "commit bookmark must thread into the session"
    );

    session.close().await;
    driver.close().await;
}

#[tokio::test]
async fn user_terminations_and_client_errors_do_not_retry() {
    let server = MockBoltServer::start().await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");
    let session = driver.session(SessionConfig::default());

    for code in [
        "Neo.TransientError.Transaction.Terminated",
        "Neo.TransientError.Transaction.LockClientStopped",
        "Neo.ClientError.Statement.SyntaxError",
    ] {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<(), Error> = session
            .write_transaction(|_tx| {
                let calls = Arc::clone(&calls);
                let code = code.to_owned();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Server(ServerError::new(code, "stop")))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{code} must not retry");
    }

    session.close().await;
    driver.close().await;
}

#[tokio::test]
async fn the_retry_budget_caps_total_time() {
    let server = MockBoltServer::start().await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config {
            // Budget below the first backoff delay: exactly two attempts.
            max_transaction_retry_time_ms: 500,
            ..Config::default()
        },
    )
    .expect("driver");
    let session = driver.session(SessionConfig::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let result: Result<(), Error> = session
        .write_transaction(|_tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ServiceUnavailable("still down".to_owned()))
            }
        })
        .await;
    assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
    assert_eq!(
        calls.load(Ordering::SeqCst),
        2,
        "one retry fits a 500 ms budget with a ~1 s first delay"
    );

    session.close().await;
    driver.close().await;
}
