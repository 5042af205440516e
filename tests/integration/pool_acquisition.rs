//! Pool capacity behavior through the public driver surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bolt_client::{AuthToken, Config, Driver, Error, SessionConfig, Value};
use bolt_test_utils::{MockBoltServer, QueryScript, ServerScript};

#[tokio::test]
async fn full_pool_times_out_waiters_and_recovers_after_release() {
    let script = ServerScript::default().with_query(
        "RETURN 1 AS n",
        QueryScript::returning(&["n"], vec![vec![Value::Int(1)]]),
    );
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config {
            max_connection_pool_size: 1,
            connection_acquisition_timeout_ms: 50,
            ..Config::default()
        },
    )
    .expect("driver");

    // A holds the one connection via an open transaction.
    let holder_session = driver.session(SessionConfig::default());
    let tx = holder_session
        .begin_transaction()
        .await
        .expect("begin transaction");

    // B waits its 50 ms, then fails with the timeout error.
    let blocked_session = driver.session(SessionConfig::default());
    let started = Instant::now();
    let err = blocked_session
        .run("RETURN 1 AS n", HashMap::new())
        .await
        .expect_err("no capacity: acquisition must time out");
    assert!(matches!(err, Error::AcquisitionTimeout(50)), "{err}");
    assert!(
        started.elapsed() >= Duration::from_millis(40),
        "timed out too early: {:?}",
        started.elapsed()
    );
    blocked_session.close().await;

    // A finishes and releases; C succeeds immediately.
    tx.commit().await.expect("commit");
    holder_session.close().await;

    let third_session = driver.session(SessionConfig::default());
    let mut stream = third_session
        .run("RETURN 1 AS n", HashMap::new())
        .await
        .expect("acquire after release");
    assert!(stream.next().await.expect("record").is_some());
    third_session.close().await;

    driver.close().await;
}

#[tokio::test]
async fn a_waiter_parked_within_the_deadline_gets_the_released_connection() {
    let script = ServerScript::default().with_query(
        "RETURN 1 AS n",
        QueryScript::returning(&["n"], vec![vec![Value::Int(1)]]),
    );
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config {
            max_connection_pool_size: 1,
            connection_acquisition_timeout_ms: 2_000,
            ..Config::default()
        },
    )
    .expect("driver");

    let holder_session = driver.session(SessionConfig::default());
    let tx = holder_session
        .begin_transaction()
        .await
        .expect("begin transaction");

    let waiting_session = driver.session(SessionConfig::default());
    let waiter = tokio::spawn(async move {
        let mut stream = waiting_session
            .run("RETURN 1 AS n", HashMap::new())
            .await?;
        let record = stream.next().await?;
        waiting_session.close().await;
        Ok::<_, Error>(record.is_some())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.commit().await.expect("commit");
    holder_session.close().await;

    let got_record = waiter.await.expect("join").expect("waiter succeeds");
    assert!(got_record);

    driver.close().await;
}
