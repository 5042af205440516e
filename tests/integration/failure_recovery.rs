//! The in-connection failure/recovery cycle: a failed query poisons the
//! pipeline, the engine spontaneously resets, and the connection keeps
//! serving afterwards.

use std::collections::HashMap;
use std::time::Duration;

use bolt_client::{AuthToken, Config, Driver, SessionConfig, Value};
use bolt_test_utils::{MockBoltServer, QueryScript, ServerScript};

const SIG_INIT: u8 = 0x01;
const SIG_RESET: u8 = 0x0F;
const SIG_RUN: u8 = 0x10;
const SIG_PULL_ALL: u8 = 0x3F;

#[tokio::test]
async fn failed_query_triggers_reset_and_the_connection_recovers() {
    let script = ServerScript::default()
        .with_query(
            "INVALID",
            QueryScript::failing("Neo.ClientError.Statement.SyntaxError", "Invalid input"),
        )
        .with_query(
            "RETURN 1 AS n",
            QueryScript::returning(&["n"], vec![vec![Value::Int(1)]]),
        );
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");
    let session = driver.session(SessionConfig::default());

    // RUN + PULL are pipelined; the failure surfaces on the stream.
    let mut stream = session
        .run("INVALID", HashMap::new())
        .await
        .expect("sending the query itself succeeds");
    let err = stream.next().await.expect_err("stream must fail");
    assert!(err.to_string().contains("SyntaxError"), "{err}");

    // Engine must have sent RESET right after the failure, before anything
    // the user does next.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server.received(),
        vec![SIG_INIT, SIG_RUN, SIG_PULL_ALL, SIG_RESET],
        "RESET must directly follow the failed query"
    );

    // Same session, same pooled connection: works again after recovery.
    let mut stream = session
        .run("RETURN 1 AS n", HashMap::new())
        .await
        .expect("run after recovery");
    let record = stream.next().await.expect("next").expect("record");
    assert_eq!(record.get("n"), Some(&Value::Int(1)));

    let tail = &server.received()[4..];
    assert_eq!(tail, [SIG_RUN, SIG_PULL_ALL]);

    session.close().await;
    driver.close().await;
}

#[tokio::test]
async fn recovered_connection_reports_fresh_errors_not_the_cached_one() {
    let script = ServerScript::default()
        .with_query(
            "FIRST",
            QueryScript::failing("Neo.ClientError.Statement.SyntaxError", "first"),
        )
        .with_query(
            "SECOND",
            QueryScript::failing("Neo.ClientError.Statement.ArgumentError", "second"),
        );
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");
    let session = driver.session(SessionConfig::default());

    let mut first = session.run("FIRST", HashMap::new()).await.expect("send");
    let err = first.next().await.expect_err("first fails");
    assert!(err.to_string().contains("SyntaxError"));

    let mut second = session.run("SECOND", HashMap::new()).await.expect("send");
    let err = second.next().await.expect_err("second fails");
    assert!(
        err.to_string().contains("ArgumentError"),
        "cached failure must have been cleared by the recovery reset: {err}"
    );

    session.close().await;
    driver.close().await;
}
