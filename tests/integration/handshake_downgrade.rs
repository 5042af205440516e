//! Version negotiation against servers that pick an older protocol or turn
//! out not to speak the protocol at all.

use std::collections::HashMap;

use bolt_client::{AuthToken, BoltVersion, Config, Driver, Error, SessionConfig, Value};
use bolt_test_utils::{MockBoltServer, QueryScript, ServerScript};

#[tokio::test]
async fn downgraded_server_runs_v3_messages_and_loses_byte_arrays() {
    let script = ServerScript {
        handshake_version: Some(3),
        server_agent: "Neo4j/3.1.0".to_owned(),
        ..ServerScript::default()
    }
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

    let info = driver.verify_connectivity().await.expect("connectivity");
    assert_eq!(info.protocol_version, BoltVersion::V3);
    assert_eq!(info.agent.as_deref(), Some("Neo4j/3.1.0"));

    // Queries flow over the downgraded message set.
    let session = driver.session(SessionConfig::default());
    let mut stream = session
        .run("RETURN 1 AS n", HashMap::new())
        .await
        .expect("run");
    let record = stream.next().await.expect("next").expect("record");
    assert_eq!(record.get("n"), Some(&Value::Int(1)));
    assert!(stream.next().await.expect("end").is_none());

    // A 3.1 server predates byte arrays: packing one must fail locally.
    let mut parameters = HashMap::new();
    parameters.insert("blob".to_owned(), Value::Bytes(vec![1, 2, 3]));
    let err = session
        .run("RETURN $blob", parameters)
        .await
        .expect_err("byte arrays must be rejected");
    assert!(err.to_string().contains("byte arrays"), "{err}");

    session.close().await;
    driver.close().await;
}

#[tokio::test]
async fn http_speaking_port_yields_an_error_naming_both_ports() {
    let script = ServerScript {
        handshake_version: Some(bolt_proto_http_signature()),
        ..ServerScript::default()
    };
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");

    let err = driver
        .verify_connectivity()
        .await
        .expect_err("handshake must fail");
    assert!(matches!(err, Error::ServiceUnavailable(_)));
    let text = err.to_string();
    assert!(text.contains("7474") && text.contains("7687"), "{text}");
}

#[tokio::test]
async fn unrecognized_version_words_are_protocol_errors() {
    let script = ServerScript {
        handshake_version: Some(0x0000_0200),
        ..ServerScript::default()
    };
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config::default(),
    )
    .expect("driver");

    let err = driver
        .verify_connectivity()
        .await
        .expect_err("handshake must fail");
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn lossy_integer_mode_decodes_large_values_to_infinity() {
    let big = (1i64 << 53) + 1;
    let script = ServerScript::default().with_query(
        "RETURN $n AS n",
        QueryScript::returning(
            &["n"],
            vec![vec![Value::Int(7)], vec![Value::Int(big)]],
        ),
    );
    let server = MockBoltServer::start_with(script).await.expect("server");
    let driver = Driver::new(
        &format!("bolt://{}", server.address_string()),
        AuthToken::none(),
        Config {
            disable_lossless_integers: true,
            ..Config::default()
        },
    )
    .expect("driver");

    let session = driver.session(SessionConfig::default());
    let mut stream = session
        .run("RETURN $n AS n", HashMap::new())
        .await
        .expect("run");
    let first = stream.next().await.expect("next").expect("record");
    assert_eq!(first.get("n"), Some(&Value::Float(7.0)));
    let second = stream.next().await.expect("next").expect("record");
    assert_eq!(second.get("n"), Some(&Value::Float(f64::INFINITY)));

    session.close().await;
    driver.close().await;
}

/// ASCII "HTTP" as a version word.
fn bolt_proto_http_signature() -> u32 {
    u32::from_be_bytes(*b"HTTP")
}
