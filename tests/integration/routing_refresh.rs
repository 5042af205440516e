//! Cluster routing end to end: router fallback during refresh, per-mode
//! server selection, table freshness, and the minority-partition seed
//! heuristic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bolt_client::{
    AccessMode, AddressResolver, AuthToken, Config, Driver, Error, ServerAddress, SessionConfig,
    Value,
};
use bolt_test_utils::{MockBoltServer, QueryScript, RouteReply, ServerScript};

/// Routing failures are the hardest suite to debug blind; opt into logs
/// with `RUST_LOG=bolt_client=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn counting_resolver(
    targets: Vec<ServerAddress>,
) -> (Arc<dyn AddressResolver>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let resolver: Arc<dyn AddressResolver> = Arc::new(move |_seed: &ServerAddress| {
        counter.fetch_add(1, Ordering::SeqCst);
        targets.clone()
    });
    (resolver, calls)
}

#[tokio::test]
async fn refresh_falls_back_past_a_dead_router_and_selects_by_mode() {
    init_tracing();
    let reader = MockBoltServer::start_with(ServerScript::default().with_query(
        "RETURN 'who' AS who",
        QueryScript::returning(&["who"], vec![vec![Value::from("reader")]]),
    ))
    .await
    .expect("reader");
    let writer = MockBoltServer::start_with(ServerScript::default().with_query(
        "CREATE (n)",
        QueryScript::returning(&[], vec![]),
    ))
    .await
    .expect("writer");

    let dead_router =
        MockBoltServer::start_with(ServerScript::default().with_route_handler(|| {
            RouteReply::CloseConnection
        }))
        .await
        .expect("dead router");

    let router_list: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let live_router = {
        let router_list = Arc::clone(&router_list);
        let reader_addr = reader.address_string();
        let writer_addr = writer.address_string();
        MockBoltServer::start_with(ServerScript::default().with_route_handler(move || {
            RouteReply::Table {
                ttl: 30,
                routers: router_list.lock().unwrap().clone(),
                readers: vec![reader_addr.clone()],
                writers: vec![writer_addr.clone()],
            }
        }))
        .await
        .expect("live router")
    };
    router_list
        .lock()
        .unwrap()
        .push(live_router.address_string());

    // The seed expands to the dead router first, then the live one.
    let (resolver, _calls) = counting_resolver(vec![
        ServerAddress::parse(&dead_router.address_string()).expect("addr"),
        ServerAddress::parse(&live_router.address_string()).expect("addr"),
    ]);
    let driver = Driver::new(
        "neo4j://seed.cluster.internal:7687",
        AuthToken::none(),
        Config {
            resolver: Some(resolver),
            ..Config::default()
        },
    )
    .expect("driver");

    // Read session lands on the reader.
    let read_session = driver.session(SessionConfig {
        mode: AccessMode::Read,
        ..SessionConfig::default()
    });
    let mut stream = read_session
        .run("RETURN 'who' AS who", HashMap::new())
        .await
        .expect("read query");
    let record = stream.next().await.expect("next").expect("record");
    assert_eq!(record.get("who"), Some(&Value::from("reader")));
    read_session.close().await;

    // Write session lands on the writer.
    let write_session = driver.session(SessionConfig::default());
    let mut stream = write_session
        .run("CREATE (n)", HashMap::new())
        .await
        .expect("write query");
    assert!(stream.next().await.expect("complete").is_none());
    write_session.close().await;

    // TTL 30 s: the second acquisition reused the fresh table.
    assert_eq!(live_router.route_requests(), 1);
    // The dead router was contacted (handshake + init) but produced nothing.
    assert!(dead_router.received().contains(&0x01));

    driver.close().await;
}

#[tokio::test]
async fn zero_writer_table_makes_the_next_refresh_prefer_the_seed() {
    init_tracing();
    let reader = MockBoltServer::start_with(ServerScript::default().with_query(
        "RETURN 1 AS n",
        QueryScript::returning(&["n"], vec![vec![Value::Int(1)]]),
    ))
    .await
    .expect("reader");
    let writer = MockBoltServer::start_with(ServerScript::default().with_query(
        "CREATE (n)",
        QueryScript::returning(&[], vec![]),
    ))
    .await
    .expect("writer");

    // First routing answer: a read-only view (no writers). Later answers
    // include the writer again.
    let router_list: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let answers = Arc::new(AtomicUsize::new(0));
    let router = {
        let router_list = Arc::clone(&router_list);
        let answers = Arc::clone(&answers);
        let reader_addr = reader.address_string();
        let writer_addr = writer.address_string();
        MockBoltServer::start_with(ServerScript::default().with_route_handler(move || {
            let call = answers.fetch_add(1, Ordering::SeqCst);
            RouteReply::Table {
                ttl: 30,
                routers: router_list.lock().unwrap().clone(),
                readers: vec![reader_addr.clone()],
                writers: if call == 0 {
                    Vec::new()
                } else {
                    vec![writer_addr.clone()]
                },
            }
        }))
        .await
        .expect("router")
    };
    router_list.lock().unwrap().push(router.address_string());

    let (resolver, resolver_calls) = counting_resolver(vec![
        ServerAddress::parse(&router.address_string()).expect("addr"),
    ]);
    let driver = Driver::new(
        "neo4j://seed.cluster.internal:7687",
        AuthToken::none(),
        Config {
            resolver: Some(resolver),
            ..Config::default()
        },
    )
    .expect("driver");

    // First refresh comes from the seed (the initial table has no routers)
    // and installs the zero-writer view; reads still work.
    let read_session = driver.session(SessionConfig {
        mode: AccessMode::Read,
        ..SessionConfig::default()
    });
    let mut stream = read_session
        .run("RETURN 1 AS n", HashMap::new())
        .await
        .expect("read query");
    assert!(stream.next().await.expect("record").is_some());
    read_session.close().await;
    assert_eq!(resolver_calls.load(Ordering::SeqCst), 1);

    // The write needs a refresh. The installed table *does* know the
    // router, so a routers-first refresh would never consult the resolver
    // again; seeing a second resolver call proves the zero-writer table
    // flipped the preference to the seed.
    let write_session = driver.session(SessionConfig::default());
    let mut stream = write_session
        .run("CREATE (n)", HashMap::new())
        .await
        .expect("write query after partition heals");
    assert!(stream.next().await.expect("complete").is_none());
    write_session.close().await;

    assert_eq!(
        resolver_calls.load(Ordering::SeqCst),
        2,
        "second refresh must have started from the seed"
    );
    assert_eq!(router.route_requests(), 2);

    driver.close().await;
}

#[tokio::test]
async fn deposed_leaders_surface_as_session_expired_so_retries_refetch_the_table() {
    init_tracing();
    let reader = MockBoltServer::start().await.expect("reader");
    // The advertised writer rejects writes: it lost leadership after the
    // table was built.
    let deposed = MockBoltServer::start_with(ServerScript::default().with_query(
        "CREATE (n)",
        QueryScript::failing(
            "Neo.ClientError.Cluster.NotALeader",
            "No longer able to write to this database",
        ),
    ))
    .await
    .expect("deposed writer");

    let router_list: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let router = {
        let router_list = Arc::clone(&router_list);
        let reader_addr = reader.address_string();
        let writer_addr = deposed.address_string();
        MockBoltServer::start_with(ServerScript::default().with_route_handler(move || {
            RouteReply::Table {
                ttl: 30,
                routers: router_list.lock().unwrap().clone(),
                readers: vec![reader_addr.clone()],
                writers: vec![writer_addr.clone()],
            }
        }))
        .await
        .expect("router")
    };
    router_list.lock().unwrap().push(router.address_string());

    let (resolver, _calls) = counting_resolver(vec![
        ServerAddress::parse(&router.address_string()).expect("addr"),
    ]);
    let driver = Driver::new(
        "neo4j://seed.cluster.internal:7687",
        AuthToken::none(),
        Config {
            resolver: Some(resolver),
            ..Config::default()
        },
    )
    .expect("driver");

    let session = driver.session(SessionConfig::default());
    let mut stream = session
        .run("CREATE (n)", HashMap::new())
        .await
        .expect("send");
    let err = stream.next().await.expect_err("write must fail");
    assert!(
        matches!(err, Error::SessionExpired(_)),
        "NotALeader must be reclassified so the retry controller refreshes: {err}"
    );
    assert!(err.is_retryable());

    session.close().await;
    driver.close().await;
}
