//! One live connection: a channel, its read/write tasks, and the engine.
//!
//! The read loop is the sole consumer of inbound bytes; outbound frames go
//! through an unbounded send queue drained by a single writer task, so
//! concurrent requests on one connection are pipelined, never parallel.
//! Request operations are synchronous: they enqueue the observer and the
//! frame under one short lock, which is what keeps observer order equal to
//! wire order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bolt_proto::Value;
use bolt_proto::chunk::{Chunker, Dechunker};
use bolt_proto::message::{self, Response, request};
use bolt_proto::packstream::UnpackOptions;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::ServerAddress;
use crate::bookmark::Bookmarks;
use crate::config::{AuthToken, ResolvedConfig};
use crate::error::Error;
use crate::net::engine::{Dispatch, Engine};
use crate::net::observer::{NoopObserver, ResponseMetadata, ResponseObserver};
use crate::net::{BoltVersion, channel, handshake};

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// What the server told us about itself during initialization.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Normalized `host:port` the connection goes to.
    pub address: String,
    /// Server agent string, e.g. `Neo4j/3.5.0`; set once `INIT`/`HELLO`
    /// succeeds.
    pub agent: Option<String>,
    pub protocol_version: BoltVersion,
}

/// Coarse lifecycle of a connection, derived from engine and status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Initializing,
    Ready,
    InFlight,
    Broken,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum InitState {
    Pending,
    Ready,
    Failed(Error),
}

struct ConnectionStatus {
    open: AtomicBool,
    broken: AtomicBool,
}

impl ConnectionStatus {
    fn new() -> Self {
        ConnectionStatus {
            open: AtomicBool::new(true),
            broken: AtomicBool::new(false),
        }
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

/// State shared between the connection handle and its two tasks.
struct ConnectionShared {
    engine: Mutex<Engine>,
    status: ConnectionStatus,
    server_info: Mutex<ServerInfo>,
    /// Flipped off when the server turns out to predate byte arrays.
    byte_arrays: AtomicBool,
    version: BoltVersion,
    lossy_integers: bool,
}

pub(crate) struct Connection {
    id: String,
    address: ServerAddress,
    version: BoltVersion,
    created_at: Instant,
    shared: Arc<ConnectionShared>,
    outbound: mpsc::UnboundedSender<Bytes>,
    init_rx: watch::Receiver<InitState>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Connection {
    /// Open a channel, negotiate a version, spawn the IO tasks and send
    /// the initialization request. The caller awaits
    /// [`Connection::initialized`] before first use.
    pub(crate) async fn establish(
        address: &ServerAddress,
        config: &ResolvedConfig,
        auth: &AuthToken,
    ) -> Result<Connection, Error> {
        let mut stream = channel::open(address, config).await?;
        let version = handshake::negotiate(&mut stream, address).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared {
            engine: Mutex::new(Engine::new()),
            status: ConnectionStatus::new(),
            server_info: Mutex::new(ServerInfo {
                address: address.to_string(),
                agent: None,
                protocol_version: version,
            }),
            byte_arrays: AtomicBool::new(true),
            version,
            lossy_integers: config.lossy_integers,
        });
        let read_task = tokio::spawn(read_loop(read_half, Arc::clone(&shared), outbound.clone()));
        let write_task = tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));

        let (init_tx, init_rx) = watch::channel(InitState::Pending);
        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            address: address.clone(),
            version,
            created_at: Instant::now(),
            shared,
            outbound,
            init_rx,
            read_task,
            write_task,
        };
        connection.send_hello(config, auth, init_tx)?;
        debug!(conn_id = %connection.id, address = %address, version = %version, "connection established");
        Ok(connection)
    }

    /// Wait for the initialization response. Every holder awaits this gate
    /// before using the connection.
    pub(crate) async fn initialized(&self) -> Result<(), Error> {
        let mut rx = self.init_rx.clone();
        loop {
            let current = rx.borrow().clone();
            match current {
                InitState::Ready => return Ok(()),
                InitState::Failed(err) => return Err(err),
                InitState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::ServiceUnavailable(format!(
                    "connection to {} closed during initialization",
                    self.address
                )));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typed request operations
    // -----------------------------------------------------------------------

    pub(crate) fn run(
        &self,
        query: &str,
        parameters: HashMap<String, Value>,
        extra: ResponseMetadata,
        observer: Box<dyn ResponseObserver>,
    ) -> Result<(), Error> {
        let mut fields = vec![Value::from(query), Value::Map(parameters)];
        if self.version.supports_run_metadata() {
            fields.push(Value::Map(extra));
        }
        self.send(request::RUN, &fields, observer)
    }

    pub(crate) fn pull_all(&self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        let fields = if self.version.supports_flow_control() {
            vec![Value::Map(fetch_all_metadata())]
        } else {
            vec![]
        };
        self.send(request::PULL_ALL, &fields, observer)
    }

    pub(crate) fn discard_all(&self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        let fields = if self.version.supports_flow_control() {
            vec![Value::Map(fetch_all_metadata())]
        } else {
            vec![]
        };
        self.send(request::DISCARD_ALL, &fields, observer)
    }

    pub(crate) fn begin(
        &self,
        extra: ResponseMetadata,
        observer: Box<dyn ResponseObserver>,
    ) -> Result<(), Error> {
        self.require_explicit_transactions()?;
        self.send(request::BEGIN, &[Value::Map(extra)], observer)
    }

    pub(crate) fn commit(&self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        self.require_explicit_transactions()?;
        self.send(request::COMMIT, &[], observer)
    }

    pub(crate) fn rollback(&self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        self.require_explicit_transactions()?;
        self.send(request::ROLLBACK, &[], observer)
    }

    pub(crate) fn reset(&self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        self.send(request::RESET, &[], observer)
    }

    /// `ROUTE` message, protocol v4+. Older versions go through the routing
    /// procedure instead.
    pub(crate) fn route(
        &self,
        context: HashMap<String, Value>,
        bookmarks: &Bookmarks,
        database: Option<&str>,
        observer: Box<dyn ResponseObserver>,
    ) -> Result<(), Error> {
        if !self.version.supports_route_message() {
            return Err(Error::Protocol(format!(
                "ROUTE requires protocol version 4, negotiated {}",
                self.version
            )));
        }
        let fields = [
            Value::Map(context),
            bookmarks.to_value(),
            database.map(Value::from).unwrap_or(Value::Null),
        ];
        self.send(request::ROUTE, &fields, observer)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn version(&self) -> BoltVersion {
        self.version
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.shared.server_info.lock().unwrap().clone()
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared.status.open.load(Ordering::Acquire)
            && !self.shared.status.broken.load(Ordering::Acquire)
    }

    /// Pool validation: open, not broken, and younger than the lifetime cap.
    pub(crate) fn is_valid(&self, max_lifetime: Option<Duration>) -> bool {
        self.is_open() && max_lifetime.map(|cap| self.age() <= cap).unwrap_or(true)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        if !self.shared.status.open.load(Ordering::Acquire) {
            return ConnectionState::Closed;
        }
        if self.shared.status.broken.load(Ordering::Acquire) {
            return ConnectionState::Broken;
        }
        match &*self.init_rx.borrow() {
            InitState::Pending => ConnectionState::Initializing,
            InitState::Failed(_) => ConnectionState::Broken,
            InitState::Ready => {
                if self.shared.engine.lock().unwrap().pending_len() > 0 {
                    ConnectionState::InFlight
                } else {
                    ConnectionState::Ready
                }
            }
        }
    }

    /// Tear the connection down. Idempotent; pending observers are failed.
    pub(crate) fn close(&self) {
        if self.shared.status.open.swap(false, Ordering::AcqRel) {
            debug!(conn_id = %self.id, address = %self.address, "closing connection");
            self.read_task.abort();
            self.write_task.abort();
            self.shared
                .engine
                .lock()
                .unwrap()
                .fail_all(Error::ServiceUnavailable(format!(
                    "connection to {} was closed",
                    self.address
                )));
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn send_hello(
        &self,
        config: &ResolvedConfig,
        auth: &AuthToken,
        gate: watch::Sender<InitState>,
    ) -> Result<(), Error> {
        let observer = Box::new(InitObserver {
            shared: Arc::clone(&self.shared),
            gate,
        });
        if self.version.supports_run_metadata() {
            let mut meta = HashMap::new();
            meta.insert("user_agent".to_owned(), Value::from(config.user_agent.as_str()));
            meta.insert("scheme".to_owned(), Value::from(auth.scheme.as_str()));
            meta.insert("principal".to_owned(), Value::from(auth.principal.as_str()));
            meta.insert(
                "credentials".to_owned(),
                Value::from(auth.credentials.as_str()),
            );
            self.send(request::INIT, &[Value::Map(meta)], observer)
        } else {
            let mut auth_map = HashMap::new();
            auth_map.insert("scheme".to_owned(), Value::from(auth.scheme.as_str()));
            auth_map.insert("principal".to_owned(), Value::from(auth.principal.as_str()));
            auth_map.insert(
                "credentials".to_owned(),
                Value::from(auth.credentials.as_str()),
            );
            self.send(
                request::INIT,
                &[
                    Value::from(config.user_agent.as_str()),
                    Value::Map(auth_map),
                ],
                observer,
            )
        }
    }

    fn require_explicit_transactions(&self) -> Result<(), Error> {
        if !self.version.supports_explicit_transactions() {
            return Err(Error::Protocol(format!(
                "explicit transactions require protocol version 3, negotiated {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Write one request: observer enqueue and frame handoff happen under
    /// one lock so observer order always equals wire order.
    fn send(
        &self,
        signature: u8,
        fields: &[Value],
        observer: Box<dyn ResponseObserver>,
    ) -> Result<(), Error> {
        let frame = encode_frame(
            signature,
            fields,
            self.shared.byte_arrays.load(Ordering::Acquire),
        )?;
        let mut engine = self.shared.engine.lock().unwrap();
        engine.enqueue(observer)?;
        if self.outbound.send(frame).is_err() {
            let err = Error::ServiceUnavailable(format!(
                "connection to {} is closed",
                self.address
            ));
            engine.fail_all(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

fn fetch_all_metadata() -> HashMap<String, Value> {
    let mut meta = HashMap::new();
    meta.insert("n".to_owned(), Value::Int(-1));
    meta
}

fn encode_frame(signature: u8, fields: &[Value], byte_arrays: bool) -> Result<Bytes, Error> {
    let mut payload = BytesMut::new();
    message::encode_request(signature, fields, &mut payload, byte_arrays)?;
    let mut chunker = Chunker::new();
    chunker.write(&payload);
    chunker.message_boundary();
    Ok(chunker.take())
}

// ---------------------------------------------------------------------------
// Initialization observer
// ---------------------------------------------------------------------------

/// Wraps the `INIT`/`HELLO` completion: captures the server agent, disables
/// byte arrays for servers that predate them, and resolves the gate every
/// holder awaits.
struct InitObserver {
    shared: Arc<ConnectionShared>,
    gate: watch::Sender<InitState>,
}

impl ResponseObserver for InitObserver {
    fn on_next(&mut self, _record: Vec<Value>) {
        debug!("discarding unexpected record during initialization");
    }

    fn on_completed(&mut self, metadata: ResponseMetadata) {
        if let Some(agent) = metadata.get("server").and_then(Value::as_str) {
            if agent_predates_byte_arrays(agent) {
                debug!(agent = %agent, "server predates byte arrays, disabling them");
                self.shared.byte_arrays.store(false, Ordering::Release);
            }
            self.shared.server_info.lock().unwrap().agent = Some(agent.to_owned());
        }
        let _ = self.gate.send(InitState::Ready);
    }

    fn on_error(&mut self, error: Error) {
        warn!(error = %error, "connection initialization failed");
        self.shared.status.mark_broken();
        let _ = self.gate.send(InitState::Failed(error));
    }
}

/// Byte arrays entered the wire format with server 3.2.
fn agent_predates_byte_arrays(agent: &str) -> bool {
    match parse_server_version(agent) {
        Some((major, minor)) => (major, minor) < (3, 2),
        None => false,
    }
}

fn parse_server_version(agent: &str) -> Option<(u32, u32)> {
    let rest = agent.strip_prefix("Neo4j/")?;
    let mut parts = rest.split(['.', '-', '+']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

// ---------------------------------------------------------------------------
// IO loops
// ---------------------------------------------------------------------------

fn fatal(shared: &Arc<ConnectionShared>, error: Error) {
    debug!(error = %error, "connection failed");
    shared.status.mark_broken();
    shared.engine.lock().unwrap().fail_all(error);
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<ConnectionShared>,
    outbound: mpsc::UnboundedSender<Bytes>,
) where
    R: AsyncRead + Unpin,
{
    let mut dechunker = Dechunker::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let options = UnpackOptions {
        lossy_integers: shared.lossy_integers,
    };

    loop {
        while let Some(payload) = dechunker.next_message() {
            let response = match Response::decode(&payload, options) {
                Ok(response) => response,
                Err(err) => {
                    fatal(&shared, Error::from(err));
                    return;
                }
            };
            let mut engine = shared.engine.lock().unwrap();
            match engine.handle_response(response) {
                Ok(Dispatch::Continue) => {}
                Ok(Dispatch::SendRecovery) => {
                    // Enqueue + send under the same lock: the recovery
                    // message must precede anything a user task writes
                    // after observing the failure.
                    let signature = if shared.version.uses_ack_failure() {
                        request::ACK_FAILURE
                    } else {
                        request::RESET
                    };
                    match encode_frame(signature, &[], true) {
                        Ok(frame) => {
                            engine.enqueue_recovery(Box::new(NoopObserver));
                            let _ = outbound.send(frame);
                        }
                        Err(err) => {
                            engine.fail_all(err);
                            shared.status.mark_broken();
                            return;
                        }
                    }
                }
                Err(err) => {
                    engine.fail_all(err);
                    shared.status.mark_broken();
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let error = if dechunker.mid_message() {
                    Error::Protocol("server closed the connection mid-message".to_owned())
                } else {
                    Error::ServiceUnavailable("server closed the connection".to_owned())
                };
                fatal(&shared, error);
                return;
            }
            Ok(_) => {
                dechunker.feed(&buf);
                buf.clear();
            }
            Err(err) => {
                fatal(&shared, Error::from_io("read failed", &err));
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<ConnectionShared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            fatal(&shared, Error::from_io("write failed", &err));
            return;
        }
        if let Err(err) = writer.flush().await {
            fatal(&shared, Error::from_io("flush failed", &err));
            return;
        }
    }
    // All senders dropped: orderly close.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_versions_parse_from_agent_strings() {
        assert_eq!(parse_server_version("Neo4j/3.1.0"), Some((3, 1)));
        assert_eq!(parse_server_version("Neo4j/3.2.9"), Some((3, 2)));
        assert_eq!(parse_server_version("Neo4j/4.0-aura"), Some((4, 0)));
        assert_eq!(parse_server_version("SomethingElse/1.0"), None);
    }

    #[test]
    fn byte_array_support_cutoff_is_3_2() {
        assert!(agent_predates_byte_arrays("Neo4j/3.1.0"));
        assert!(!agent_predates_byte_arrays("Neo4j/3.2.0"));
        assert!(!agent_predates_byte_arrays("Neo4j/4.4.0"));
        // Unknown agents keep byte arrays on.
        assert!(!agent_predates_byte_arrays("CustomServer/9.9"));
    }

    #[test]
    fn frames_end_with_the_message_terminator() {
        let frame = encode_frame(request::RESET, &[], true).expect("frame");
        assert_eq!(frame[..], [0x00, 0x02, 0xB0, 0x0F, 0x00, 0x00]);
    }

    use bolt_test_utils::{MockBoltServer, QueryScript, ServerScript};

    use crate::config::Config;
    use crate::net::observer::CompletionObserver;

    async fn connect_to(server: &MockBoltServer) -> Connection {
        let config = Arc::new(Config::default().resolve());
        let address = ServerAddress::new("127.0.0.1", server.local_addr().port());
        let connection = Connection::establish(&address, &config, &AuthToken::none())
            .await
            .expect("establish");
        connection.initialized().await.expect("initialized");
        connection
    }

    #[tokio::test]
    async fn initialization_captures_the_server_agent() {
        let server = MockBoltServer::start_with(ServerScript {
            server_agent: "Neo4j/4.4.7".to_owned(),
            ..ServerScript::default()
        })
        .await
        .expect("server");

        let connection = connect_to(&server).await;
        assert_eq!(
            connection.server_info().agent.as_deref(),
            Some("Neo4j/4.4.7")
        );
        assert_eq!(connection.state(), ConnectionState::Ready);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn discard_all_drops_buffered_records_and_completes() {
        let server = MockBoltServer::start_with(ServerScript::default().with_query(
            "RETURN 1 AS n",
            QueryScript::returning(&["n"], vec![vec![Value::Int(1)]]),
        ))
        .await
        .expect("server");

        let connection = connect_to(&server).await;
        let (run_observer, run_rx) = CompletionObserver::channel();
        connection
            .run(
                "RETURN 1 AS n",
                HashMap::new(),
                HashMap::new(),
                Box::new(run_observer),
            )
            .expect("run");
        let (discard_observer, discard_rx) = CompletionObserver::channel();
        connection
            .discard_all(Box::new(discard_observer))
            .expect("discard");

        run_rx.await.expect("run reply").expect("run success");
        discard_rx
            .await
            .expect("discard reply")
            .expect("discard success");
        connection.close();
    }

    #[tokio::test]
    async fn explicit_transactions_are_refused_below_v3() {
        let server = MockBoltServer::start_with(ServerScript {
            handshake_version: Some(1),
            ..ServerScript::default()
        })
        .await
        .expect("server");

        let connection = connect_to(&server).await;
        assert_eq!(connection.version(), BoltVersion::V1);
        let (observer, _rx) = CompletionObserver::channel();
        let err = connection
            .begin(HashMap::new(), Box::new(observer))
            .expect_err("v1 has no BEGIN");
        assert!(matches!(err, Error::Protocol(_)));
        connection.close();
    }
}
