//! The mock server itself.
//!
//! # Protocol behavior
//!
//! - Handshake: validates the magic preamble, then answers with the
//!   scripted version word (default: the client's first proposal). The
//!   word may be the HTTP sentinel to simulate a wrong-port connect.
//! - `INIT`/`HELLO` → `SUCCESS {server, connection_id}`.
//! - `RUN` → per the matching [`QueryScript`]: `FAILURE` (entering the
//!   failed state) or `SUCCESS {fields}` with records replayed by the next
//!   `PULL_ALL`. Unregistered queries succeed with no columns.
//! - While failed, everything except `RESET`/`ACK_FAILURE` is answered
//!   with `IGNORED`; those two clear the state.
//! - `ROUTE` (and the v3 routing procedure) consult the script's route
//!   handler, which may also drop the connection to simulate a dead
//!   router.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bolt_proto::chunk::{Chunker, Dechunker};
use bolt_proto::handshake::MAGIC;
use bolt_proto::message::{request, response};
use bolt_proto::packstream::{Packer, UnpackOptions, Unpacker};
use bolt_proto::{ProtoError, Value};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ROUTING_PROCEDURE_QUERY: &str = "CALL dbms.cluster.routing.getRoutingTable($context)";

// ---------------------------------------------------------------------------
// Script types
// ---------------------------------------------------------------------------

/// Outcome of one registered query.
#[derive(Debug, Clone, Default)]
pub struct QueryScript {
    pub fields: Vec<String>,
    pub records: Vec<Vec<Value>>,
    /// `(code, message)`: answer the `RUN` with a failure instead.
    pub failure: Option<(String, String)>,
}

impl QueryScript {
    pub fn returning(fields: &[&str], records: Vec<Vec<Value>>) -> Self {
        QueryScript {
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            records,
            failure: None,
        }
    }

    pub fn failing(code: &str, message: &str) -> Self {
        QueryScript {
            fields: Vec::new(),
            records: Vec::new(),
            failure: Some((code.to_owned(), message.to_owned())),
        }
    }
}

/// Answer to a routing request (the `ROUTE` message or the procedure).
#[derive(Debug, Clone)]
pub enum RouteReply {
    Table {
        ttl: i64,
        routers: Vec<String>,
        readers: Vec<String>,
        writers: Vec<String>,
    },
    Failure {
        code: String,
        message: String,
    },
    /// Drop the socket without answering: a dead router.
    CloseConnection,
}

pub type RouteHandler = Arc<dyn Fn() -> RouteReply + Send + Sync>;

/// Per-server behavior description.
#[derive(Clone)]
pub struct ServerScript {
    /// Version word the handshake answers with; `None` echoes the client's
    /// first proposal.
    pub handshake_version: Option<u32>,
    /// Agent announced in the initialization `SUCCESS`.
    pub server_agent: String,
    pub queries: HashMap<String, QueryScript>,
    pub route_handler: Option<RouteHandler>,
    /// Bookmark minted by `COMMIT`.
    pub commit_bookmark: Option<String>,
}

impl Default for ServerScript {
    fn default() -> Self {
        ServerScript {
            handshake_version: None,
            server_agent: "Neo4j/4.4.0".to_owned(),
            queries: HashMap::new(),
            route_handler: None,
            commit_bookmark: None,
        }
    }
}

impl ServerScript {
    pub fn with_query(mut self, query: &str, script: QueryScript) -> Self {
        self.queries.insert(query.to_owned(), script);
        self
    }

    pub fn with_route_handler(
        mut self,
        handler: impl Fn() -> RouteReply + Send + Sync + 'static,
    ) -> Self {
        self.route_handler = Some(Arc::new(handler));
        self
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A mock server bound to a random local port.
///
/// The accept loop runs in a background task until the server is dropped.
/// Every request signature received (across all connections, in arrival
/// order) is logged and can be inspected by tests.
pub struct MockBoltServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBoltServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(ServerScript::default()).await
    }

    pub async fn start_with(script: ServerScript) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, script, log).await;
        });

        Ok(MockBoltServer {
            addr,
            received,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form, convenient for routing table entries.
    pub fn address_string(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Snapshot of every request signature seen so far.
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// How many routing requests (ROUTE message or procedure run) arrived.
    pub fn route_requests(&self) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|sig| **sig == request::ROUTE)
            .count()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, script: ServerScript, log: Arc<Mutex<Vec<u8>>>) {
        let connection_ids = Arc::new(AtomicU64::new(0));
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let script = script.clone();
                    let log = Arc::clone(&log);
                    let id = connection_ids.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (clients
                        // drop, scripts close sockets); swallow them.
                        let _ = handle_connection(stream, script, log, id).await;
                    });
                }
                Err(_) => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

struct ConnectionCtx {
    script: ServerScript,
    log: Arc<Mutex<Vec<u8>>>,
    id: u64,
    failed: bool,
    pending_records: Option<Vec<Vec<Value>>>,
    commit_count: u64,
}

enum Action {
    Reply(Vec<u8>),
    Close,
}

async fn handle_connection(
    mut stream: TcpStream,
    script: ServerScript,
    log: Arc<Mutex<Vec<u8>>>,
    id: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Handshake: magic + 4 proposal words.
    let mut request_bytes = [0u8; 20];
    stream.read_exact(&mut request_bytes).await?;
    if request_bytes[..4] != MAGIC {
        return Err("bad magic preamble".into());
    }
    let first_proposal = u32::from_be_bytes([
        request_bytes[4],
        request_bytes[5],
        request_bytes[6],
        request_bytes[7],
    ]);
    let chosen = script.handshake_version.unwrap_or(first_proposal);
    stream.write_all(&chosen.to_be_bytes()).await?;
    stream.flush().await?;

    let mut ctx = ConnectionCtx {
        script,
        log,
        id,
        failed: false,
        pending_records: None,
        commit_count: 0,
    };

    let mut dechunker = Dechunker::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        while let Some(payload) = dechunker.next_message() {
            match handle_message(&mut ctx, &payload)? {
                Action::Reply(bytes) => {
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                }
                Action::Close => return Ok(()),
            }
        }
        buf.clear();
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dechunker.feed(&buf);
    }
}

fn handle_message(ctx: &mut ConnectionCtx, payload: &[u8]) -> Result<Action, ProtoError> {
    let mut unpacker = Unpacker::new(payload, UnpackOptions::default());
    let (signature, field_count) = unpacker.unpack_struct_header()?;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        fields.push(unpacker.unpack()?);
    }
    ctx.log.lock().unwrap().push(signature);

    // Recovery messages work even in the failed state.
    if signature == request::RESET || signature == request::ACK_FAILURE {
        ctx.failed = false;
        ctx.pending_records = None;
        return Ok(Action::Reply(success(HashMap::new())));
    }
    if ctx.failed {
        return Ok(Action::Reply(ignored()));
    }

    match signature {
        request::INIT => {
            let mut meta = HashMap::new();
            meta.insert(
                "server".to_owned(),
                Value::from(ctx.script.server_agent.as_str()),
            );
            meta.insert(
                "connection_id".to_owned(),
                Value::from(format!("mock-{}", ctx.id)),
            );
            Ok(Action::Reply(success(meta)))
        }
        request::RUN => {
            let query = fields
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if query == ROUTING_PROCEDURE_QUERY {
                return routing_procedure_reply(ctx);
            }
            let script = ctx.script.queries.get(&query).cloned().unwrap_or_default();
            if let Some((code, message)) = script.failure {
                ctx.failed = true;
                return Ok(Action::Reply(failure(&code, &message)));
            }
            let mut meta = HashMap::new();
            meta.insert(
                "fields".to_owned(),
                Value::List(script.fields.iter().map(|f| Value::from(f.as_str())).collect()),
            );
            ctx.pending_records = Some(script.records);
            Ok(Action::Reply(success(meta)))
        }
        request::PULL_ALL => {
            let mut bytes = Vec::new();
            for record in ctx.pending_records.take().unwrap_or_default() {
                bytes.extend_from_slice(&record_reply(record));
            }
            bytes.extend_from_slice(&success(HashMap::new()));
            Ok(Action::Reply(bytes))
        }
        request::DISCARD_ALL => {
            ctx.pending_records = None;
            Ok(Action::Reply(success(HashMap::new())))
        }
        request::BEGIN => Ok(Action::Reply(success(HashMap::new()))),
        request::COMMIT => {
            ctx.commit_count += 1;
            let mut meta = HashMap::new();
            let bookmark = ctx
                .script
                .commit_bookmark
                .clone()
                .unwrap_or_else(|| format!("mock:bookmark:{}:{}", ctx.id, ctx.commit_count));
            meta.insert("bookmark".to_owned(), Value::from(bookmark));
            Ok(Action::Reply(success(meta)))
        }
        request::ROLLBACK => Ok(Action::Reply(success(HashMap::new()))),
        request::ROUTE => match route_reply(ctx) {
            Some(RouteOutcome::Meta(meta)) => Ok(Action::Reply(success(meta))),
            Some(RouteOutcome::Fail(code, message)) => {
                ctx.failed = true;
                Ok(Action::Reply(failure(&code, &message)))
            }
            None => Ok(Action::Close),
        },
        other => {
            ctx.failed = true;
            Ok(Action::Reply(failure(
                "Neo.ClientError.Request.Invalid",
                &format!("unexpected message 0x{other:02X}"),
            )))
        }
    }
}

enum RouteOutcome {
    Meta(HashMap<String, Value>),
    Fail(String, String),
}

/// `ROUTE` message path: the table rides in the SUCCESS metadata.
fn route_reply(ctx: &ConnectionCtx) -> Option<RouteOutcome> {
    let Some(handler) = &ctx.script.route_handler else {
        return Some(RouteOutcome::Fail(
            "Neo.ClientError.Procedure.ProcedureNotFound".to_owned(),
            "this server does not route".to_owned(),
        ));
    };
    match handler() {
        RouteReply::Table {
            ttl,
            routers,
            readers,
            writers,
        } => {
            let mut rt = HashMap::new();
            rt.insert("ttl".to_owned(), Value::Int(ttl));
            rt.insert(
                "servers".to_owned(),
                Value::List(vec![
                    role_entry("ROUTE", &routers),
                    role_entry("READ", &readers),
                    role_entry("WRITE", &writers),
                ]),
            );
            let mut meta = HashMap::new();
            meta.insert("rt".to_owned(), Value::Map(rt));
            Some(RouteOutcome::Meta(meta))
        }
        RouteReply::Failure { code, message } => Some(RouteOutcome::Fail(code, message)),
        RouteReply::CloseConnection => None,
    }
}

/// Procedure path: same table, but shaped as a one-record result.
fn routing_procedure_reply(ctx: &mut ConnectionCtx) -> Result<Action, ProtoError> {
    let Some(handler) = &ctx.script.route_handler else {
        ctx.failed = true;
        return Ok(Action::Reply(failure(
            "Neo.ClientError.Procedure.ProcedureNotFound",
            "There is no procedure with the name `dbms.cluster.routing.getRoutingTable`",
        )));
    };
    match handler() {
        RouteReply::Table {
            ttl,
            routers,
            readers,
            writers,
        } => {
            let mut meta = HashMap::new();
            meta.insert(
                "fields".to_owned(),
                Value::List(vec![Value::from("ttl"), Value::from("servers")]),
            );
            ctx.pending_records = Some(vec![vec![
                Value::Int(ttl),
                Value::List(vec![
                    role_entry("ROUTE", &routers),
                    role_entry("READ", &readers),
                    role_entry("WRITE", &writers),
                ]),
            ]]);
            Ok(Action::Reply(success(meta)))
        }
        RouteReply::Failure { code, message } => {
            ctx.failed = true;
            Ok(Action::Reply(failure(&code, &message)))
        }
        RouteReply::CloseConnection => Ok(Action::Close),
    }
}

fn role_entry(role: &str, addresses: &[String]) -> Value {
    let mut map = HashMap::new();
    map.insert("role".to_owned(), Value::from(role));
    map.insert(
        "addresses".to_owned(),
        Value::List(addresses.iter().map(|a| Value::from(a.as_str())).collect()),
    );
    Value::Map(map)
}

// ---------------------------------------------------------------------------
// Response encoding
// ---------------------------------------------------------------------------

fn encode_response(signature: u8, fields: &[Value]) -> Vec<u8> {
    let mut payload = BytesMut::new();
    let mut packer = Packer::new(&mut payload);
    packer
        .pack_struct_header(signature, fields.len())
        .expect("header");
    for field in fields {
        packer.pack(field).expect("field");
    }
    let mut chunker = Chunker::new();
    chunker.write(&payload);
    chunker.message_boundary();
    chunker.take().to_vec()
}

fn success(meta: HashMap<String, Value>) -> Vec<u8> {
    encode_response(response::SUCCESS, &[Value::Map(meta)])
}

fn failure(code: &str, message: &str) -> Vec<u8> {
    let mut meta = HashMap::new();
    meta.insert("code".to_owned(), Value::from(code));
    meta.insert("message".to_owned(), Value::from(message));
    encode_response(response::FAILURE, &[Value::Map(meta)])
}

fn ignored() -> Vec<u8> {
    encode_response(response::IGNORED, &[])
}

fn record_reply(values: Vec<Value>) -> Vec<u8> {
    encode_response(response::RECORD, &[Value::List(values)])
}
