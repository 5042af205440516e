// bolt-test-utils: A scripted mock Bolt server for driver tests.
//
// Binds real TCP sockets so the driver's channel, handshake and framing
// paths are exercised end to end. Each test spins up its own isolated
// server (or several, for routing scenarios) with a script describing the
// handshake reply, query outcomes and routing answers.

mod mock_server;

pub use mock_server::{MockBoltServer, QueryScript, RouteReply, ServerScript};
