//! Driver side of the version handshake.

use bolt_proto::handshake::{self, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::ServerAddress;
use crate::error::Error;
use crate::net::BoltVersion;

/// Run the handshake on a freshly opened stream and return the negotiated
/// version.
pub(crate) async fn negotiate<S>(stream: &mut S, address: &ServerAddress) -> Result<BoltVersion, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = handshake::request(&BoltVersion::PROPOSED);
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::from_io(&format!("handshake write to {address} failed"), &e))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::from_io(&format!("handshake write to {address} failed"), &e))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::from_io(&format!("handshake read from {address} failed"), &e))?;

    match handshake::parse_reply(reply) {
        Reply::HttpPort => Err(Error::ServiceUnavailable(format!(
            "server at {address} answered with HTTP: the address points at the server's \
             HTTP port (usually 7474) instead of its Bolt port (usually 7687)"
        ))),
        Reply::Version(0) => Err(Error::Protocol(format!(
            "server at {address} rejected every proposed protocol version {:?}",
            BoltVersion::PROPOSED
        ))),
        Reply::Version(word) => {
            let version = BoltVersion::from_word(word).ok_or_else(|| {
                Error::Protocol(format!(
                    "server at {address} chose unknown protocol version {word}"
                ))
            })?;
            debug!(address = %address, version = %version, "protocol version negotiated");
            Ok(version)
        }
    }
}
