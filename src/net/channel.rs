//! Async TCP/TLS byte transport.
//!
//! Opens the socket (optionally within the configured connect deadline),
//! wraps it in TLS when encryption is on, and hands the stream to the
//! connection layer. Writes are serialized elsewhere: the connection owns a
//! send queue drained by a single writer task, so nothing here needs
//! locking.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::address::ServerAddress;
use crate::config::{Encryption, ResolvedConfig, Trust};
use crate::error::Error;

/// Plain or encrypted stream behind one type.
pub(crate) enum ChannelStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStream::Plain(_) => f.write_str("ChannelStream::Plain"),
            ChannelStream::Tls(_) => f.write_str("ChannelStream::Tls"),
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ChannelStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a transport to `address`, honoring the connect deadline.
pub(crate) async fn open(
    address: &ServerAddress,
    config: &ResolvedConfig,
) -> Result<ChannelStream, Error> {
    match config.connect_timeout {
        Some(deadline) => tokio::time::timeout(deadline, open_inner(address, config))
            .await
            .map_err(|_| {
                Error::ServiceUnavailable(format!(
                    "connection to {address} timed out after {} ms",
                    deadline.as_millis()
                ))
            })?,
        None => open_inner(address, config).await,
    }
}

async fn open_inner(
    address: &ServerAddress,
    config: &ResolvedConfig,
) -> Result<ChannelStream, Error> {
    let stream = TcpStream::connect((address.host(), address.port()))
        .await
        .map_err(|e| Error::from_io(&format!("failed to connect to {address}"), &e))?;
    // Request/response round-trips suffer under Nagle.
    if let Err(err) = stream.set_nodelay(true) {
        debug!(address = %address, error = %err, "could not disable Nagle's algorithm");
    }

    match &config.encryption {
        Encryption::Disabled => Ok(ChannelStream::Plain(stream)),
        Encryption::Enabled(trust) => {
            let tls_config = client_tls_config(trust)?;
            let server_name = ServerName::try_from(address.host().to_owned())
                .map_err(|_| Error::Config(format!("invalid TLS server name '{}'", address.host())))?;
            let connected = TlsConnector::from(tls_config)
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::from_io(&format!("TLS handshake with {address} failed"), &e))?;
            Ok(ChannelStream::Tls(Box::new(connected)))
        }
    }
}

fn client_tls_config(trust: &Trust) -> Result<Arc<rustls::ClientConfig>, Error> {
    match trust {
        Trust::CustomCertificates(config) => Ok(Arc::clone(config)),
        Trust::SystemCertificates => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        }
        Trust::TrustOnFirstUse => Err(Error::Config(
            "trust-on-first-use is not supported by the TLS channel; supply a rustls \
             client config via Trust::CustomCertificates instead"
                .to_owned(),
        )),
    }
}
