//! Establishing the underlying stream connection.
//!
//! A connection is made to a [`ServerAddr`], either directly or by asking
//! a [`Proxy`] to create a tunnel to the server.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::fmt;
use std::io;
use std::net::SocketAddr;
use std::string::String;
use std::time::Duration;

use futures_util::future::BoxFuture;
use socket2::SockRef;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::trace;

use crate::message::Transport;

//------------ ServerAddr -----------------------------------------------------

/// The address of the name server to connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerAddr {
    /// An address that needs no further resolution.
    Resolved(SocketAddr),

    /// A host name and port that still need to be resolved.
    Named {
        /// The host name.
        host: String,

        /// The port.
        port: u16,
    },
}

impl ServerAddr {
    /// Creates a server address from a host name and a port.
    pub fn named(host: impl Into<String>, port: u16) -> Self {
        ServerAddr::Named {
            host: host.into(),
            port,
        }
    }

    /// Resolves the address into something we can connect to.
    ///
    /// If a name resolves to more than one address, the first one is used.
    pub async fn resolve(&self) -> Result<SocketAddr, io::Error> {
        match self {
            ServerAddr::Resolved(addr) => Ok(*addr),
            ServerAddr::Named { host, port } => {
                let addr = lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no address found for {host}"),
                        )
                    })?;
                trace!("Resolved {host} to {addr}");
                Ok(addr)
            }
        }
    }
}

impl From<SocketAddr> for ServerAddr {
    fn from(addr: SocketAddr) -> Self {
        ServerAddr::Resolved(addr)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Resolved(addr) => addr.fmt(f),
            ServerAddr::Named { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

//------------ Proxy ----------------------------------------------------------

/// Something that can establish a tunnelled connection to a server.
pub trait Proxy: fmt::Debug + Send + Sync {
    /// Returns a future that connects to `target` through the proxy.
    ///
    /// The stream returned by the future is already tunnelled to the
    /// target and can be used as if it were a direct connection. The proxy
    /// should give up after `connect_timeout`.
    fn connect(
        &self,
        target: SocketAddr,
        connect_timeout: Duration,
    ) -> BoxFuture<'_, Result<TcpStream, io::Error>>;
}

//------------ SocketConfig ---------------------------------------------------

/// Socket level settings applied to every new connection.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SocketConfig {
    /// Limit for establishing the connection.
    pub connect_timeout: Duration,

    /// Size of the socket send buffer, if not the system default.
    pub send_buffer: Option<usize>,

    /// Size of the socket receive buffer, if not the system default.
    pub recv_buffer: Option<usize>,
}

//------------ connect --------------------------------------------------------

/// Connects to `target`, using the proxy if there is one.
///
/// Returns the configured stream and the kind of transport it is.
pub(crate) async fn connect(
    target: SocketAddr,
    proxy: Option<&dyn Proxy>,
    config: SocketConfig,
) -> Result<(TcpStream, Transport), io::Error> {
    let transport = match proxy {
        Some(_) => Transport::TcpProxied,
        None => Transport::Tcp,
    };
    let fut: BoxFuture<'_, Result<TcpStream, io::Error>> = match proxy {
        Some(proxy) => proxy.connect(target, config.connect_timeout),
        None => Box::pin(TcpStream::connect(target)),
    };
    let stream = timeout(config.connect_timeout, fut).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timeout connecting to {target}"),
        )
    })??;
    configure(&stream, config)?;
    Ok((stream, transport))
}

/// Applies the socket settings to a freshly connected stream.
fn configure(stream: &TcpStream, config: SocketConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    if let Some(size) = config.send_buffer {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer {
        sock.set_recv_buffer_size(size)?;
    }
    Ok(())
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct Blackhole;

    impl Proxy for Blackhole {
        fn connect(
            &self,
            _target: SocketAddr,
            _connect_timeout: Duration,
        ) -> BoxFuture<'_, Result<TcpStream, io::Error>> {
            Box::pin(futures_util::future::pending())
        }
    }

    fn socket_config() -> SocketConfig {
        SocketConfig {
            connect_timeout: Duration::from_millis(200),
            send_buffer: Some(8192),
            recv_buffer: None,
        }
    }

    #[tokio::test]
    async fn resolve_named() {
        let addr = ServerAddr::named("127.0.0.1", 5353);
        assert_eq!(addr.to_string(), "127.0.0.1:5353");
        assert_eq!(
            addr.resolve().await.unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 5353))
        );
    }

    #[tokio::test]
    async fn direct_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (stream, transport) =
            connect(target, None, socket_config()).await.unwrap();
        assert_eq!(transport, Transport::Tcp);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn proxy_connect_times_out() {
        let target = SocketAddr::from(([127, 0, 0, 1], 53));
        let err = connect(target, Some(&Blackhole), socket_config())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
