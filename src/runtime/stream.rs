use std::{
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    client::options::ServerAddress,
    error::{Error, ErrorKind, Result},
};

#[cfg(feature = "rustls-tls")]
use super::tls::TlsStream;

/// An async byte stream to a mongod/mongos, optionally wrapped in TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<TlsStream>),
}

impl AsyncStream {
    pub(crate) async fn connect(
        address: &ServerAddress,
        tls_config: Option<&super::TlsConfig>,
    ) -> Result<Self> {
        let tcp = tcp_connect(address).await?;
        tcp.set_nodelay(true)?;

        match tls_config {
            #[cfg(feature = "rustls-tls")]
            Some(cfg) => {
                let tls = super::tls::tls_connect(&address.host, tcp, cfg).await?;
                Ok(AsyncStream::Tls(Box::new(tls)))
            }
            #[cfg(not(feature = "rustls-tls"))]
            Some(_) => Err(ErrorKind::Internal {
                message: "TLS requested but the rustls-tls feature is not enabled".to_string(),
            }
            .into()),
            None => Ok(AsyncStream::Tcp(tcp)),
        }
    }
}

async fn tcp_connect(address: &ServerAddress) -> Result<TcpStream> {
    let hostport = format!("{}:{}", address.host, address.port);
    let mut addrs = tokio::net::lookup_host(&hostport).await.map_err(|e| {
        Error::from(ErrorKind::Internal {
            message: format!("DNS resolution failed for {hostport}: {e}"),
        })
    })?;

    let mut last_err = None;
    while let Some(addr) = addrs.next() {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(Error::from)
        .unwrap_or_else(|| Error::from(ErrorKind::Internal {
            message: format!("no addresses resolved for {hostport}"),
        })))
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(inner) => AsyncRead::poll_read(Pin::new(inner), cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(inner) => AsyncRead::poll_read(Pin::new(inner.as_mut()), cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(inner) => AsyncWrite::poll_write(Pin::new(inner), cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(inner) => AsyncWrite::poll_write(Pin::new(inner.as_mut()), cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(inner) => AsyncWrite::poll_flush(Pin::new(inner), cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(inner) => AsyncWrite::poll_flush(Pin::new(inner.as_mut()), cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(inner) => AsyncWrite::poll_shutdown(Pin::new(inner), cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(inner) => AsyncWrite::poll_shutdown(Pin::new(inner.as_mut()), cx),
        }
    }
}
