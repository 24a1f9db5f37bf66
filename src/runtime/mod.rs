//! Small async runtime helpers: the TCP/TLS stream abstraction and a deadline wrapper
//! used throughout the connection and pool layers (spec.md §5, "every suspending
//! operation accepts a deadline").

#[cfg(feature = "rustls-tls")]
pub(crate) mod tls;
pub(crate) mod stream;

pub(crate) use stream::AsyncStream;
#[cfg(feature = "rustls-tls")]
pub(crate) use tls::TlsConfig;

#[cfg(not(feature = "rustls-tls"))]
#[derive(Clone, Debug)]
pub(crate) struct TlsConfig;

#[cfg(not(feature = "rustls-tls"))]
impl TlsConfig {
    pub(crate) fn new(_verify_certificates: bool) -> crate::error::Result<Self> {
        Err(crate::error::ErrorKind::Internal {
            message: "TLS requested but the rustls-tls feature is not enabled".to_string(),
        }
        .into())
    }
}

use std::time::Duration;

use crate::error::{Error, ErrorKind, Result, TimeoutScope};

/// Runs `fut` with a deadline; maps an elapsed deadline to `ErrorKind::Timeout { scope }`
/// (spec.md §7, §8 item 8).
pub(crate) async fn timeout<F, T>(duration: Duration, scope: TimeoutScope, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if duration.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::from(ErrorKind::Timeout { scope })),
    }
}
