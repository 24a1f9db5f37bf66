//! Drives SASL/SCRAM authentication over a freshly-handshaken [`Connection`] (spec.md §4.3).

pub(crate) mod nonce;
mod scram;

use self::scram::ScramVersion;
use super::options::Credential;
use crate::{cmap::connection::Connection, error::Result};

/// Authenticates `conn` with `credential` against `source`, or does nothing for
/// [`Credential::Unauthenticated`]. Never passes a session id (spec.md §4.3: "a dedicated
/// execution path that passes no session id"). `credential` must already be resolved — a
/// [`Credential::ScramNegotiate`] reaching here is a caller bug, since
/// [`crate::cmap::establish::establish_connection`] resolves it against `saslSupportedMechs`
/// before authentication ever starts.
pub(crate) async fn authenticate(
    conn: &Connection,
    credential: &Credential,
    source: &str,
) -> Result<()> {
    match credential {
        Credential::Unauthenticated => Ok(()),
        Credential::ScramSha1 { .. } => {
            scram::authenticate(ScramVersion::Sha1, conn, credential, source).await
        }
        Credential::ScramSha256 { .. } => {
            scram::authenticate(ScramVersion::Sha256, conn, credential, source).await
        }
        Credential::ScramNegotiate { .. } => {
            unreachable!("establish_connection resolves ScramNegotiate before authenticating")
        }
    }
}
