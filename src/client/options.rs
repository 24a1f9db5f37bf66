//! Settings surface parsed from a connection string (spec.md §6, "Settings struct").

use std::{fmt, hash::Hash, str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};

const DEFAULT_PORT: u16 = 27017;

/// A host/port pair that can be connected to over TCP.
#[derive(Clone, Debug, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl serde::Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Hash for ServerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = crate::error::Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses a single `host[:port]` token, as found between commas in a connection string's
    /// host list.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.splitn(2, ':');
        let host = match parts.next() {
            Some(h) if !h.is_empty() => h.to_lowercase(),
            _ => {
                return Err(ErrorKind::InvalidUri {
                    reason: crate::error::InvalidUriReason::UriIsMalformed,
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| invalid_port_error())?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(invalid_port_error());
        }

        Ok(ServerAddress { host, port })
    }
}

fn invalid_port_error() -> crate::error::Error {
    ErrorKind::InvalidUri {
        reason: crate::error::InvalidUriReason::InvalidPort,
    }
    .into()
}

/// Authentication variant carried by [`ClientOptions`] (spec.md §6).
///
/// `ScramNegotiate` is held only until the handshake's `saslSupportedMechs` reply resolves it
/// to `ScramSha1` or `ScramSha256` (spec.md §4.3 expansion); nothing past
/// [`crate::cmap::establish::establish_connection`] ever sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Unauthenticated,
    ScramSha1 {
        username: String,
        password: String,
    },
    ScramSha256 {
        username: String,
        password: String,
    },
    ScramNegotiate {
        username: String,
        password: String,
    },
}

impl Credential {
    pub(crate) fn username(&self) -> Option<&str> {
        match self {
            Credential::Unauthenticated => None,
            Credential::ScramSha1 { username, .. }
            | Credential::ScramSha256 { username, .. }
            | Credential::ScramNegotiate { username, .. } => Some(username.as_str()),
        }
    }

    pub(crate) fn password(&self) -> Option<&str> {
        match self {
            Credential::Unauthenticated => None,
            Credential::ScramSha1 { password, .. }
            | Credential::ScramSha256 { password, .. }
            | Credential::ScramNegotiate { password, .. } => Some(password.as_str()),
        }
    }

    pub(crate) fn mechanism_name(&self) -> &'static str {
        match self {
            Credential::Unauthenticated => "none",
            Credential::ScramSha1 { .. } => "SCRAM-SHA-1",
            Credential::ScramSha256 { .. } => "SCRAM-SHA-256",
            Credential::ScramNegotiate { .. } => "negotiate",
        }
    }

    /// Resolves a negotiated credential to the concrete mechanism the server advertised in
    /// `sasl_supported_mechs`, preferring SCRAM-SHA-256 when both are offered (spec.md §4.3
    /// expansion). Non-negotiating variants pass through unchanged.
    pub(crate) fn resolve(self, sasl_supported_mechs: &[String]) -> Credential {
        match self {
            Credential::ScramNegotiate { username, password } => {
                if sasl_supported_mechs.iter().any(|m| m == "SCRAM-SHA-256") {
                    Credential::ScramSha256 { username, password }
                } else {
                    Credential::ScramSha1 { username, password }
                }
            }
            other => other,
        }
    }
}

/// TLS configuration (spec.md §6, `ssl`/`tls`/`sslVerify`).
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct TlsOptions {
    #[builder(default = true)]
    pub verify_certificates: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_certificates: true,
        }
    }
}

/// The fully-resolved settings a [`crate::cmap::pool::ConnectionPool`] and
/// [`crate::client::auth`] engine are configured from. Produced either by
/// [`crate::client::uri::parse`] or built directly.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ClientOptions {
    pub hosts: Vec<ServerAddress>,

    #[builder(default = Credential::Unauthenticated)]
    pub credential: Credential,

    #[builder(default)]
    pub auth_source: Option<String>,

    #[builder(default)]
    pub target_database: Option<String>,

    #[builder(default = false)]
    pub use_tls: bool,

    #[builder(default)]
    pub tls_options: TlsOptions,

    #[builder(default = 10)]
    pub max_pool_size: u32,

    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    #[builder(default = Duration::from_secs(0))]
    pub socket_timeout: Duration,

    #[builder(default)]
    pub application_name: Option<String>,
}

impl ClientOptions {
    /// The database used to look up credentials: `authSource`, else the path database, else
    /// `admin` (spec.md §6).
    pub(crate) fn resolved_auth_source(&self) -> &str {
        self.auth_source
            .as_deref()
            .or(self.target_database.as_deref())
            .unwrap_or("admin")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_address_defaults_port() {
        let addr = ServerAddress::parse("h1").unwrap();
        assert_eq!(addr.host, "h1");
        assert_eq!(addr.port, 27017);
    }

    #[test]
    fn server_address_rejects_zero_port() {
        assert!(ServerAddress::parse("h1:0").is_err());
    }

    #[test]
    fn resolved_auth_source_prefers_explicit_source() {
        let opts = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("h1").unwrap()])
            .auth_source(Some("admin2".to_string()))
            .target_database(Some("app".to_string()))
            .build();
        assert_eq!(opts.resolved_auth_source(), "admin2");
    }

    #[test]
    fn resolved_auth_source_falls_back_to_admin() {
        let opts = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("h1").unwrap()])
            .build();
        assert_eq!(opts.resolved_auth_source(), "admin");
    }

    #[test]
    fn negotiation_prefers_sha_256_when_both_are_offered() {
        let cred = Credential::ScramNegotiate {
            username: "alice".to_string(),
            password: "pass".to_string(),
        };
        let resolved = cred.resolve(&["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()]);
        assert_eq!(
            resolved,
            Credential::ScramSha256 {
                username: "alice".to_string(),
                password: "pass".to_string(),
            }
        );
    }

    #[test]
    fn negotiation_falls_back_to_sha_1_when_256_is_not_offered() {
        let cred = Credential::ScramNegotiate {
            username: "alice".to_string(),
            password: "pass".to_string(),
        };
        let resolved = cred.resolve(&["SCRAM-SHA-1".to_string()]);
        assert_eq!(
            resolved,
            Credential::ScramSha1 {
                username: "alice".to_string(),
                password: "pass".to_string(),
            }
        );
    }

    #[test]
    fn non_negotiating_credentials_pass_through_resolve_unchanged() {
        let cred = Credential::ScramSha1 {
            username: "alice".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(cred.clone().resolve(&[]), cred);
    }
}
