//! Drives the handshake a freshly-connected socket must complete before the pool will hand
//! it out: `hello`/`isMaster`, then optional authentication (spec.md §4.2, §4.6).

use bson::{doc, Document};
use serde::Deserialize;

use super::{command::Command, connection::Connection};
use crate::{
    client::{
        auth,
        options::{ClientOptions, Credential, ServerAddress},
    },
    error::{Error, ErrorKind, Result},
    runtime::TlsConfig,
};

/// Driver identity sent in the handshake's `client` field (spec.md §6).
const DRIVER_NAME: &str = "mongo-wire-core";
const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
struct HelloReply {
    #[serde(rename = "maxWireVersion", default = "default_wire_version")]
    max_wire_version: i32,
    #[serde(rename = "maxMessageSizeBytes")]
    max_message_size_bytes: Option<i32>,
    #[serde(rename = "maxBsonObjectSize")]
    max_bson_object_size: Option<i32>,
    #[serde(rename = "maxWriteBatchSize")]
    max_write_batch_size: Option<i32>,
    #[serde(rename = "logicalSessionTimeoutMinutes")]
    logical_session_timeout_minutes: Option<i32>,
    #[serde(rename = "saslSupportedMechs", default)]
    sasl_supported_mechs: Vec<String>,
}

fn default_wire_version() -> i32 {
    0
}

/// Server capabilities learned from the handshake (spec.md §6), retained by the pool for
/// cursor batch-size and write-batch decisions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerDescription {
    pub(crate) max_wire_version: i32,
    pub(crate) max_message_size_bytes: i32,
    pub(crate) max_bson_object_size: i32,
    pub(crate) max_write_batch_size: i32,
    pub(crate) logical_session_timeout_minutes: i32,
}

impl Default for ServerDescription {
    fn default() -> Self {
        Self {
            max_wire_version: 0,
            max_message_size_bytes: crate::wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 100_000,
            logical_session_timeout_minutes: 30,
        }
    }
}

fn hello_command() -> Document {
    doc! {
        "isMaster": 1,
        "client": {
            "driver": { "name": DRIVER_NAME, "version": DRIVER_VERSION },
            "os": { "type": std::env::consts::OS },
        },
        "compression": [],
    }
}

/// Opens a connection and runs it through handshake + auth, per spec.md §4.2 `connect`.
pub(crate) async fn establish_connection(
    id: u32,
    address: ServerAddress,
    options: &ClientOptions,
    tls_config: Option<&TlsConfig>,
) -> Result<(Connection, ServerDescription)> {
    let conn = Connection::connect(id, address, options, tls_config).await?;

    let mut hello_body = hello_command();
    if let Some(app_name) = &options.application_name {
        if let Some(client) = hello_body.get_document_mut("client").ok() {
            client.insert("application", doc! { "name": app_name.clone() });
        }
    }
    let source = options.resolved_auth_source().to_string();
    if let (Credential::ScramNegotiate { .. }, Some(username)) =
        (&options.credential, options.credential.username())
    {
        hello_body.insert("saslSupportedMechs", format!("{source}.{username}"));
    }

    let reply = conn
        .send(Command::new("isMaster", "admin", hello_body))
        .await?
        .into_result()?;

    let hello: HelloReply = bson::from_document(reply)
        .map_err(|_| Error::from(ErrorKind::InvalidResponse {
            document: "malformed hello/isMaster reply".to_string(),
        }))?;

    conn.set_max_wire_version(hello.max_wire_version);
    let description = ServerDescription {
        max_wire_version: hello.max_wire_version,
        max_message_size_bytes: hello
            .max_message_size_bytes
            .unwrap_or(crate::wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES),
        max_bson_object_size: hello.max_bson_object_size.unwrap_or(16 * 1024 * 1024),
        max_write_batch_size: hello.max_write_batch_size.unwrap_or(100_000),
        logical_session_timeout_minutes: hello.logical_session_timeout_minutes.unwrap_or(30),
    };
    conn.set_max_message_size_bytes(description.max_message_size_bytes);

    let credential = options.credential.clone().resolve(&hello.sasl_supported_mechs);
    auth::authenticate(&conn, &credential, &source).await?;

    Ok((conn, description))
}
