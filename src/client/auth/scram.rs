//! SCRAM-SHA-1 / SCRAM-SHA-256 SASL conversation (spec.md §4.3).

use std::{collections::HashMap, ops::BitXor, str};

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use bson::{doc, spec::BinarySubtype, Bson, Document};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use tokio::sync::Mutex;

use super::nonce::generate_nonce;
use crate::{
    cmap::{command::Command, connection::Connection},
    client::options::Credential,
    error::{AuthErrorReason, Error, ErrorKind, Result},
};

const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum iteration count accepted from the server, preventing a downgrade attack
/// (spec.md §4.3).
const MIN_ITERATION_COUNT: usize = 4096;

/// Process-wide cache of salted passwords, keyed by the inputs that determine
/// `PBKDF2(password, salt, iterations)`, so a reused credential against the same server
/// doesn't repeat the (deliberately expensive) key derivation on every reconnect.
static CREDENTIAL_CACHE: Mutex<Option<HashMap<CacheKey, Vec<u8>>>> = Mutex::const_new(None);

#[derive(Hash, Eq, PartialEq, Clone)]
struct CacheKey {
    password: String,
    salt: Vec<u8>,
    iterations: usize,
    version: ScramVersion,
}

/// Which hash function backs the conversation.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    pub(crate) fn mechanism_str(self) -> &'static str {
        match self {
            ScramVersion::Sha1 => "SCRAM-SHA-1",
            ScramVersion::Sha256 => "SCRAM-SHA-256",
        }
    }

    fn hmac(self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input),
        }
    }

    fn hmac_verify(self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
    }

    fn h(self, input: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => {
                use sha1::Digest;
                let mut hasher = Sha1::new();
                hasher.update(input);
                hasher.finalize().to_vec()
            }
            ScramVersion::Sha256 => {
                use sha2::Digest;
                let mut hasher = Sha256::new();
                hasher.update(input);
                hasher.finalize().to_vec()
            }
        }
    }

    fn h_i(self, normalized_password: &str, salt: &[u8], iterations: usize) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => h_i::<Hmac<Sha1>>(normalized_password, salt, iterations, 20),
            ScramVersion::Sha256 => h_i::<Hmac<Sha256>>(normalized_password, salt, iterations, 32),
        }
    }

    /// `SaltedPassword`, including the MongoDB-specific MD5 pre-hash for SCRAM-SHA-1 and
    /// SASLprep normalization for SCRAM-SHA-256 (spec.md §4.3 step 1).
    fn normalize_password(self, username: &str, password: &str) -> Result<String> {
        match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{username}:mongo:{password}"));
                Ok(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => stringprep::saslprep(password)
                .map(|s| s.into_owned())
                .map_err(|_| auth_error(self, AuthErrorReason::MalformedAuthenticationDetails)),
        }
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    lhs.iter().zip(rhs.iter()).map(|(l, r)| l.bitxor(*r)).collect()
}

fn mac<M: Mac>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac = M::new_from_slice(key).map_err(|_| internal_auth_error())?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac>(key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
    let mut mac = M::new_from_slice(key).map_err(|_| internal_auth_error())?;
    mac.update(input);
    mac.verify_slice(signature)
        .map_err(|_| ErrorKind::AuthenticationFailure {
            mechanism: "SCRAM".to_string(),
            reason: AuthErrorReason::ScramFailure,
        }
        .into())
}

fn h_i<M: Mac + Clone>(password: &str, salt: &[u8], iterations: usize, output_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; output_size];
    pbkdf2::pbkdf2::<M>(password.as_bytes(), salt, iterations as u32, &mut buf)
        .expect("pbkdf2 output buffer is sized to the hash's digest length");
    buf
}

fn parse_kvp(s: &str, expected_key: char) -> Result<String> {
    let mut chars = s.chars();
    if chars.next() != Some(expected_key) || chars.next() != Some('=') {
        return Err(invalid_response());
    }
    Ok(chars.collect())
}

fn invalid_response() -> Error {
    ErrorKind::InvalidResponse {
        document: "malformed SCRAM payload".to_string(),
    }
    .into()
}

fn auth_error(version: ScramVersion, reason: AuthErrorReason) -> Error {
    ErrorKind::AuthenticationFailure {
        mechanism: version.mechanism_str().to_string(),
        reason,
    }
    .into()
}

fn internal_auth_error() -> Error {
    ErrorKind::Internal {
        message: "SCRAM key derivation failed".to_string(),
    }
    .into()
}

struct ClientFirst {
    gs2_header: String,
    bare: String,
}

impl ClientFirst {
    fn new(username: &str, nonce: &str) -> Self {
        Self {
            gs2_header: format!("{NO_CHANNEL_BINDING},,"),
            bare: format!("{USERNAME_KEY}={username},{NONCE_KEY}={nonce}"),
        }
    }

    fn message(&self) -> String {
        format!("{}{}", self.gs2_header, self.bare)
    }
}

struct ServerFirst {
    conversation_id: Bson,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    iterations: usize,
}

impl ServerFirst {
    fn parse(version: ScramVersion, response: &Document) -> Result<Self> {
        let conversation_id = response
            .get("conversationId")
            .cloned()
            .ok_or_else(invalid_response)?;
        let payload = response
            .get_binary_generic("payload")
            .map_err(|_| invalid_response())?;
        let done = response.get_bool("done").unwrap_or(false);
        if done {
            return Err(auth_error(version, AuthErrorReason::ScramFailure));
        }
        let message = str::from_utf8(payload).map_err(|_| invalid_response())?.to_string();

        let parts: Vec<&str> = message.split(',').collect();
        if parts.len() < 3 {
            return Err(invalid_response());
        }
        let nonce = parse_kvp(parts[0], NONCE_KEY)?;
        let salt = base64
            .decode(parse_kvp(parts[1], SALT_KEY)?)
            .map_err(|_| invalid_response())?;
        let iterations: usize = parse_kvp(parts[2], ITERATION_COUNT_KEY)?
            .parse()
            .map_err(|_| invalid_response())?;

        if iterations < MIN_ITERATION_COUNT {
            return Err(auth_error(version, AuthErrorReason::ScramFailure));
        }

        Ok(Self {
            conversation_id,
            message,
            nonce,
            salt,
            iterations,
        })
    }

    fn validate(&self, client_nonce: &str) -> Result<()> {
        if !self.nonce.starts_with(client_nonce) {
            return Err(invalid_response());
        }
        Ok(())
    }
}

struct ClientFinal {
    message: String,
    auth_message: String,
    conversation_id: Bson,
}

impl ClientFinal {
    fn new(
        version: ScramVersion,
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
    ) -> Result<Self> {
        let client_key = version.hmac(salted_password, b"Client Key")?;
        let stored_key = version.h(&client_key);

        let without_proof = format!(
            "{CHANNEL_BINDING_KEY}={},{NONCE_KEY}={}",
            base64.encode(&client_first.gs2_header),
            server_first.nonce
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare, server_first.message, without_proof
        );
        let client_signature = version.hmac(&stored_key, auth_message.as_bytes())?;
        let client_proof = base64.encode(xor(&client_key, &client_signature));

        Ok(Self {
            message: format!("{without_proof},{PROOF_KEY}={client_proof}"),
            auth_message,
            conversation_id: server_first.conversation_id.clone(),
        })
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(response: &Document) -> Result<Self> {
        let conversation_id = response
            .get("conversationId")
            .cloned()
            .ok_or_else(invalid_response)?;
        let done = response.get_bool("done").unwrap_or(false);
        let payload = response
            .get_binary_generic("payload")
            .map_err(|_| invalid_response())?;
        let message = str::from_utf8(payload).map_err(|_| invalid_response())?;

        let first = message.chars().next().ok_or_else(invalid_response)?;
        let body = match first {
            ERROR_KEY => ServerFinalBody::Error(parse_kvp(message, ERROR_KEY)?),
            VERIFIER_KEY => ServerFinalBody::Verifier(parse_kvp(message, VERIFIER_KEY)?),
            _ => return Err(invalid_response()),
        };

        Ok(Self {
            conversation_id,
            done,
            body,
        })
    }

    fn validate(&self, version: ScramVersion, salted_password: &[u8], client_final: &ClientFinal) -> Result<()> {
        if self.conversation_id != client_final.conversation_id {
            return Err(invalid_response());
        }
        match &self.body {
            ServerFinalBody::Error(message) => {
                tracing::debug!(%message, "server rejected SCRAM conversation");
                Err(auth_error(version, AuthErrorReason::ScramFailure))
            }
            ServerFinalBody::Verifier(verifier) => {
                let server_key = version.hmac(salted_password, b"Server Key")?;
                let decoded = base64.decode(verifier).map_err(|_| invalid_response())?;
                version.hmac_verify(&server_key, client_final.auth_message.as_bytes(), &decoded)
            }
        }
    }
}

/// Runs the full SCRAM conversation described in spec.md §4.3 over `conn`, using no session id
/// (the dedicated authentication path).
pub(crate) async fn authenticate(
    version: ScramVersion,
    conn: &Connection,
    credential: &Credential,
    source: &str,
) -> Result<()> {
    let username = credential.username().ok_or_else(|| {
        auth_error(version, AuthErrorReason::MalformedAuthenticationDetails)
    })?;
    let password = credential.password().ok_or_else(|| {
        auth_error(version, AuthErrorReason::MalformedAuthenticationDetails)
    })?;

    let nonce = generate_nonce();
    let client_first = ClientFirst::new(username, &nonce);

    let start_body = doc! {
        "saslStart": 1,
        "mechanism": version.mechanism_str(),
        "payload": Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: client_first.message().into_bytes(),
        }),
    };
    let reply = conn
        .send(Command::new("saslStart", source, start_body))
        .await?
        .into_result()?;

    let server_first = ServerFirst::parse(version, &reply)?;
    server_first.validate(&nonce)?;

    let normalized_password = version.normalize_password(username, password)?;
    let salted_password = salted_password(
        version,
        &normalized_password,
        &server_first.salt,
        server_first.iterations,
    )
    .await;

    let client_final = ClientFinal::new(version, &salted_password, &client_first, &server_first)?;

    let continue_body = doc! {
        "saslContinue": 1,
        "conversationId": client_final.conversation_id.clone(),
        "payload": Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: client_final.message.clone().into_bytes(),
        }),
    };
    let reply = conn
        .send(Command::new("saslContinue", source, continue_body))
        .await?
        .into_result()?;

    let server_final = ServerFinal::parse(&reply)?;
    server_final.validate(version, &salted_password, &client_final)?;

    // MongoDB's SCRAM implementation requires one more round trip after the server signature
    // verifies: an empty client no-op, answered with `done: true` (spec.md §4.3 step 5).
    if !server_final.done {
        let noop = doc! {
            "saslContinue": 1,
            "conversationId": server_final.conversation_id.clone(),
            "payload": Bson::Binary(bson::Binary { subtype: BinarySubtype::Generic, bytes: vec![] }),
        };
        let reply = conn
            .send(Command::new("saslContinue", source, noop))
            .await?
            .into_result()?;

        if reply.get("conversationId") != Some(&server_final.conversation_id) {
            return Err(invalid_response());
        }
        if !reply.get_bool("done").unwrap_or(false) {
            return Err(auth_error(version, AuthErrorReason::MalformedAuthenticationDetails));
        }
    }

    Ok(())
}

async fn salted_password(
    version: ScramVersion,
    normalized_password: &str,
    salt: &[u8],
    iterations: usize,
) -> Vec<u8> {
    let key = CacheKey {
        password: normalized_password.to_string(),
        salt: salt.to_vec(),
        iterations,
        version,
    };

    let mut cache = CREDENTIAL_CACHE.lock().await;
    let cache = cache.get_or_insert_with(HashMap::new);
    if let Some(cached) = cache.get(&key) {
        return cached.clone();
    }

    let derived = version.h_i(normalized_password, salt, iterations);
    cache.insert(key, derived.clone());
    derived
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn iteration_count_floor_is_enforced() {
        let reply = doc! {
            "conversationId": 1,
            "done": false,
            "payload": Bson::Binary(bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: b"r=abc,s=c2FsdA==,i=100".to_vec(),
            }),
        };
        let err = ServerFirst::parse(ScramVersion::Sha256, &reply).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::AuthenticationFailure { .. }));
    }

    #[test]
    fn server_first_nonce_must_extend_client_nonce() {
        let reply = doc! {
            "conversationId": 1,
            "done": false,
            "payload": Bson::Binary(bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: b"r=other,s=c2FsdA==,i=10000".to_vec(),
            }),
        };
        let server_first = ServerFirst::parse(ScramVersion::Sha1, &reply).unwrap();
        assert!(server_first.validate("client-nonce").is_err());
    }

    #[test]
    fn sha1_password_prehash_matches_mongodb_cr_style() {
        let normalized = ScramVersion::Sha1
            .normalize_password("user", "pencil")
            .unwrap();
        assert_eq!(normalized.len(), 32);
    }
}
