//! Contains the SCRAM authentication logic run during `connect`.

mod scram;

use rand::Rng;

use crate::{conn::Connection, error::Result};

pub(crate) use scram::ScramVersion;

/// The authentication mechanisms supported by the client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// SCRAM over SHA-1, for servers predating SCRAM-SHA-256 support.
    ScramSha1,

    /// SCRAM over SHA-256, the server default since MongoDB 4.0.
    #[default]
    ScramSha256,
}

impl AuthMechanism {
    pub(crate) fn scram_version(&self) -> ScramVersion {
        match self {
            AuthMechanism::ScramSha1 => ScramVersion::Sha1,
            AuthMechanism::ScramSha256 => ScramVersion::Sha256,
        }
    }
}

/// The credential a connection authenticates with. The source is the
/// database the SASL conversation targets, always `admin` for this client.
#[derive(Clone, Debug)]
pub(crate) struct Credential {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) source: String,
}

/// Runs the SCRAM conversation over the given connection. Sessions and
/// transactions play no part here; the handshake happens before any user
/// command is accepted.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    mechanism: &AuthMechanism,
) -> Result<()> {
    mechanism
        .scram_version()
        .authenticate_stream(conn, credential)
        .await
}

pub(crate) fn generate_nonce_bytes() -> [u8; 32] {
    rand::thread_rng().gen()
}

pub(crate) fn generate_nonce() -> String {
    base64::encode(generate_nonce_bytes())
}
