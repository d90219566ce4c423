use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use hmac::{digest::KeyInit, Hmac, Mac};
use md5::Md5;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    auth::{self, Credential},
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    bson_util,
    command::Command,
    conn::Connection,
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept
/// from the server.
const MIN_ITERATION_COUNT: usize = 4096;

/// Cache of pre-computed salted passwords, so repeated handshakes with the
/// same credential skip the PBKDF2 work.
static CREDENTIAL_CACHE: Lazy<RwLock<HashMap<CacheEntry, Vec<u8>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: usize,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the client, classified according to the
/// hash function used.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    /// Perform SCRAM authentication over the given connection.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        let source = credential.source.as_str();
        let nonce = auth::generate_nonce();

        let client_first = ClientFirst::new(&credential.username, nonce.as_str());

        let command = Command::new("saslStart", source, client_first.to_command(self));
        let server_first_response = conn.run_command(command.into_document()).await?;
        let server_first = ServerFirst::parse(server_first_response)?;
        server_first.validate(nonce.as_str())?;

        let cache_entry_key = CacheEntry {
            password: credential.password.clone(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: self.clone(),
        };
        let cached_password = CREDENTIAL_CACHE
            .read()
            .unwrap()
            .get(&cache_entry_key)
            .cloned();
        let (should_update_cache, salted_password) = match cached_password {
            Some(pwd) => (false, pwd),
            None => (
                true,
                self.compute_salted_password(
                    &credential.username,
                    &credential.password,
                    server_first.i(),
                    server_first.salt(),
                )?,
            ),
        };

        let client_final = ClientFinal::new(
            salted_password.as_slice(),
            &client_first,
            &server_first,
            self,
        )?;

        let command = Command::new("saslContinue", source, client_final.to_command());
        let server_final_response = conn.run_command(command.into_document()).await?;
        let server_final = ServerFinal::parse(server_final_response)?;
        server_final.validate(salted_password.as_slice(), &client_final, self)?;

        // Normal SCRAM implementations would cease here. The following round
        // trip is MongoDB implementation specific: a client no-op answered by
        // a server no-op carrying "done: true".
        let mut conversation_done = server_final.done();
        while !conversation_done {
            let noop = doc! {
                "saslContinue": 1,
                "conversationId": server_final.conversation_id().clone(),
                "payload": Binary { subtype: BinarySubtype::Generic, bytes: Vec::new() },
            };
            let command = Command::new("saslContinue", source, noop);
            let response = conn.run_command(command.into_document()).await?;
            validate_command_success(&response)?;

            if response
                .get("conversationId")
                .map(|id| id == server_final.conversation_id())
                != Some(true)
            {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "mismatched conversationId's",
                ));
            }

            conversation_done = response.get_bool("done").unwrap_or(false);
        }

        if should_update_cache {
            if let Ok(mut cache) = CREDENTIAL_CACHE.write() {
                cache.entry(cache_entry_key).or_insert(salted_password);
            }
        }

        tracing::debug!(
            target: "mongolite::connection",
            mechanism = %self,
            "authentication complete"
        );

        Ok(())
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input),
        }
    }

    /// Compute the HMAC of the given key and input and verify it matches the
    /// given signature.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
    }

    /// The "H" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "Hi" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: usize) -> Result<Vec<u8>> {
        let mut buf = vec![
            0u8;
            match self {
                ScramVersion::Sha1 => 160 / 8,
                ScramVersion::Sha256 => 256 / 8,
            }
        ];
        let derived = match self {
            ScramVersion::Sha1 => {
                pbkdf2::pbkdf2::<Hmac<Sha1>>(str.as_bytes(), salt, iterations as u32, &mut buf)
            }
            ScramVersion::Sha256 => {
                pbkdf2::pbkdf2::<Hmac<Sha256>>(str.as_bytes(), salt, iterations as u32, &mut buf)
            }
        };
        derived.map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
        Ok(buf)
    }

    /// Computes the salted password according to the SCRAM RFC and the
    /// MongoDB specific password hashing algorithm.
    fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        i: usize,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let normalized_password: Cow<'_, str> = match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Cow::Owned(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => p,
                Err(_) => {
                    return Err(Error::authentication_error(
                        "SCRAM-SHA-256",
                        "saslprep failure",
                    ))
                }
            },
        };

        self.h_i(normalized_password.as_ref(), salt, i)
    }
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ScramVersion::Sha1 => write!(f, "SCRAM-SHA-1"),
            ScramVersion::Sha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <M as Mac>::new_from_slice(key).map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac + KeyInit>(key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
    let mut mac =
        <M as Mac>::new_from_slice(key).map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
    mac.update(input);
    mac.verify_slice(signature)
        .map_err(|_| Error::authentication_error("SCRAM", "authentication failed"))
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>",
/// if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    if str.chars().next() != Some(expected_key) || str.chars().nth(1) != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(str.chars().skip(2).collect())
    }
}

fn validate_command_success(response: &Document) -> Result<()> {
    let ok = response
        .get("ok")
        .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
    match bson_util::get_int(ok) {
        Some(1) => Ok(()),
        Some(_) => Err(Error::authentication_error(
            "SCRAM",
            response
                .get_str("errmsg")
                .unwrap_or("authentication failure"),
        )),
        _ => Err(Error::invalid_authentication_response("SCRAM")),
    }
}

/// Model of the first message sent by the client.
struct ClientFirst {
    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,
}

impl ClientFirst {
    fn new(username: &str, nonce: &str) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!("{}={},{}={}", USERNAME_KEY, username, NONCE_KEY, nonce);
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }

    fn to_command(&self, scram: &ScramVersion) -> Document {
        doc! {
            "saslStart": 1,
            "mechanism": scram.to_string(),
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.message().as_bytes().to_vec(),
            },
        }
    }
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to
/// the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: usize,
}

impl ServerFirst {
    fn parse(response: Document) -> Result<Self> {
        validate_command_success(&response)?;

        let conversation_id = response
            .get("conversationId")
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let payload = response
            .get_binary_generic("payload")
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;
        let done = response
            .get_bool("done")
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;
        let message = str::from_utf8(payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let parts: Vec<&str> = message.split(',').collect();

        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = base64::decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let i: usize = match parse_kvp(parts[2], ITERATION_COUNT_KEY)?.parse() {
            Ok(num) => num,
            Err(_) => {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "iteration count invalid",
                ))
            }
        };

        Ok(ServerFirst {
            conversation_id: conversation_id.clone(),
            done,
            message: message.to_string(),
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> usize {
        self.i
    }

    fn validate(&self, nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if &self.nonce[0..nonce.len()] != nonce {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
///
/// Contains the "AuthMessage" mentioned in the RFC used in computing the
/// client and server signatures.
struct ClientFinal {
    message: String,
    auth_message: String,
    conversation_id: Bson,
}

impl ClientFinal {
    fn new(
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            base64::encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof =
            base64::encode(xor(client_key.as_slice(), client_signature.as_slice()).as_slice());

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
            conversation_id: server_first.conversation_id().clone(),
        })
    }

    fn payload(&self) -> Bson {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: self.message().as_bytes().to_vec(),
        })
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }

    fn to_command(&self) -> Document {
        doc! {
            "saslContinue": 1,
            "conversationId": self.conversation_id.clone(),
            "payload": self.payload()
        }
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(response: Document) -> Result<Self> {
        validate_command_success(&response)?;

        let conversation_id = response
            .get("conversationId")
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let done = response
            .get_bool("done")
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;
        let payload = response
            .get_binary_generic("payload")
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;
        let message = str::from_utf8(payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(ServerFinal {
            conversation_id: conversation_id.clone(),
            done,
            body,
        })
    }

    fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        if self.conversation_id != client_final.conversation_id {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched conversationId's",
            ));
        };

        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = base64::decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error("SCRAM", err.as_str()))
            }
        }
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The RFC 5802 §5 example exchange: user "user", password "pencil",
    // client nonce "fyko+d2lbbFgONRv9qkxdawL".
    #[test]
    fn sha1_rfc5802_client_final() {
        let scram = ScramVersion::Sha1;
        let client_first = ClientFirst::new("user", "fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(client_first.message(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(client_first.bare_message(), "n=user,r=fyko+d2lbbFgONRv9qkxdawL");

        let server_first = ServerFirst::parse(doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,\
                         i=4096"
                    .to_vec(),
            },
        })
        .unwrap();
        server_first.validate("fyko+d2lbbFgONRv9qkxdawL").unwrap();
        assert_eq!(server_first.i(), 4096);

        // MongoDB hashes the password as md5("user:mongo:pencil") before the
        // RFC's Hi, so the RFC's proof bytes do not apply verbatim; the
        // structure of the final message still must match.
        let salted = scram
            .compute_salted_password("user", "pencil", server_first.i(), server_first.salt())
            .unwrap();
        let client_final =
            ClientFinal::new(&salted, &client_first, &server_first, &scram).unwrap();
        assert!(client_final
            .message()
            .starts_with("c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p="));
        assert_eq!(
            client_final.auth_message(),
            format!(
                "{},{},{}",
                "n=user,r=fyko+d2lbbFgONRv9qkxdawL",
                "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
                "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j"
            )
        );
    }

    // RFC 7677 §3 test vector, which SCRAM-SHA-256 follows directly (saslprep
    // leaves "pencil" untouched).
    #[test]
    fn sha256_rfc7677_proof() {
        let scram = ScramVersion::Sha256;
        let salt = base64::decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = scram
            .compute_salted_password("user", "pencil", 4096, &salt)
            .unwrap();

        let client_key = scram.hmac(&salted, b"Client Key").unwrap();
        let stored_key = scram.h(&client_key);
        let auth_message = "n=user,r=rOprNGfwEbeRWgbNEkqO,\
                            r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                            s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096,\
                            c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";
        let client_signature = scram.hmac(&stored_key, auth_message.as_bytes()).unwrap();
        let proof = base64::encode(xor(&client_key, &client_signature));
        assert_eq!(proof, "dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=");

        let server_key = scram.hmac(&salted, b"Server Key").unwrap();
        let server_signature = scram.hmac(&server_key, auth_message.as_bytes()).unwrap();
        assert_eq!(
            base64::encode(server_signature),
            "6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="
        );
    }

    #[test]
    fn server_first_iteration_count_floor() {
        let response = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: b"r=abcdef,s=QSXCR+Q6sek8bf92,i=42".to_vec(),
            },
        };
        let server_first = ServerFirst::parse(response).unwrap();
        assert!(server_first.validate("abc").is_err());
    }

    #[test]
    fn server_first_rejects_foreign_nonce() {
        let response = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": Binary {
                subtype: BinarySubtype::Generic,
                bytes: b"r=zzzzzz,s=QSXCR+Q6sek8bf92,i=4096".to_vec(),
            },
        };
        let server_first = ServerFirst::parse(response).unwrap();
        assert!(server_first.validate("abc").is_err());
    }

    #[test]
    fn failed_sasl_response_is_an_authentication_error() {
        let response = doc! { "ok": 0.0, "errmsg": "Authentication failed." };
        assert!(ServerFirst::parse(response).is_err());
    }
}
