//! Contains the `Error` and `Result` types that `mongolite` uses.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;

use crate::bson::{Bson, Document};

/// The codes the server uses to signal that a node is unreachable or stepping
/// down. Errors carrying one of these are network errors for retry purposes.
const NETWORK_ERROR_CODES: [i32; 6] = [6, 7, 9001, 11600, 11601, 11602];

/// Codes that indicate an operation ran out of time, either server-side
/// (`MaxTimeMSExpired`) or while waiting on an interrupted node.
const TIMEOUT_ERROR_CODES: [i32; 3] = [50, 89, 11601];

const DUPLICATE_KEY_CODES: [i32; 2] = [11000, 11001];

const TRANSIENT_TRANSACTION_CODES: [i32; 7] = [251, 91, 189, 262, 10107, 13435, 13436];

const UNKNOWN_COMMIT_CODES: [i32; 10] = [50, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436];

/// Transient transaction error label. An error carrying this label aborts the
/// current attempt, but the whole transaction can be retried with a reasonable
/// expectation that it will succeed.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Unknown transaction commit result error label. A commit failing with this
/// label may or may not have applied; it is safe to retry the commit itself.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all fallible methods in the `mongolite` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongolite` crate. The inner
/// [`ErrorKind`] is boxed to keep the type small; error labels reported by the
/// server are carried alongside so callers can classify failures without
/// string matching.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    pub(crate) operation: Option<String>,

    pub(crate) write_errors: Option<Vec<IndexedWriteError>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
            operation: None,
            write_errors: None,
        }
    }

    pub(crate) fn with_write_errors(mut self, write_errors: Vec<IndexedWriteError>) -> Self {
        self.write_errors = Some(write_errors);
        self
    }

    /// Creates an authentication error for the given mechanism with the
    /// provided reason.
    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    /// Creates an authentication error for the given mechanism with a generic
    /// "internal error" message.
    pub(crate) fn unknown_authentication_error(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "internal error")
    }

    /// Creates an authentication error for the given mechanism when the server
    /// response is malformed.
    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid server response")
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Error {
        ErrorKind::Transaction {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// The name of the command that produced this error, when it originated
    /// from an operation.
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// The error labels attached to this error by the server or the client.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error carries the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// The server error code, if this error originated from a command or write
    /// failure.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::Write(ref failure) => Some(failure.code()),
            ErrorKind::BulkWrite(ref err) => err
                .write_errors
                .first()
                .map(|e| e.code)
                .or_else(|| err.write_concern_error.as_ref().map(|e| e.code)),
            _ => None,
        }
    }

    /// The server error code name, if one was reported.
    pub fn code_name(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code_name.as_str()),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => {
                Some(err.code_name.as_str())
            }
            ErrorKind::Write(WriteFailure::WriteError(ref err)) => err.code_name.as_deref(),
            _ => None,
        }
    }

    /// The individual write errors carried by a write or bulk-write failure.
    pub fn write_errors(&self) -> Option<&[IndexedWriteError]> {
        if let Some(ref write_errors) = self.write_errors {
            return Some(write_errors);
        }
        match self.kind.as_ref() {
            ErrorKind::BulkWrite(ref err) => Some(&err.write_errors),
            _ => None,
        }
    }

    /// The write concern error carried by a write or bulk-write failure.
    pub fn write_concern_error(&self) -> Option<&WriteConcernError> {
        match self.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err),
            ErrorKind::BulkWrite(ref err) => err.write_concern_error.as_ref(),
            _ => None,
        }
    }

    /// Whether this error was caused by the peer being unreachable, either at
    /// the socket level or via one of the server's network error codes.
    pub fn is_network_error(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Io(_) | ErrorKind::Transport { .. } => true,
            _ => matches!(self.code(), Some(code) if NETWORK_ERROR_CODES.contains(&code)),
        }
    }

    /// Whether this error indicates the operation ran out of time.
    pub fn is_timeout(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::ReceiveTimeout { .. } => true,
            ErrorKind::Io(ref err) if err.kind() == std::io::ErrorKind::TimedOut => true,
            _ => matches!(self.code(), Some(code) if TIMEOUT_ERROR_CODES.contains(&code)),
        }
    }

    /// Whether this error was caused by a duplicate key violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.code(), Some(code) if DUPLICATE_KEY_CODES.contains(&code))
    }

    /// Whether the whole transaction can be retried from the top. True when
    /// the server attached the transient label or returned one of the
    /// transient state-change codes, or when the failure never reached the
    /// server at all.
    pub fn is_transient_transaction_error(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return true;
        }
        matches!(self.code(), Some(code) if TRANSIENT_TRANSACTION_CODES.contains(&code))
    }

    /// Whether a failed commit may or may not have applied, making it safe to
    /// retry the commit itself.
    pub fn is_unknown_transaction_commit_result(&self) -> bool {
        if self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
            return true;
        }
        matches!(self.code(), Some(code) if UNKNOWN_COMMIT_CODES.contains(&code))
    }

    /// The broad category of this error. Categories partition every failure
    /// the crate can surface, so callers can branch without inspecting codes
    /// or messages.
    pub fn category(&self) -> ErrorCategory {
        match self.kind.as_ref() {
            ErrorKind::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            ErrorKind::InvalidConcern { .. } => ErrorCategory::InvalidConcern,
            ErrorKind::Authentication { .. } => ErrorCategory::Authentication,
            ErrorKind::Connection { .. } => ErrorCategory::Connection,
            ErrorKind::Framing { .. } => ErrorCategory::Framing,
            ErrorKind::ReceiveTimeout { .. } => ErrorCategory::ReceiveTimeout,
            ErrorKind::Transport { .. } => ErrorCategory::Transport,
            ErrorKind::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            ErrorKind::BulkWrite(_) => ErrorCategory::BulkWrite,
            ErrorKind::Io(_) => {
                if self.is_timeout() {
                    ErrorCategory::Timeout
                } else {
                    ErrorCategory::Network
                }
            }
            ErrorKind::Transaction { .. } => ErrorCategory::Transaction,
            ErrorKind::Write(WriteFailure::WriteConcernError(_)) => ErrorCategory::WriteConcern,
            ErrorKind::Write(WriteFailure::WriteError(_)) if self.is_duplicate_key() => {
                ErrorCategory::DuplicateKey
            }
            ErrorKind::Write(WriteFailure::WriteError(_)) => ErrorCategory::Write,
            ErrorKind::Command(_) => {
                if self.is_duplicate_key() {
                    ErrorCategory::DuplicateKey
                } else if self.is_unknown_transaction_commit_result()
                    && self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                {
                    ErrorCategory::UnknownCommitResult
                } else if self.is_transient_transaction_error() {
                    ErrorCategory::TransientTransaction
                } else if self.is_timeout() {
                    ErrorCategory::Timeout
                } else if self.is_network_error() {
                    ErrorCategory::Network
                } else {
                    ErrorCategory::Command
                }
            }
            ErrorKind::InvalidResponse { .. } => ErrorCategory::InvalidResponse,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::InvalidArgument {
            message: format!("failed to encode document: {}", err),
        }
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::InvalidResponse {
            message: format!("failed to decode document: {}", err),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A read or write concern specification failed validation.
    #[error("Invalid concern: {message}")]
    #[non_exhaustive]
    InvalidConcern { message: String },

    /// The SCRAM handshake was rejected by the server or produced an invalid
    /// exchange.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// The TCP connection could not be established, or the transport failed
    /// before the authentication handshake completed.
    #[error("Connection failure: {message}")]
    #[non_exhaustive]
    Connection { message: String },

    /// A wire message violated the `OP_MSG` frame format.
    #[error("Framing error: {message}")]
    #[non_exhaustive]
    Framing { message: String },

    /// The server did not deliver a complete response within the receive
    /// backoff budget.
    #[error("Timed out receiving a response after {attempts} attempts")]
    #[non_exhaustive]
    ReceiveTimeout { attempts: u32 },

    /// Sending failed even after the single automatic reconnect.
    #[error("Transport failure: {message}")]
    #[non_exhaustive]
    Transport { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// One or more failures occurred in a multi-document write.
    #[error("An error occurred in a bulk write: {0:?}")]
    BulkWrite(BulkWriteError),

    /// A session/transaction state machine violation, an aborted transaction,
    /// or an exhausted retry budget.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// A collection targeted by `create_collection` already exists.
    #[error("Namespace already exists: {name}")]
    #[non_exhaustive]
    AlreadyExists { name: String },
}

/// The broad classification of an [`Error`], exposed via [`Error::category`].
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Network,
    Timeout,
    DuplicateKey,
    Write,
    WriteConcern,
    Authentication,
    Connection,
    Transaction,
    TransientTransaction,
    UnknownCommitResult,
    InvalidConcern,
    InvalidArgument,
    BulkWrite,
    Framing,
    ReceiveTimeout,
    Transport,
    Command,
    InvalidResponse,
    AlreadyExists,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "E{} {}: {}", self.code, self.code_name, self.message)
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(alias = "errmsg", default)]
    pub message: String,
}

/// An error that occurred during a write operation that wasn't due to being
/// unable to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code. The server omits this in some
    /// cases, hence the `Option`.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An individual write error inside a multi-document write, tagged with the
/// index of the offending document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct IndexedWriteError {
    /// Index into the list of documents that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// The set of errors that occurred during a bulk write, along with the partial
/// result accumulated before the failure.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// The per-document errors that occurred.
    pub write_errors: Vec<IndexedWriteError>,

    /// The error that occurred on account of a write concern failure, if any.
    pub write_concern_error: Option<WriteConcernError>,

    /// The documents that were inserted before the failure, keyed by their
    /// position in the caller's input.
    pub inserted: HashMap<usize, Document>,
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write
    /// concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to
    /// being unable to satisfy a write concern.
    WriteError(WriteError),
}

impl WriteFailure {
    pub(crate) fn code(&self) -> i32 {
        match self {
            Self::WriteConcernError(e) => e.code,
            Self::WriteError(e) => e.code,
        }
    }
}

pub(crate) fn extract_error_labels(doc: &Document) -> Vec<String> {
    match doc.get_array("errorLabels") {
        Ok(labels) => labels
            .iter()
            .filter_map(Bson::as_str)
            .map(String::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}
