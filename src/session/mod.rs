mod cluster_time;

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp},
    error::{Error, Result},
    options::TransactionOptions,
};

pub use cluster_time::ClusterTime;

/// Sessions idle longer than this are garbage-collected, matching the
/// server's default logical session timeout.
pub(crate) const STALE_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A handle to a server-assigned logical session, returned by
/// [`Client::start_session`](crate::Client::start_session).
///
/// The handle is a cheap identifier; all session state (transaction state,
/// transaction number, last use) lives in the owning client's registry and
/// ends with the client. Pass a clone of the handle in operation options to
/// run an operation under the session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    bytes: Vec<u8>,
}

impl Session {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The hex-encoded bytes of the session's UUID, also the key under which
    /// the owning client tracks it.
    pub fn id_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// The `lsid` document attached to commands run under this session.
    pub(crate) fn lsid(&self) -> Document {
        doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: self.bytes.clone(),
            }
        }
    }
}

/// The transaction state of a session, as reported by
/// [`Client::session_state`](crate::Client::session_state).
///
/// `Starting` covers the window between `start_transaction` and the
/// transaction's first operation: the first command sent in that window
/// carries `startTransaction: true` and moves the state to `InProgress`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransactionState {
    /// No transaction has been started on the session.
    None,

    /// A transaction is open but no operation has been sent yet.
    Starting,

    /// A transaction is open and its first operation has been sent.
    InProgress,

    /// The last transaction committed. A new one may be started.
    Committed,

    /// The last transaction aborted. A new one may be started.
    Aborted,
}

/// The client-side record of a server session.
#[derive(Debug)]
pub(crate) struct ServerSession {
    pub(crate) state: TransactionState,

    /// A monotonically non-decreasing transaction number, incremented exactly
    /// once per `start_transaction`.
    pub(crate) txn_number: i64,

    /// The last time an operation ran under this session.
    pub(crate) last_use: Instant,

    /// The options of the open transaction, injected into its first
    /// operation.
    pub(crate) transaction_options: Option<TransactionOptions>,

    /// The fallback options for transactions started without their own.
    pub(crate) default_transaction_options: Option<TransactionOptions>,

    pub(crate) causal_consistency: bool,
}

impl ServerSession {
    fn new(
        causal_consistency: bool,
        default_transaction_options: Option<TransactionOptions>,
    ) -> Self {
        Self {
            state: TransactionState::None,
            txn_number: 0,
            last_use: Instant::now(),
            transaction_options: None,
            default_transaction_options,
            causal_consistency,
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Opens a transaction: bumps the transaction number and arms the
    /// `Starting` state. No network traffic happens here; the server learns
    /// of the transaction from the first operation run under it.
    pub(crate) fn start_transaction(&mut self, options: Option<TransactionOptions>) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::transaction("transaction already in progress"));
        }
        self.txn_number += 1;
        self.state = TransactionState::Starting;
        self.transaction_options = options;
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        self.state = TransactionState::Committed;
        self.transaction_options = None;
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.transaction_options = None;
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }
}

/// The table of active sessions, keyed by the hex-encoded UUID bytes of the
/// server-assigned `lsid`. Owned by the client; mutated only on the caller's
/// task, so no locking is involved.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<String, ServerSession>,
}

impl SessionRegistry {
    pub(crate) fn insert(
        &mut self,
        id_bytes: Vec<u8>,
        causal_consistency: bool,
        default_transaction_options: Option<TransactionOptions>,
    ) -> Session {
        let session = Session::from_bytes(id_bytes);
        self.sessions.insert(
            session.id_hex(),
            ServerSession::new(causal_consistency, default_transaction_options),
        );
        session
    }

    pub(crate) fn get(&self, session: &Session) -> Option<&ServerSession> {
        self.sessions.get(&session.id_hex())
    }

    pub(crate) fn get_mut(&mut self, session: &Session) -> Result<&mut ServerSession> {
        self.sessions.get_mut(&session.id_hex()).ok_or_else(|| {
            Error::invalid_argument("the session has ended or does not belong to this client")
        })
    }

    pub(crate) fn remove(&mut self, session: &Session) -> Option<ServerSession> {
        self.sessions.remove(&session.id_hex())
    }

    /// Drops sessions that have been idle past the timeout, returning the
    /// hex keys of the removed entries.
    pub(crate) fn cleanup_stale(&mut self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_use) > max_idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.sessions.remove(key);
        }
        stale
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, ServerSession)> {
        self.sessions.drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// The connection-global causal consistency watermarks. Only the most recent
/// value of each is retained; both are cleared when the client closes.
#[derive(Debug, Default)]
pub(crate) struct CausalTimes {
    pub(crate) operation_time: Option<Timestamp>,
    pub(crate) cluster_time: Option<ClusterTime>,
}

impl CausalTimes {
    /// Advances the operation time if the provided timestamp is later than
    /// the recorded one. Stale values are discarded.
    pub(crate) fn advance_operation_time(&mut self, ts: Timestamp) {
        let newer = match self.operation_time {
            Some(current) => (current.time, current.increment) < (ts.time, ts.increment),
            None => true,
        };
        if newer {
            self.operation_time = Some(ts);
        }
    }

    /// Advances the cluster time if the provided one is greater.
    pub(crate) fn advance_cluster_time(&mut self, ct: ClusterTime) {
        if self.cluster_time.as_ref().map(|current| *current < ct).unwrap_or(true) {
            self.cluster_time = Some(ct);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.operation_time = None;
        self.cluster_time = None;
    }
}
