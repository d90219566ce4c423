//! A blocking API over the asynchronous client.
//!
//! [`Client`] wraps [`crate::Client`] and drives it on a private
//! current-thread runtime, one OS thread per connection. Connections are
//! constructed in [`ConnectionMode::Blocking`](crate::options::ConnectionMode),
//! whose receive loop backs off from 100 µs up to 10 ms on empty reads.

use crate::{
    bson::{Document, Timestamp},
    conn::ConnectionInfo,
    error::Result,
    options::{
        AggregateOptions,
        ClientOptions,
        CommandOptions,
        ConnectionMode,
        CountOptions,
        CreateCollectionOptions,
        DeleteOptions,
        FindAndModifyOptions,
        FindOptions,
        GetMoreOptions,
        IndexModel,
        InsertManyOptions,
        InsertOptions,
        SessionOptions,
        TransactionOptions,
        UpdateModel,
        UpdateOptions,
    },
    session::{ClusterTime, Session, TransactionState},
};

/// A blocking MongoDB wire-protocol client.
///
/// Like the async client, a single instance serves one caller at a time;
/// every operation takes `&mut self` and blocks until the server responds.
#[derive(Debug)]
pub struct Client {
    inner: crate::Client,
    runtime: tokio::runtime::Runtime,
}

impl Client {
    /// Creates an unconnected blocking client. The connection mode is forced
    /// to `Blocking` regardless of the supplied options.
    pub fn new(mut options: ClientOptions) -> Result<Self> {
        options.mode = ConnectionMode::Blocking;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(crate::error::Error::from)?;
        Ok(Self {
            inner: crate::Client::new(options)?,
            runtime,
        })
    }

    /// See [`crate::Client::connect`].
    pub fn connect(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.connect())
    }

    /// See [`crate::Client::close`].
    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close())
    }

    /// See [`crate::Client::is_replica_set`].
    pub fn is_replica_set(&mut self) -> Result<bool> {
        self.runtime.block_on(self.inner.is_replica_set())
    }

    /// See [`crate::Client::connection_info`].
    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    /// See [`crate::Client::run_command`].
    pub fn run_command(&mut self, db: &str, command: Document) -> Result<Document> {
        self.runtime.block_on(self.inner.run_command(db, command))
    }

    /// See [`crate::Client::list_database_names`].
    pub fn list_database_names(&mut self) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.list_database_names())
    }

    /// See [`crate::Client::drop_database`].
    pub fn drop_database(&mut self, options: Option<CommandOptions>) -> Result<bool> {
        self.runtime.block_on(self.inner.drop_database(options))
    }

    /// See [`crate::Client::create_collection`].
    pub fn create_collection(
        &mut self,
        name: &str,
        options: Option<CreateCollectionOptions>,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.create_collection(name, options))
    }

    /// See [`crate::Client::drop_collection`].
    pub fn drop_collection(&mut self, name: &str, options: Option<CommandOptions>) -> Result<bool> {
        self.runtime
            .block_on(self.inner.drop_collection(name, options))
    }

    /// See [`crate::Client::list_collection_names`].
    pub fn list_collection_names(&mut self) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.list_collection_names())
    }

    /// See [`crate::Client::insert`].
    pub fn insert(
        &mut self,
        collection: &str,
        document: Document,
        options: Option<InsertOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.insert(collection, document, options))
    }

    /// See [`crate::Client::insert_many`].
    pub fn insert_many(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
        options: Option<InsertManyOptions>,
    ) -> Result<Vec<Document>> {
        self.runtime
            .block_on(self.inner.insert_many(collection, documents, options))
    }

    /// See [`crate::Client::update`].
    pub fn update(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        options: Option<UpdateOptions>,
    ) -> Result<i64> {
        self.runtime
            .block_on(self.inner.update(collection, filter, update, options))
    }

    /// See [`crate::Client::upsert`].
    pub fn upsert(
        &mut self,
        collection: &str,
        operations: Vec<UpdateModel>,
        options: Option<UpdateOptions>,
    ) -> Result<i64> {
        self.runtime
            .block_on(self.inner.upsert(collection, operations, options))
    }

    /// See [`crate::Client::find`].
    pub fn find(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.find(collection, filter, options))
    }

    /// See [`crate::Client::last_document`].
    pub fn last_document(&mut self, collection: &str) -> Result<Option<Document>> {
        self.runtime.block_on(self.inner.last_document(collection))
    }

    /// See [`crate::Client::aggregate`].
    pub fn aggregate(
        &mut self,
        collection: &str,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.aggregate(collection, pipeline, options))
    }

    /// See [`crate::Client::find_and_modify`].
    pub fn find_and_modify(
        &mut self,
        collection: &str,
        query: Document,
        options: Option<FindAndModifyOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.find_and_modify(collection, query, options))
    }

    /// See [`crate::Client::delete`].
    pub fn delete(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<DeleteOptions>,
    ) -> Result<i64> {
        self.runtime
            .block_on(self.inner.delete(collection, filter, options))
    }

    /// See [`crate::Client::count`].
    pub fn count(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<CountOptions>,
    ) -> Result<i64> {
        self.runtime
            .block_on(self.inner.count(collection, filter, options))
    }

    /// See [`crate::Client::get_more`].
    pub fn get_more(
        &mut self,
        collection: &str,
        cursor_id: i64,
        options: Option<GetMoreOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.get_more(collection, cursor_id, options))
    }

    /// See [`crate::Client::create_indexes`].
    pub fn create_indexes(
        &mut self,
        collection: &str,
        indexes: Vec<IndexModel>,
        options: Option<CommandOptions>,
    ) -> Result<Document> {
        self.runtime
            .block_on(self.inner.create_indexes(collection, indexes, options))
    }

    /// See [`crate::Client::drop_indexes`].
    pub fn drop_indexes(
        &mut self,
        collection: &str,
        index: Option<&str>,
        options: Option<CommandOptions>,
    ) -> Result<bool> {
        self.runtime
            .block_on(self.inner.drop_indexes(collection, index, options))
    }

    /// See [`crate::Client::start_session`].
    pub fn start_session(&mut self, options: Option<SessionOptions>) -> Result<Session> {
        self.runtime.block_on(self.inner.start_session(options))
    }

    /// See [`crate::Client::start_transaction`].
    pub fn start_transaction(
        &mut self,
        session: &Session,
        options: Option<TransactionOptions>,
    ) -> Result<()> {
        self.inner.start_transaction(session, options)
    }

    /// See [`crate::Client::commit_transaction`].
    pub fn commit_transaction(&mut self, session: &Session) -> Result<()> {
        self.runtime.block_on(self.inner.commit_transaction(session))
    }

    /// See [`crate::Client::abort_transaction`].
    pub fn abort_transaction(&mut self, session: &Session) -> Result<()> {
        self.runtime.block_on(self.inner.abort_transaction(session))
    }

    /// Runs the callback inside a transaction, retrying transient failures
    /// and unknown commit results the same way
    /// [`crate::Client::with_transaction`] does.
    pub fn with_transaction<R, F>(
        &mut self,
        session: &Session,
        options: Option<TransactionOptions>,
        mut callback: F,
    ) -> Result<R>
    where
        F: FnMut(&mut Client, &Session) -> Result<R>,
    {
        let max_retries = options.as_ref().and_then(|o| o.max_retries).unwrap_or(3);
        let retry_delay = options
            .as_ref()
            .and_then(|o| o.retry_delay)
            .unwrap_or(std::time::Duration::from_millis(100));

        let mut attempt = 0;
        'transaction: loop {
            attempt += 1;
            self.start_transaction(session, options.clone())?;

            let value = match callback(self, session) {
                Ok(value) => value,
                Err(err) => {
                    if self.in_open_transaction(session) {
                        let _ = self.abort_transaction(session);
                    }
                    if err.is_transient_transaction_error() {
                        if attempt < max_retries {
                            std::thread::sleep(retry_delay);
                            continue 'transaction;
                        }
                        return Err(crate::error::Error::transaction(
                            "transaction exceeded maximum retries",
                        ));
                    }
                    return Err(err);
                }
            };

            if !self.in_open_transaction(session) {
                return Ok(value);
            }

            let mut commit_attempts = 0;
            'commit: loop {
                commit_attempts += 1;
                match self.commit_transaction(session) {
                    Ok(()) => return Ok(value),
                    Err(err) => {
                        if err.is_unknown_transaction_commit_result() && commit_attempts < 3 {
                            continue 'commit;
                        }
                        if err.is_transient_transaction_error() {
                            if self.in_open_transaction(session) {
                                let _ = self.abort_transaction(session);
                            }
                            if attempt < max_retries {
                                std::thread::sleep(retry_delay);
                                continue 'transaction;
                            }
                            return Err(crate::error::Error::transaction(
                                "transaction exceeded maximum retries",
                            ));
                        }
                        return Err(err);
                    }
                }
            }
        }
    }

    /// See [`crate::Client::end_sessions`].
    pub fn end_sessions(&mut self, sessions: &[Session]) -> Result<()> {
        self.runtime.block_on(self.inner.end_sessions(sessions))
    }

    /// See [`crate::Client::session_state`].
    pub fn session_state(&self, session: &Session) -> Option<TransactionState> {
        self.inner.session_state(session)
    }

    /// See [`crate::Client::get_operation_time`].
    pub fn get_operation_time(&self) -> Option<Timestamp> {
        self.inner.get_operation_time()
    }

    /// See [`crate::Client::get_cluster_time`].
    pub fn get_cluster_time(&self) -> Option<&ClusterTime> {
        self.inner.get_cluster_time()
    }

    fn in_open_transaction(&self, session: &Session) -> bool {
        matches!(
            self.session_state(session),
            Some(TransactionState::Starting | TransactionState::InProgress)
        )
    }
}
