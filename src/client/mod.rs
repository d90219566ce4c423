pub(crate) mod executor;
#[cfg(test)]
mod test;

use std::{collections::HashMap, time::Duration};

use uuid::Uuid;

use crate::{
    auth::{self, Credential},
    bson::{doc, Bson, Document, Timestamp},
    bson_util,
    command::Command,
    conn::{Connection, ConnectionInfo},
    error::{BulkWriteError, Error, ErrorKind, Result},
    options::{
        AggregateOptions,
        ClientOptions,
        CommandOptions,
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
    results::CursorBody,
    session::{
        CausalTimes,
        ClusterTime,
        Session,
        SessionRegistry,
        TransactionState,
        STALE_SESSION_TIMEOUT,
    },
    BoxFuture,
};

use executor::Reply;

/// How many times a `commitTransaction` is retried inside
/// [`Client::with_transaction`] when the outcome is unknown.
const MAX_COMMIT_RETRIES: u32 = 3;

const DEFAULT_TRANSACTION_RETRIES: u32 = 3;
const DEFAULT_TRANSACTION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A native MongoDB wire-protocol client over a single TCP connection.
///
/// The connection is a critical section: one request/response round trip is
/// in flight at a time, which the API enforces by taking `&mut self` on every
/// operation. `connect` opens the socket and runs the SCRAM handshake;
/// `close` ends all tracked sessions and drops the socket, after which the
/// client is not reusable.
#[derive(Debug)]
pub struct Client {
    options: ClientOptions,
    conn: Connection,
    sessions: SessionRegistry,
    times: CausalTimes,
    replica_set: Option<bool>,
    closed: bool,
}

impl Client {
    /// Creates an unconnected client, validating the options: database, host,
    /// username, and password must be non-empty, and the port must be within
    /// `[1, 65535]`.
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let conn = Connection::new(options.host.clone(), options.port as u16, options.mode);
        Ok(Self {
            options,
            conn,
            sessions: SessionRegistry::default(),
            times: CausalTimes::default(),
            replica_set: None,
            closed: false,
        })
    }

    /// Opens the TCP connection and authenticates with SCRAM. A transport
    /// failure during the handshake surfaces as a `Connection` error; a
    /// server rejection surfaces as an `Authentication` error.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_not_closed()?;
        self.conn.connect().await?;

        let credential = Credential {
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            source: "admin".to_string(),
        };

        match auth::authenticate_stream(&mut self.conn, &credential, &self.options.mechanism).await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.conn.close();
                if matches!(
                    err.kind.as_ref(),
                    ErrorKind::Io(_)
                        | ErrorKind::Transport { .. }
                        | ErrorKind::ReceiveTimeout { .. }
                        | ErrorKind::Framing { .. }
                ) {
                    return Err(ErrorKind::Connection {
                        message: format!("transport failure during authentication: {}", err),
                    }
                    .into());
                }
                Err(err)
            }
        }
    }

    /// Ends all tracked sessions (best effort; failures are swallowed since
    /// the socket may already be gone), drops the socket, and clears the
    /// causal-consistency watermarks. The client is not reusable afterwards.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut lsids = Vec::new();
        for (key, session) in self.sessions.drain() {
            if session.in_transaction() {
                tracing::warn!(
                    target: "mongolite::command",
                    session = %key,
                    "ending a session with a transaction still in progress"
                );
            }
            if let Ok(bytes) = hex::decode(&key) {
                lsids.push(Bson::Document(Session::from_bytes(bytes).lsid()));
            }
        }

        if !lsids.is_empty() && self.conn.is_connected() {
            let command = Command::new(
                "endSessions",
                "admin",
                doc! { "endSessions": lsids },
            );
            let _ = self.conn.run_command(command.into_document()).await;
        }

        self.conn.close();
        self.times.clear();
    }

    /// Whether the server is a replica set member. Detected lazily with one
    /// `isMaster` command and cached; transaction operations are not
    /// pre-filtered on the result, the server rejects them itself on a
    /// standalone.
    pub async fn is_replica_set(&mut self) -> Result<bool> {
        if let Some(replica_set) = self.replica_set {
            return Ok(replica_set);
        }
        let command = Command::new("isMaster", "admin", doc! { "isMaster": 1 });
        let reply = self.execute(command, None).await?.into_document()?;
        let replica_set = reply.contains_key("setName") || reply.contains_key("hosts");
        self.replica_set = Some(replica_set);
        Ok(replica_set)
    }

    /// A snapshot of the connection's identity and state.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.conn.id.clone(),
            address: self.conn.address(),
            connected: !self.closed && self.conn.is_connected(),
            replica_set: self.replica_set,
        }
    }

    /// Runs an arbitrary command against the given database, applying the
    /// same injection and interpretation pipeline as the built-in operations.
    /// The command verb must be the document's first key.
    pub async fn run_command(&mut self, db: &str, command: Document) -> Result<Document> {
        let name = match command.iter().next() {
            Some((key, _)) => key.clone(),
            None => return Err(Error::invalid_argument("command document must not be empty")),
        };
        let command = Command::new(name, db, command);
        self.execute(command, None).await?.into_document()
    }

    // ------------------------------------------------------------------
    // Databases and collections
    // ------------------------------------------------------------------

    /// Lists the names of the databases on the server.
    pub async fn list_database_names(&mut self) -> Result<Vec<String>> {
        let command = Command::new(
            "listDatabases",
            "admin",
            doc! { "listDatabases": 1, "nameOnly": true },
        );
        let reply = self.execute(command, None).await?.into_document()?;
        let databases = reply
            .get_array("databases")
            .map_err(|_| Error::invalid_response("listDatabases reply missing `databases`"))?;
        Ok(databases
            .iter()
            .filter_map(Bson::as_document)
            .filter_map(|spec| spec.get_str("name").ok())
            .map(String::from)
            .collect())
    }

    /// Drops the client's database. Returns whether the server acknowledged
    /// with `ok == 1.0`.
    pub async fn drop_database(&mut self, options: Option<CommandOptions>) -> Result<bool> {
        let options = options.unwrap_or_default();
        let mut command = Command::new(
            "dropDatabase",
            self.options.database.clone(),
            doc! { "dropDatabase": 1 },
        );
        self.apply_command_options(&mut command, &options)?;
        let reply = self.execute(command, options.session.as_ref()).await?;
        Self::reply_ok(reply)
    }

    /// Creates a collection, failing with an `AlreadyExists` error when a
    /// collection of that name exists.
    pub async fn create_collection(
        &mut self,
        name: &str,
        options: Option<CreateCollectionOptions>,
    ) -> Result<bool> {
        let options = options.unwrap_or_default();

        let existing = self.list_collections(doc! { "name": name }).await?;
        if !existing.is_empty() {
            return Err(ErrorKind::AlreadyExists {
                name: name.to_string(),
            }
            .into());
        }

        let mut command = Command::new(
            "create",
            self.options.database.clone(),
            doc! { "create": name },
        );
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        let reply = self.execute(command, options.session.as_ref()).await?;
        Self::reply_ok(reply)
    }

    /// Drops a collection. Returns whether the server acknowledged with
    /// `ok == 1.0`.
    pub async fn drop_collection(
        &mut self,
        name: &str,
        options: Option<CommandOptions>,
    ) -> Result<bool> {
        let options = options.unwrap_or_default();
        let mut command = Command::new(
            "drop",
            self.options.database.clone(),
            doc! { "drop": name },
        );
        self.apply_command_options(&mut command, &options)?;
        let reply = self.execute(command, options.session.as_ref()).await?;
        Self::reply_ok(reply)
    }

    /// Lists the names of the collections in the client's database.
    pub async fn list_collection_names(&mut self) -> Result<Vec<String>> {
        let collections = self.list_collections(Document::new()).await?;
        Ok(collections
            .iter()
            .filter_map(|spec| spec.get_str("name").ok())
            .map(String::from)
            .collect())
    }

    async fn list_collections(&mut self, filter: Document) -> Result<Vec<Document>> {
        let mut body = doc! { "listCollections": 1, "nameOnly": true };
        if !filter.is_empty() {
            body.insert("filter", filter);
        }
        let command = Command::new("listCollections", self.options.database.clone(), body);
        let reply = self.execute(command, None).await?.into_document()?;
        Ok(CursorBody::from_document(reply)?.cursor.first_batch)
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Inserts a single document, generating a UUID v7 string `_id` when the
    /// document has none, and returns the document as inserted.
    pub async fn insert(
        &mut self,
        collection: &str,
        document: Document,
        options: Option<InsertOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();
        let document = prepare_document(document);

        let mut command = Command::new(
            "insert",
            self.options.database.clone(),
            doc! { "insert": collection, "documents": [document.clone()] },
        );
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }

        self.execute(command, options.session.as_ref())
            .await?
            .into_count()?;
        Ok(document)
    }

    /// Inserts many documents in batches, returning every prepared document.
    ///
    /// With `ordered` (the default) the server stops at the first failing
    /// document and the remaining batches are not attempted. Failures raise a
    /// `BulkWrite` error carrying the write errors, re-indexed against the
    /// caller's input, and the documents inserted before the failure.
    pub async fn insert_many(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
        options: Option<InsertManyOptions>,
    ) -> Result<Vec<Document>> {
        let options = options.unwrap_or_default();
        let ordered = options.ordered();
        let batch_size = options.batch_size();
        let prepared: Vec<Document> = documents.into_iter().map(prepare_document).collect();

        let mut inserted: HashMap<usize, Document> = HashMap::new();
        for (batch_index, batch) in prepared.chunks(batch_size).enumerate() {
            let offset = batch_index * batch_size;
            let mut command = Command::new(
                "insert",
                self.options.database.clone(),
                doc! {
                    "insert": collection,
                    "documents": batch.to_vec(),
                    "ordered": ordered,
                },
            );
            if let Some(ref write_concern) = options.write_concern {
                command.set_write_concern(write_concern)?;
            }
            if let Some(ref extra) = options.extra {
                command.append_extra(extra);
            }

            match self.execute(command, options.session.as_ref()).await {
                Ok(_) => {
                    for (i, document) in batch.iter().enumerate() {
                        inserted.insert(offset + i, document.clone());
                    }
                }
                Err(err) => {
                    let failed: Vec<usize> = err
                        .write_errors()
                        .map(|errors| errors.iter().map(|e| e.index).collect())
                        .unwrap_or_default();
                    // Everything in the failed batch up to (unordered: except)
                    // the reported failures made it in.
                    for (i, document) in batch.iter().enumerate() {
                        let past_failure = ordered
                            && failed.first().map(|first| i >= *first).unwrap_or(false);
                        if !failed.contains(&i) && !past_failure {
                            inserted.insert(offset + i, document.clone());
                        }
                    }
                    let write_errors = err
                        .write_errors()
                        .map(|errors| {
                            errors
                                .iter()
                                .map(|e| {
                                    let mut e = e.clone();
                                    e.index += offset;
                                    e
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    let bulk_error = BulkWriteError {
                        write_errors,
                        write_concern_error: err.write_concern_error().cloned(),
                        inserted,
                    };
                    return Err(Error::new(
                        ErrorKind::BulkWrite(bulk_error),
                        Some(err.labels().iter().cloned().collect::<Vec<_>>()),
                    )
                    .with_operation("insert"));
                }
            }
        }

        Ok(prepared)
    }

    /// Updates documents matching the filter, returning the server's `n`.
    pub async fn update(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        options: Option<UpdateOptions>,
    ) -> Result<i64> {
        let options = options.unwrap_or_default();
        let entry = doc! {
            "q": filter,
            "u": update,
            "multi": options.multi.unwrap_or(false),
            "upsert": options.upsert.unwrap_or(false),
        };
        let mut command = Command::new(
            "update",
            self.options.database.clone(),
            doc! { "update": collection, "updates": [entry] },
        );
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_count()
    }

    /// Applies a batch of updates with `upsert` forced on for every entry,
    /// returning the server's `n`.
    pub async fn upsert(
        &mut self,
        collection: &str,
        operations: Vec<UpdateModel>,
        options: Option<UpdateOptions>,
    ) -> Result<i64> {
        let options = options.unwrap_or_default();
        let updates: Vec<Document> = operations
            .into_iter()
            .map(|op| {
                doc! {
                    "q": op.filter,
                    "u": op.update,
                    "multi": op.multi.unwrap_or(false),
                    "upsert": true,
                }
            })
            .collect();
        let mut command = Command::new(
            "update",
            self.options.database.clone(),
            doc! { "update": collection, "updates": updates },
        );
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_count()
    }

    /// Finds documents matching the filter, returning the raw cursor
    /// response. Deserialize it with
    /// [`CursorBody::from_document`](crate::results::CursorBody::from_document)
    /// for typed access to the first batch.
    pub async fn find(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();
        bson_util::normalize_logical_operators(&filter)?;

        let mut body = doc! { "find": collection };
        if !filter.is_empty() {
            body.insert("filter", filter);
        }
        if let Some(ref sort) = options.sort {
            body.insert("sort", sort.clone());
        }
        if let Some(ref projection) = options.projection {
            body.insert("projection", projection.clone());
        }
        if let Some(limit) = options.limit {
            body.insert("limit", limit);
        }
        if let Some(skip) = options.skip {
            body.insert("skip", skip);
        }
        if let Some(batch_size) = options.batch_size {
            body.insert("batchSize", batch_size);
        }
        if let Some(max_time_ms) = options.max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }

        let mut command = Command::new("find", self.options.database.clone(), body);
        if let Some(ref read_concern) = options.read_concern {
            command.set_read_concern(read_concern);
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_document()
    }

    /// The most recent document of a collection by descending `_id`, if the
    /// collection is non-empty.
    pub async fn last_document(&mut self, collection: &str) -> Result<Option<Document>> {
        let options = FindOptions::builder()
            .sort(doc! { "_id": -1 })
            .limit(1)
            .build();
        let reply = self.find(collection, Document::new(), Some(options)).await?;
        let mut body = CursorBody::from_document(reply)?;
        Ok(if body.cursor.first_batch.is_empty() {
            None
        } else {
            Some(body.cursor.first_batch.remove(0))
        })
    }

    /// Runs an aggregation pipeline, returning the raw cursor response. The
    /// command always carries a `cursor` field as the server requires.
    pub async fn aggregate(
        &mut self,
        collection: &str,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();

        let cursor = match options.batch_size {
            Some(batch_size) => doc! { "batchSize": batch_size },
            None => Document::new(),
        };
        let mut body = doc! {
            "aggregate": collection,
            "pipeline": pipeline,
            "cursor": cursor,
        };
        if let Some(max_time_ms) = options.max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }

        let mut command = Command::new("aggregate", self.options.database.clone(), body);
        if let Some(ref read_concern) = options.read_concern {
            command.set_read_concern(read_concern);
        }
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_document()
    }

    /// Atomically modifies and returns a single document.
    pub async fn find_and_modify(
        &mut self,
        collection: &str,
        query: Document,
        options: Option<FindAndModifyOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();

        let mut body = doc! { "findAndModify": collection, "query": query };
        if let Some(ref sort) = options.sort {
            body.insert("sort", sort.clone());
        }
        if let Some(ref update) = options.update {
            body.insert("update", update.clone());
        }
        if options.remove.unwrap_or(false) {
            body.insert("remove", true);
        }
        if let Some(new) = options.new {
            body.insert("new", new);
        }
        if let Some(ref fields) = options.fields {
            body.insert("fields", fields.clone());
        }
        if let Some(upsert) = options.upsert {
            body.insert("upsert", upsert);
        }
        if let Some(max_time_ms) = options.max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }

        let mut command = Command::new("findAndModify", self.options.database.clone(), body);
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_document()
    }

    /// Deletes documents matching the filter, returning the server's `n`.
    pub async fn delete(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<DeleteOptions>,
    ) -> Result<i64> {
        let options = options.unwrap_or_default();
        let limit = if options.many.unwrap_or(true) { 0 } else { 1 };
        let mut command = Command::new(
            "delete",
            self.options.database.clone(),
            doc! {
                "delete": collection,
                "deletes": [ { "q": filter, "limit": limit } ],
            },
        );
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_count()
    }

    /// Counts documents matching the filter. Server failures surface as
    /// errors rather than a zero count.
    pub async fn count(
        &mut self,
        collection: &str,
        filter: Document,
        options: Option<CountOptions>,
    ) -> Result<i64> {
        let options = options.unwrap_or_default();
        let mut body = doc! { "count": collection };
        if !filter.is_empty() {
            body.insert("query", filter);
        }
        if let Some(max_time_ms) = options.max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }

        let mut command = Command::new("count", self.options.database.clone(), body);
        if let Some(ref read_concern) = options.read_concern {
            command.set_read_concern(read_concern);
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_count()
    }

    /// Fetches the next batch of an open cursor. `getMore` never carries a
    /// read concern.
    pub async fn get_more(
        &mut self,
        collection: &str,
        cursor_id: i64,
        options: Option<GetMoreOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();
        let mut body = doc! { "getMore": cursor_id, "collection": collection };
        if let Some(batch_size) = options.batch_size {
            body.insert("batchSize", batch_size);
        }
        if let Some(max_time_ms) = options.max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }

        let mut command = Command::new("getMore", self.options.database.clone(), body);
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        self.execute(command, options.session.as_ref())
            .await?
            .into_document()
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Creates the given indexes. An index declared `unique` without a
    /// `partialFilterExpression` additionally gets `sparse: true`, preserving
    /// the long-standing workaround for incomplete unique indexes.
    pub async fn create_indexes(
        &mut self,
        collection: &str,
        indexes: Vec<IndexModel>,
        options: Option<CommandOptions>,
    ) -> Result<Document> {
        let options = options.unwrap_or_default();
        let specs: Vec<Document> = indexes.into_iter().map(index_spec).collect();

        let mut command = Command::new(
            "createIndexes",
            self.options.database.clone(),
            doc! { "createIndexes": collection, "indexes": specs },
        );
        self.apply_command_options(&mut command, &options)?;
        self.execute(command, options.session.as_ref())
            .await?
            .into_document()
    }

    /// Drops the named index, or all indexes when `index` is `None`.
    pub async fn drop_indexes(
        &mut self,
        collection: &str,
        index: Option<&str>,
        options: Option<CommandOptions>,
    ) -> Result<bool> {
        let options = options.unwrap_or_default();
        let mut command = Command::new(
            "dropIndexes",
            self.options.database.clone(),
            doc! { "dropIndexes": collection, "index": index.unwrap_or("*") },
        );
        self.apply_command_options(&mut command, &options)?;
        let reply = self.execute(command, options.session.as_ref()).await?;
        Self::reply_ok(reply)
    }

    // ------------------------------------------------------------------
    // Sessions and transactions
    // ------------------------------------------------------------------

    /// Starts a server session and registers it with the client. Sessions
    /// idle past thirty minutes are garbage-collected here before the new
    /// one is requested.
    pub async fn start_session(&mut self, options: Option<SessionOptions>) -> Result<Session> {
        for key in self.sessions.cleanup_stale(STALE_SESSION_TIMEOUT) {
            tracing::debug!(
                target: "mongolite::command",
                session = %key,
                "garbage-collected a stale session"
            );
        }

        let options = options.unwrap_or_default();
        let causal_consistency = options.causal_consistency.unwrap_or(true);

        let mut body = doc! { "startSession": 1 };
        if options.causal_consistency.is_some() {
            body.insert("options", doc! { "causalConsistency": causal_consistency });
        }
        let command = Command::new("startSession", "admin", body);
        let reply = self.execute(command, None).await?.into_document()?;

        let id_bytes = reply
            .get_document("id")
            .ok()
            .and_then(|lsid| lsid.get("id"))
            .and_then(|id| match id {
                Bson::Binary(binary) => Some(binary.bytes.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                Error::invalid_response("startSession reply missing binary `id.id`")
            })?;

        Ok(self.sessions.insert(
            id_bytes,
            causal_consistency,
            options.default_transaction_options,
        ))
    }

    /// Opens a transaction on the session. No network traffic happens here:
    /// the server learns of the transaction from the first operation run
    /// under the session, which carries `startTransaction: true`.
    pub fn start_transaction(
        &mut self,
        session: &Session,
        options: Option<TransactionOptions>,
    ) -> Result<()> {
        let entry = self.sessions.get_mut(session)?;
        let options = options.or_else(|| entry.default_transaction_options.clone());
        entry.start_transaction(options)
    }

    /// Commits the session's transaction.
    ///
    /// A transaction with no operations commits locally. Transient and
    /// unknown-commit-result failures leave the transaction open so the
    /// commit (or the whole transaction) can be retried; any other failure
    /// aborts it.
    pub async fn commit_transaction(&mut self, session: &Session) -> Result<()> {
        let entry = self.sessions.get_mut(session)?;
        match entry.state {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Aborted => Err(Error::transaction(
                "cannot call commitTransaction after calling abortTransaction",
            )),
            TransactionState::Committed => Ok(()),
            TransactionState::Starting => {
                entry.commit();
                Ok(())
            }
            TransactionState::InProgress => {
                let transaction_options = entry.transaction_options.clone();
                let mut body = doc! { "commitTransaction": 1 };
                if let Some(max_commit_time) = transaction_options
                    .as_ref()
                    .and_then(|options| options.max_commit_time)
                {
                    body.insert("maxTimeMS", max_commit_time.as_millis() as i64);
                }
                let mut command = Command::new("commitTransaction", "admin", body);
                if let Some(ref write_concern) = transaction_options
                    .as_ref()
                    .and_then(|options| options.write_concern.clone())
                {
                    command.set_write_concern(write_concern)?;
                }

                match self.execute(command, Some(session)).await {
                    Ok(_) => {
                        self.sessions.get_mut(session)?.commit();
                        Ok(())
                    }
                    Err(err) => {
                        if !err.is_transient_transaction_error()
                            && !err.is_unknown_transaction_commit_result()
                        {
                            self.sessions.get_mut(session)?.abort();
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Aborts the session's transaction. The state moves to `Aborted` even
    /// when the server cannot be told; errors from the `abortTransaction`
    /// command itself are logged and swallowed.
    pub async fn abort_transaction(&mut self, session: &Session) -> Result<()> {
        let entry = self.sessions.get_mut(session)?;
        match entry.state {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Committed => Err(Error::transaction(
                "cannot call abortTransaction after calling commitTransaction",
            )),
            TransactionState::Aborted => {
                Err(Error::transaction("cannot call abortTransaction twice"))
            }
            TransactionState::Starting => {
                entry.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = entry
                    .transaction_options
                    .as_ref()
                    .and_then(|options| options.write_concern.clone());
                let mut command =
                    Command::new("abortTransaction", "admin", doc! { "abortTransaction": 1 });
                if let Some(ref write_concern) = write_concern {
                    command.set_write_concern(write_concern)?;
                }

                let result = self.execute(command, Some(session)).await;
                self.sessions.get_mut(session)?.abort();
                if let Err(err) = result {
                    tracing::warn!(
                        target: "mongolite::command",
                        error = %err,
                        "ignoring abortTransaction failure"
                    );
                }
                Ok(())
            }
        }
    }

    /// Runs the callback inside a transaction, retrying transient failures.
    ///
    /// Per attempt the transaction is started, the callback runs, and the
    /// commit is retried up to three times when its outcome is unknown. A
    /// transient failure aborts and retries the whole transaction up to
    /// `max_retries` times (default 3) with `retry_delay` (default 100 ms)
    /// between attempts, after which a `Transaction` error is returned.
    pub async fn with_transaction<R, F>(
        &mut self,
        session: &Session,
        options: Option<TransactionOptions>,
        mut callback: F,
    ) -> Result<R>
    where
        F: for<'a> FnMut(&'a mut Client, &'a Session) -> BoxFuture<'a, Result<R>>,
    {
        let max_retries = options
            .as_ref()
            .and_then(|o| o.max_retries)
            .unwrap_or(DEFAULT_TRANSACTION_RETRIES);
        let retry_delay = options
            .as_ref()
            .and_then(|o| o.retry_delay)
            .unwrap_or(DEFAULT_TRANSACTION_RETRY_DELAY);

        let mut attempt = 0;
        'transaction: loop {
            attempt += 1;
            self.start_transaction(session, options.clone())?;

            let value = match callback(&mut *self, session).await {
                Ok(value) => value,
                Err(err) => {
                    if self.in_open_transaction(session) {
                        let _ = self.abort_transaction(session).await;
                    }
                    if err.is_transient_transaction_error() {
                        if attempt < max_retries {
                            tokio::time::sleep(retry_delay).await;
                            continue 'transaction;
                        }
                        return Err(Error::transaction("transaction exceeded maximum retries"));
                    }
                    return Err(err);
                }
            };

            // The callback may have committed or aborted on its own.
            if !self.in_open_transaction(session) {
                return Ok(value);
            }

            let mut commit_attempts = 0;
            'commit: loop {
                commit_attempts += 1;
                match self.commit_transaction(session).await {
                    Ok(()) => return Ok(value),
                    Err(err) => {
                        if err.is_unknown_transaction_commit_result()
                            && commit_attempts < MAX_COMMIT_RETRIES
                        {
                            continue 'commit;
                        }
                        if err.is_transient_transaction_error() {
                            if self.in_open_transaction(session) {
                                let _ = self.abort_transaction(session).await;
                            }
                            if attempt < max_retries {
                                tokio::time::sleep(retry_delay).await;
                                continue 'transaction;
                            }
                            return Err(Error::transaction(
                                "transaction exceeded maximum retries",
                            ));
                        }
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Ends the given sessions: removes them from the registry (warning when
    /// one still has a transaction in progress) and tells the server in one
    /// `endSessions` command.
    pub async fn end_sessions(&mut self, sessions: &[Session]) -> Result<()> {
        let mut lsids = Vec::new();
        for session in sessions {
            if let Some(entry) = self.sessions.remove(session) {
                if entry.in_transaction() {
                    tracing::warn!(
                        target: "mongolite::command",
                        session = %session.id_hex(),
                        "ending a session with a transaction still in progress"
                    );
                }
            }
            lsids.push(Bson::Document(session.lsid()));
        }
        if lsids.is_empty() {
            return Ok(());
        }

        let command = Command::new("endSessions", "admin", doc! { "endSessions": lsids });
        self.execute(command, None).await?;
        Ok(())
    }

    /// The transaction state of a session, or `None` when the session is not
    /// tracked by this client.
    pub fn session_state(&self, session: &Session) -> Option<TransactionState> {
        self.sessions.get(session).map(|entry| entry.state)
    }

    /// The most recent `operationTime` observed on this connection.
    pub fn get_operation_time(&self) -> Option<Timestamp> {
        self.times.operation_time
    }

    /// The most recent `$clusterTime` observed on this connection.
    pub fn get_cluster_time(&self) -> Option<&ClusterTime> {
        self.times.cluster_time.as_ref()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn in_open_transaction(&self, session: &Session) -> bool {
        matches!(
            self.session_state(session),
            Some(TransactionState::Starting | TransactionState::InProgress)
        )
    }

    fn apply_command_options(
        &self,
        command: &mut Command,
        options: &CommandOptions,
    ) -> Result<()> {
        if let Some(ref write_concern) = options.write_concern {
            command.set_write_concern(write_concern)?;
        }
        if let Some(ref extra) = options.extra {
            command.append_extra(extra);
        }
        Ok(())
    }

    fn reply_ok(reply: Reply) -> Result<bool> {
        Ok(match reply {
            Reply::Document(doc) => bson_util::response_ok(&doc),
            Reply::Count(_) => true,
            Reply::Batch(_) => false,
        })
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed {
            return Err(ErrorKind::Connection {
                message: "the client has been closed and cannot be reused".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// The single execution pipeline: injection, framing, one round trip,
    /// watermark recording, and interpretation.
    async fn execute(&mut self, mut command: Command, session: Option<&Session>) -> Result<Reply> {
        self.ensure_not_closed()?;
        if !self.conn.is_connected() {
            return Err(ErrorKind::Connection {
                message: "the client is not connected; call connect() first".to_string(),
            }
            .into());
        }

        executor::apply_session_fields(&mut command, &mut self.sessions, session, &self.times)?;
        let name = command.name.clone();
        tracing::debug!(
            target: "mongolite::command",
            command = %name,
            database = %command.target_db,
            "executing command"
        );

        let response = self
            .conn
            .run_command(command.into_document())
            .await
            .map_err(|err| err.with_operation(name.clone()))?;

        executor::record_response_times(&response, &mut self.times);
        executor::interpret_response(response).map_err(|err| err.with_operation(name))
    }
}

/// Generates a UUID v7 string `_id` for documents that lack one. An `_id`
/// that is null or an empty string counts as lacking.
fn prepare_document(mut document: Document) -> Document {
    let needs_id = match document.get("_id") {
        None | Some(Bson::Null) => true,
        Some(Bson::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if needs_id {
        document.insert("_id", Uuid::now_v7().to_string());
    }
    document
}

/// Builds the wire form of one index specification, applying the legacy
/// quirk: a unique index without a partial filter expression is also sparse.
fn index_spec(model: IndexModel) -> Document {
    let mut spec = doc! { "key": model.keys.clone() };
    let options = model.options.unwrap_or_default();
    if !options.contains_key("name") {
        spec.insert("name", bson_util::index_name_from_keys(&model.keys));
    }
    for (key, value) in &options {
        spec.insert(key.clone(), value.clone());
    }
    let unique = options.get_bool("unique").unwrap_or(false);
    if unique && !options.contains_key("partialFilterExpression") {
        spec.insert("sparse", true);
    }
    spec
}
