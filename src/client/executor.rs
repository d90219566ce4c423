use crate::{
    bson::{Bson, Document},
    bson_util,
    command::Command,
    error::{
        extract_error_labels,
        CommandError,
        Error,
        ErrorKind,
        IndexedWriteError,
        Result,
        WriteConcernError,
        WriteError,
        WriteFailure,
    },
    session::{CausalTimes, ClusterTime, Session, SessionRegistry, TransactionState},
};

/// The interpreted body of a successful response.
#[derive(Debug)]
pub(crate) enum Reply {
    /// The response's scalar `n` field, for write and count commands.
    Count(i64),

    /// The whole response document.
    Document(Document),

    /// The `cursor.firstBatch` fallback for responses with no `ok` marker.
    Batch(Vec<Document>),
}

impl Reply {
    pub(crate) fn into_count(self) -> Result<i64> {
        match self {
            Reply::Count(n) => Ok(n),
            Reply::Document(doc) => doc
                .get("n")
                .and_then(bson_util::get_int)
                .ok_or_else(|| Error::invalid_response("expected a scalar `n` in the response")),
            Reply::Batch(_) => Err(Error::invalid_response(
                "expected a scalar `n` in the response",
            )),
        }
    }

    pub(crate) fn into_document(self) -> Result<Document> {
        match self {
            Reply::Document(doc) => Ok(doc),
            Reply::Count(_) | Reply::Batch(_) => Err(Error::invalid_response(
                "expected a document response",
            )),
        }
    }
}

/// Attaches session, transaction, and causal-consistency fields to a command
/// immediately before framing.
///
/// This is the rule set that keeps the server from rejecting transaction
/// statements with `E72 InvalidOptions`: `startTransaction` goes out exactly
/// once per transaction, `readConcern` only on that first statement, and
/// `getMore`/`killCursors` never carry a read concern at all.
pub(crate) fn apply_session_fields(
    cmd: &mut Command,
    registry: &mut SessionRegistry,
    session: Option<&Session>,
    times: &CausalTimes,
) -> Result<()> {
    let mut in_transaction = false;
    let mut causal = true;

    if let Some(handle) = session {
        let entry = registry.get_mut(handle)?;
        entry.update_last_use();
        causal = entry.causal_consistency;
        cmd.set_session(handle.lsid());

        match entry.state {
            TransactionState::Starting => {
                in_transaction = true;
                cmd.set_txn_number(entry.txn_number);
                cmd.set_autocommit();
                cmd.set_start_transaction();

                // The transaction's options replace whatever concern the
                // operation itself carried.
                cmd.clear_read_concern();
                if let Some(options) = entry.transaction_options.clone() {
                    if let Some(ref read_concern) = options.read_concern {
                        cmd.set_read_concern(read_concern);
                    }
                    if let Some(ref write_concern) = options.write_concern {
                        cmd.set_write_concern(write_concern)?;
                    }
                }

                entry.state = TransactionState::InProgress;
            }
            TransactionState::InProgress => {
                in_transaction = true;
                cmd.set_txn_number(entry.txn_number);
                cmd.set_autocommit();
                cmd.clear_read_concern();
            }
            _ => {}
        }
    }

    if !in_transaction && causal {
        if let Some(operation_time) = times.operation_time {
            if !cmd.has_after_cluster_time() && !cmd.forbids_read_concern() {
                cmd.set_after_cluster_time(operation_time);
            }
        }
    }

    if cmd.in_transaction() && !cmd.starts_transaction() {
        cmd.clear_read_concern();
    }
    if cmd.forbids_read_concern() {
        cmd.clear_read_concern();
    }
    if let Some(ref cluster_time) = times.cluster_time {
        cmd.set_cluster_time(cluster_time);
    }

    Ok(())
}

/// Records `operationTime` and `$clusterTime` from a response body. Runs on
/// every response, before interpretation, so even failures advance the
/// watermarks.
pub(crate) fn record_response_times(doc: &Document, times: &mut CausalTimes) {
    if let Ok(operation_time) = doc.get_timestamp("operationTime") {
        times.advance_operation_time(operation_time);
    }
    if let Some(Bson::Document(cluster_time)) = doc.get("$clusterTime") {
        if let Ok(cluster_time) = crate::bson::from_document::<ClusterTime>(cluster_time.clone()) {
            times.advance_cluster_time(cluster_time);
        }
    }
}

/// Interprets a decoded response body, in order: write errors, top-level
/// errors, write concern failures, scalar `n` results, then whole-document
/// success, with `cursor.firstBatch` as the fallback.
pub(crate) fn interpret_response(doc: Document) -> Result<Reply> {
    let labels = extract_error_labels(&doc);

    if let Ok(write_errors) = doc.get_array("writeErrors") {
        if let Some(Bson::Document(first)) = write_errors.first() {
            let write_error: WriteError = crate::bson::from_document(first.clone())?;
            let indexed: Vec<IndexedWriteError> = write_errors
                .iter()
                .filter_map(Bson::as_document)
                .filter_map(|raw| crate::bson::from_document(raw.clone()).ok())
                .collect();
            return Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteError(write_error)),
                Some(labels),
            )
            .with_write_errors(indexed));
        }
    }

    if doc.contains_key("errmsg") {
        let command_error: CommandError = crate::bson::from_document(doc.clone())?;
        return Err(Error::new(
            ErrorKind::Command(command_error),
            Some(labels),
        ));
    }

    if let Some(write_concern_error) = extract_write_concern_error(&doc)? {
        return Err(Error::new(
            ErrorKind::Write(WriteFailure::WriteConcernError(write_concern_error)),
            Some(labels),
        ));
    }

    let ok = bson_util::response_ok(&doc);

    if ok {
        if let Some(n) = doc.get("n").and_then(bson_util::get_int) {
            return Ok(Reply::Count(n));
        }
        // `nonce` responses (legacy auth) and everything else succeed as the
        // whole document.
        return Ok(Reply::Document(doc));
    }

    let batch = doc
        .get_document("cursor")
        .ok()
        .and_then(|cursor| cursor.get_array("firstBatch").ok())
        .map(|batch| {
            batch
                .iter()
                .filter_map(Bson::as_document)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Ok(Reply::Batch(batch))
}

fn extract_write_concern_error(doc: &Document) -> Result<Option<WriteConcernError>> {
    if let Ok(raw) = doc.get_document("writeConcernError") {
        return Ok(Some(crate::bson::from_document(raw.clone())?));
    }
    if let Ok(raw_errors) = doc.get_array("writeConcernErrors") {
        if let Some(Bson::Document(first)) = raw_errors.first() {
            return Ok(Some(crate::bson::from_document(first.clone())?));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bson::{doc, Timestamp},
        error::ErrorCategory,
        options::TransactionOptions,
        concern::ReadConcern,
    };

    fn transactional_registry() -> (SessionRegistry, Session) {
        let mut registry = SessionRegistry::default();
        let session = registry.insert(vec![7u8; 16], true, None);
        (registry, session)
    }

    fn find_command() -> Command {
        Command::new("find", "testing", doc! { "find": "tx" })
    }

    #[test]
    fn start_transaction_fields_on_first_operation_only() {
        let (mut registry, session) = transactional_registry();
        let times = CausalTimes::default();
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::majority())
            .build();
        registry
            .get_mut(&session)
            .unwrap()
            .start_transaction(Some(options))
            .unwrap();

        let mut first = find_command();
        apply_session_fields(&mut first, &mut registry, Some(&session), &times).unwrap();
        let first = first.into_document();
        assert_eq!(first.get_bool("startTransaction"), Ok(true));
        assert_eq!(first.get_bool("autocommit"), Ok(false));
        assert_eq!(first.get_i64("txnNumber"), Ok(1));
        assert_eq!(
            first.get_document("readConcern").unwrap(),
            &doc! { "level": "majority" }
        );

        let mut second = find_command();
        apply_session_fields(&mut second, &mut registry, Some(&session), &times).unwrap();
        let second = second.into_document();
        assert!(!second.contains_key("startTransaction"));
        assert!(!second.contains_key("readConcern"));
        assert_eq!(second.get_i64("txnNumber"), Ok(1));
        assert_eq!(second.get_bool("autocommit"), Ok(false));
    }

    #[test]
    fn operation_read_concern_dropped_inside_transaction() {
        let (mut registry, session) = transactional_registry();
        let times = CausalTimes::default();
        registry
            .get_mut(&session)
            .unwrap()
            .start_transaction(None)
            .unwrap();

        // Move past the first operation.
        let mut first = find_command();
        apply_session_fields(&mut first, &mut registry, Some(&session), &times).unwrap();

        let mut second = find_command();
        second.set_read_concern(&ReadConcern::local());
        apply_session_fields(&mut second, &mut registry, Some(&session), &times).unwrap();
        assert!(!second.into_document().contains_key("readConcern"));
    }

    #[test]
    fn after_cluster_time_injected_outside_transactions() {
        let mut registry = SessionRegistry::default();
        let mut times = CausalTimes::default();
        let operation_time = Timestamp { time: 20, increment: 3 };
        times.advance_operation_time(operation_time);

        let mut cmd = find_command();
        apply_session_fields(&mut cmd, &mut registry, None, &times).unwrap();
        let doc = cmd.into_document();
        assert_eq!(
            doc.get_document("readConcern")
                .unwrap()
                .get("afterClusterTime"),
            Some(&Bson::Timestamp(operation_time))
        );
    }

    #[test]
    fn get_more_never_carries_read_concern() {
        let mut registry = SessionRegistry::default();
        let mut times = CausalTimes::default();
        times.advance_operation_time(Timestamp { time: 20, increment: 3 });

        let mut cmd = Command::new("getMore", "testing", doc! { "getMore": 1i64 });
        cmd.set_read_concern(&ReadConcern::local());
        apply_session_fields(&mut cmd, &mut registry, None, &times).unwrap();
        assert!(!cmd.into_document().contains_key("readConcern"));
    }

    #[test]
    fn cluster_time_gossiped_on_every_command() {
        let mut registry = SessionRegistry::default();
        let mut times = CausalTimes::default();
        record_response_times(
            &doc! {
                "ok": 1.0,
                "$clusterTime": {
                    "clusterTime": Timestamp { time: 11, increment: 0 },
                    "signature": { "keyId": 0i64 },
                },
            },
            &mut times,
        );

        let mut cmd = find_command();
        apply_session_fields(&mut cmd, &mut registry, None, &times).unwrap();
        assert!(cmd.into_document().contains_key("$clusterTime"));
    }

    #[test]
    fn response_times_advance_monotonically() {
        let mut times = CausalTimes::default();
        record_response_times(
            &doc! { "ok": 1.0, "operationTime": Timestamp { time: 8, increment: 0 } },
            &mut times,
        );
        record_response_times(
            &doc! { "ok": 1.0, "operationTime": Timestamp { time: 5, increment: 0 } },
            &mut times,
        );
        assert_eq!(
            times.operation_time,
            Some(Timestamp { time: 8, increment: 0 })
        );
    }

    #[test]
    fn write_errors_take_precedence() {
        let response = doc! {
            "ok": 1.0,
            "n": 0,
            "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "duplicate key" } ],
        };
        let err = interpret_response(response).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::DuplicateKey);
        assert_eq!(err.code(), Some(11000));
    }

    #[test]
    fn top_level_errors_become_command_errors() {
        let response = doc! {
            "ok": 0.0,
            "code": 72,
            "codeName": "InvalidOptions",
            "errmsg": "readConcern not allowed",
        };
        let err = interpret_response(response).unwrap_err();
        match *err.kind {
            ErrorKind::Command(ref command_error) => {
                assert_eq!(command_error.to_string(), "E72 InvalidOptions: readConcern not allowed");
            }
            ref other => panic!("expected command error, got {:?}", other),
        }
    }

    #[test]
    fn write_concern_errors_surface() {
        let response = doc! {
            "ok": 1.0,
            "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting" },
        };
        let err = interpret_response(response).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::WriteConcern);
    }

    #[test]
    fn scalar_n_results() {
        let reply = interpret_response(doc! { "ok": 1.0, "n": 3 }).unwrap();
        assert_eq!(reply.into_count().unwrap(), 3);
    }

    #[test]
    fn success_returns_whole_document() {
        let response = doc! { "ok": 1.0, "cursor": { "id": 0i64, "firstBatch": [] } };
        let reply = interpret_response(response.clone()).unwrap();
        assert_eq!(reply.into_document().unwrap(), response);
    }

    #[test]
    fn missing_ok_falls_back_to_first_batch() {
        let response = doc! { "cursor": { "firstBatch": [ { "x": 1 } ] } };
        match interpret_response(response).unwrap() {
            Reply::Batch(batch) => assert_eq!(batch, vec![doc! { "x": 1 }]),
            other => panic!("expected batch, got {:?}", other),
        }
    }
}
