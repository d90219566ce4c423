use std::sync::{Arc, Mutex};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::{index_spec, prepare_document, Client};
use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    error::{ErrorCategory, ErrorKind},
    options::{
        ClientOptions,
        FindOptions,
        IndexModel,
        InsertManyOptions,
        InsertOptions,
        TransactionOptions,
    },
    wire::Message,
    TransactionState,
};

/// A scripted server speaking just enough `OP_MSG` for one connection: it
/// answers each incoming command with the next canned reply and records every
/// command document it saw.
struct MockServer {
    port: u16,
    received: Arc<Mutex<Vec<Document>>>,
}

impl MockServer {
    async fn start(replies: Vec<Document>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for reply in replies {
                let request = match read_message(&mut stream).await {
                    Some(request) => request,
                    None => return,
                };
                seen.lock().unwrap().push(request.document.clone());

                let mut response = Message::new(reply, 0);
                response.response_to = request.request_id;
                let mut bytes = Vec::new();
                response.write_to(&mut bytes).unwrap();
                stream.write_all(&bytes).await.unwrap();
            }
            // Hold the socket open so trailing client work is not cut short.
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        Self { port, received }
    }

    fn received(&self) -> Vec<Document> {
        self.received.lock().unwrap().clone()
    }

    /// A client wired to this mock, with the transport opened but the SCRAM
    /// handshake skipped; the mock accepts commands without authentication.
    async fn client(&self) -> Client {
        let options = ClientOptions::builder()
            .database("testing")
            .host("127.0.0.1")
            .port(self.port as u32)
            .username("root")
            .password("example")
            .build();
        let mut client = Client::new(options).unwrap();
        client.conn.connect().await.unwrap();
        client
    }
}

async fn read_message(stream: &mut TcpStream) -> Option<Message> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.ok()?;
    let length = i32::from_le_bytes(prefix) as usize;
    let mut rest = vec![0u8; length - 4];
    stream.read_exact(&mut rest).await.ok()?;

    let mut frame = prefix.to_vec();
    frame.extend_from_slice(&rest);
    Message::read_from(&mut frame.as_slice()).ok()
}

fn session_reply(uuid_byte: u8) -> Document {
    doc! {
        "ok": 1.0,
        "id": {
            "id": Binary { subtype: BinarySubtype::Uuid, bytes: vec![uuid_byte; 16] },
        },
    }
}

fn empty_cursor_reply() -> Document {
    doc! { "ok": 1.0, "cursor": { "id": 0i64, "ns": "testing.movies", "firstBatch": [] } }
}

#[tokio::test]
async fn insert_sends_command_and_returns_document() {
    let server = MockServer::start(vec![doc! { "ok": 1.0, "n": 1 }]).await;
    let mut client = server.client().await;

    let inserted = client
        .insert("movies", doc! { "name": "Armageddon", "country": "USA" }, None)
        .await
        .unwrap();
    assert_eq!(inserted.get_str("_id").unwrap().len(), 36);

    let received = server.received();
    assert_eq!(received.len(), 1);
    let command = &received[0];
    assert_eq!(command.iter().next().unwrap().0, "insert");
    assert_eq!(command.get_str("insert").unwrap(), "movies");
    assert_eq!(command.get_str("$db").unwrap(), "testing");
    let documents = command.get_array("documents").unwrap();
    assert_eq!(documents.len(), 1);
}

#[tokio::test]
async fn duplicate_key_is_categorized() {
    let reply = doc! {
        "ok": 1.0,
        "n": 0,
        "writeErrors": [ {
            "index": 0,
            "code": 11000,
            "errmsg": "E11000 duplicate key error collection: testing.movies",
        } ],
    };
    let server = MockServer::start(vec![reply]).await;
    let mut client = server.client().await;

    let err = client
        .insert("movies", doc! { "_id": 999 }, None)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DuplicateKey);
    assert_eq!(err.code(), Some(11000));
    assert_eq!(err.operation(), Some("insert"));
}

#[tokio::test]
async fn transaction_fields_are_injected_exactly_once() {
    let server = MockServer::start(vec![
        session_reply(0x11),
        doc! { "ok": 1.0, "n": 1 },
        doc! { "ok": 1.0, "n": 1 },
        doc! { "ok": 1.0 },
    ])
    .await;
    let mut client = server.client().await;

    let session = client.start_session(None).await.unwrap();
    let options = TransactionOptions::builder()
        .read_concern(ReadConcern::majority())
        .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(1)).build())
        .build();
    client.start_transaction(&session, Some(options)).unwrap();

    let insert_options = InsertOptions::builder().session(session.clone()).build();
    client
        .insert("tx", doc! { "x": 1 }, Some(insert_options.clone()))
        .await
        .unwrap();
    client
        .insert("tx", doc! { "x": 2 }, Some(insert_options))
        .await
        .unwrap();
    client.commit_transaction(&session).await.unwrap();

    assert_eq!(client.session_state(&session), Some(TransactionState::Committed));

    let received = server.received();
    assert_eq!(received.len(), 4);

    let starting: Vec<&Document> = received
        .iter()
        .filter(|command| command.get_bool("startTransaction").unwrap_or(false))
        .collect();
    assert_eq!(starting.len(), 1, "exactly one command starts the transaction");

    let first = &received[1];
    assert_eq!(first.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(first.get_bool("autocommit").unwrap(), false);
    assert_eq!(
        first.get_document("readConcern").unwrap(),
        &doc! { "level": "majority" }
    );
    assert_eq!(first.get_document("writeConcern").unwrap().get("w"), Some(&Bson::Int32(1)));
    assert!(first.get_document("lsid").unwrap().contains_key("id"));

    let second = &received[2];
    assert!(!second.contains_key("startTransaction"));
    assert!(!second.contains_key("readConcern"));
    assert_eq!(second.get_i64("txnNumber").unwrap(), 1);

    let commit = &received[3];
    assert_eq!(commit.iter().next().unwrap().0, "commitTransaction");
    assert_eq!(commit.get_str("$db").unwrap(), "admin");
    assert_eq!(commit.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(commit.get_bool("autocommit").unwrap(), false);
    assert!(!commit.contains_key("startTransaction"));
}

#[tokio::test]
async fn abort_moves_the_session_to_aborted() {
    let server = MockServer::start(vec![
        session_reply(0x22),
        doc! { "ok": 1.0, "n": 1 },
        doc! { "ok": 1.0 },
    ])
    .await;
    let mut client = server.client().await;

    let session = client.start_session(None).await.unwrap();
    client.start_transaction(&session, None).unwrap();
    let options = InsertOptions::builder().session(session.clone()).build();
    client.insert("tx", doc! { "x": 1 }, Some(options)).await.unwrap();
    client.abort_transaction(&session).await.unwrap();

    assert_eq!(client.session_state(&session), Some(TransactionState::Aborted));
    let received = server.received();
    assert_eq!(received[2].iter().next().unwrap().0, "abortTransaction");

    // A fresh transaction bumps the number again.
    client.start_transaction(&session, None).unwrap();
    assert_eq!(client.session_state(&session), Some(TransactionState::Starting));
}

#[tokio::test]
async fn after_cluster_time_follows_operation_time() {
    let operation_time = Timestamp { time: 500, increment: 7 };
    let mut first_reply = empty_cursor_reply();
    first_reply.insert("operationTime", operation_time);

    let server =
        MockServer::start(vec![first_reply, empty_cursor_reply(), empty_cursor_reply()]).await;
    let mut client = server.client().await;

    client.find("movies", doc! {}, None).await.unwrap();
    assert_eq!(client.get_operation_time(), Some(operation_time));

    client.find("movies", doc! {}, None).await.unwrap();
    client.get_more("movies", 42, None).await.unwrap();

    let received = server.received();
    assert!(!received[0].contains_key("readConcern"));

    let second = &received[1];
    assert_eq!(
        second
            .get_document("readConcern")
            .unwrap()
            .get("afterClusterTime"),
        Some(&Bson::Timestamp(operation_time))
    );

    // getMore must never carry a read concern.
    let third = &received[2];
    assert_eq!(third.iter().next().unwrap().0, "getMore");
    assert!(!third.contains_key("readConcern"));
}

#[tokio::test]
async fn cluster_time_is_gossiped_back() {
    let mut first_reply = empty_cursor_reply();
    first_reply.insert(
        "$clusterTime",
        doc! {
            "clusterTime": Timestamp { time: 600, increment: 1 },
            "signature": { "hash": Binary { subtype: BinarySubtype::Generic, bytes: vec![0; 4] }, "keyId": 0i64 },
        },
    );
    let server = MockServer::start(vec![first_reply, empty_cursor_reply()]).await;
    let mut client = server.client().await;

    client.find("movies", doc! {}, None).await.unwrap();
    assert!(client.get_cluster_time().is_some());

    client.find("movies", doc! {}, None).await.unwrap();
    let received = server.received();
    assert!(!received[0].contains_key("$clusterTime"));
    assert!(received[1].contains_key("$clusterTime"));
}

#[tokio::test]
async fn create_collection_conflict_short_circuits() {
    let listing = doc! {
        "ok": 1.0,
        "cursor": { "id": 0i64, "ns": "testing.$cmd.listCollections", "firstBatch": [ { "name": "movies" } ] },
    };
    let server = MockServer::start(vec![listing]).await;
    let mut client = server.client().await;

    let err = client.create_collection("movies", None).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::AlreadyExists);

    // Only the listCollections probe went out; no create command followed.
    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].iter().next().unwrap().0, "listCollections");
}

#[tokio::test]
async fn with_transaction_retries_transient_failures() {
    let transient = doc! {
        "ok": 0.0,
        "code": 251,
        "codeName": "NoSuchTransaction",
        "errmsg": "Transaction was aborted",
        "errorLabels": ["TransientTransactionError"],
    };
    let server = MockServer::start(vec![
        session_reply(0x33),
        transient,
        doc! { "ok": 1.0 },          // abortTransaction
        doc! { "ok": 1.0, "n": 1 },  // retried insert
        doc! { "ok": 1.0 },          // commitTransaction
    ])
    .await;
    let mut client = server.client().await;
    let session = client.start_session(None).await.unwrap();

    client
        .with_transaction(&session, None, |client, session| {
            let session = session.clone();
            Box::pin(async move {
                let options = InsertOptions::builder().session(session).build();
                client
                    .insert("tx", doc! { "x": 1 }, Some(options))
                    .await
                    .map(|_| ())
            })
        })
        .await
        .unwrap();

    assert_eq!(client.session_state(&session), Some(TransactionState::Committed));

    let received = server.received();
    let names: Vec<String> = received
        .iter()
        .map(|command| command.iter().next().unwrap().0.clone())
        .collect();
    assert_eq!(
        names,
        vec![
            "startSession",
            "insert",
            "abortTransaction",
            "insert",
            "commitTransaction",
        ]
    );

    // The retry is a new transaction with a higher txnNumber.
    assert_eq!(received[1].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(received[3].get_i64("txnNumber").unwrap(), 2);
    assert!(received[3].get_bool("startTransaction").unwrap());
}

#[tokio::test]
async fn insert_many_splits_batches_and_carries_partial_results() {
    let server = MockServer::start(vec![
        doc! { "ok": 1.0, "n": 2 },
        doc! {
            "ok": 1.0,
            "n": 0,
            "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "dup" } ],
        },
    ])
    .await;
    let mut client = server.client().await;

    let documents = vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 3 }];
    let options = InsertManyOptions::builder().batch_size(2).build();
    let err = client
        .insert_many("movies", documents, Some(options))
        .await
        .unwrap_err();

    match *err.kind {
        ErrorKind::BulkWrite(ref bulk) => {
            assert_eq!(bulk.write_errors.len(), 1);
            // Re-indexed against the caller's input: the failing document is
            // the third overall.
            assert_eq!(bulk.write_errors[0].index, 2);
            assert_eq!(bulk.write_errors[0].code, 11000);
            assert_eq!(bulk.inserted.len(), 2);
        }
        ref other => panic!("expected bulk write error, got {:?}", other),
    }

    let received = server.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].get_array("documents").unwrap().len(), 2);
    assert_eq!(received[1].get_array("documents").unwrap().len(), 1);
    assert_eq!(received[0].get_bool("ordered").unwrap(), true);
}

#[tokio::test]
async fn find_options_shape_the_command() {
    let server = MockServer::start(vec![empty_cursor_reply()]).await;
    let mut client = server.client().await;

    let options = FindOptions::builder()
        .sort(doc! { "_id": -1 })
        .limit(1)
        .max_time_ms(250)
        .build();
    client
        .find("movies", doc! { "name": "Armageddon" }, Some(options))
        .await
        .unwrap();

    let command = &server.received()[0];
    assert_eq!(command.get_document("filter").unwrap().get_str("name"), Ok("Armageddon"));
    assert_eq!(command.get_document("sort").unwrap(), &doc! { "_id": -1 });
    assert_eq!(command.get_i64("limit").unwrap(), 1);
    assert_eq!(command.get_i64("maxTimeMS").unwrap(), 250);
}

#[tokio::test]
async fn server_errors_render_with_code_and_name() {
    let reply = doc! {
        "ok": 0.0,
        "code": 72,
        "codeName": "InvalidOptions",
        "errmsg": "readConcern is not allowed",
    };
    let server = MockServer::start(vec![reply]).await;
    let mut client = server.client().await;

    let err = client.count("movies", doc! {}, None).await.unwrap_err();
    match *err.kind {
        ErrorKind::Command(ref command_error) => {
            assert_eq!(
                command_error.to_string(),
                "E72 InvalidOptions: readConcern is not allowed"
            );
        }
        ref other => panic!("expected command error, got {:?}", other),
    }
}

#[tokio::test]
async fn closed_clients_reject_operations() {
    let server = MockServer::start(vec![]).await;
    let mut client = server.client().await;
    client.close().await;

    let err = client.find("movies", doc! {}, None).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
}

// ---------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------

#[test]
fn missing_id_gets_a_uuid_v7_string() {
    let prepared = prepare_document(doc! { "name": "Armageddon" });
    let id = prepared.get_str("_id").unwrap();
    assert_eq!(id.len(), 36);
    assert_eq!(id.matches('-').count(), 4);
    let parsed = uuid::Uuid::parse_str(id).unwrap();
    assert_eq!(parsed.get_version_num(), 7);
}

#[test]
fn empty_and_null_ids_are_replaced() {
    assert_eq!(
        prepare_document(doc! { "_id": "" }).get_str("_id").unwrap().len(),
        36
    );
    assert_eq!(
        prepare_document(doc! { "_id": Bson::Null })
            .get_str("_id")
            .unwrap()
            .len(),
        36
    );
}

#[test]
fn existing_ids_are_preserved() {
    let prepared = prepare_document(doc! { "_id": 999 });
    assert_eq!(prepared.get("_id"), Some(&Bson::Int32(999)));
}

#[test]
fn unique_index_without_partial_filter_becomes_sparse() {
    let spec = index_spec(IndexModel {
        keys: doc! { "email": 1 },
        options: Some(doc! { "unique": true }),
    });
    assert_eq!(spec.get_bool("sparse"), Ok(true));
    assert_eq!(spec.get_bool("unique"), Ok(true));
    assert_eq!(spec.get_str("name"), Ok("email_1"));
}

#[test]
fn unique_index_with_partial_filter_stays_dense() {
    let spec = index_spec(IndexModel {
        keys: doc! { "email": 1 },
        options: Some(doc! {
            "unique": true,
            "partialFilterExpression": { "email": { "$exists": true } },
        }),
    });
    assert!(!spec.contains_key("sparse"));
}

#[test]
fn plain_index_is_untouched() {
    let spec = index_spec(IndexModel {
        keys: doc! { "a": 1, "b": -1 },
        options: None,
    });
    assert_eq!(spec.get_str("name"), Ok("a_1_b_-1"));
    assert!(!spec.contains_key("sparse"));
    assert!(!spec.contains_key("unique"));
}

#[test]
fn invalid_options_rejected_at_construction() {
    let options = ClientOptions::builder()
        .database("")
        .host("localhost")
        .username("root")
        .password("example")
        .build();
    assert!(Client::new(options).is_err());
}

#[test]
fn connection_info_before_connecting() {
    let options = ClientOptions::builder()
        .database("testing")
        .host("localhost")
        .username("root")
        .password("example")
        .build();
    let client = Client::new(options).unwrap();
    assert!(!client.connection_info().connected);
    assert!(client.connection_info().connection_id.starts_with("conn-"));
}
