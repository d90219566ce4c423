//! Contains the options structs for the client and for individual operations.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    concern::{ReadConcern, WriteConcern},
    error::{ErrorKind, Result},
    session::Session,
};

pub use crate::auth::AuthMechanism;

/// The scheduling model a connection's receive loop assumes.
///
/// Both modes poll the socket in chunks and back off when no bytes are
/// available; they differ only in the backoff profile. `Cooperative` is the
/// default for the async [`Client`](crate::Client); [`sync::Client`](crate::sync::Client)
/// constructs its inner client in `Blocking` mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionMode {
    /// One OS thread per connection; empty reads back off starting at 100 µs,
    /// doubling up to a 10 ms cap.
    Blocking,

    /// Single-threaded event loop; empty reads back off a fixed 1 ms so other
    /// tasks can run.
    #[default]
    Cooperative,
}

/// Options for constructing a [`Client`](crate::Client).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The database operations are issued against.
    pub database: String,

    /// The hostname of the server.
    pub host: String,

    /// The port of the server. Must be in `[1, 65535]`.
    #[builder(default = 27017)]
    pub port: u32,

    /// The username to authenticate as.
    pub username: String,

    /// The password to authenticate with.
    pub password: String,

    /// The scheduling model for the connection's receive loop.
    #[builder(default)]
    pub mode: ConnectionMode,

    /// The SCRAM mechanism used for the authentication handshake.
    #[builder(default)]
    pub mechanism: AuthMechanism,
}

impl ClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "database name must not be empty".to_string(),
            }
            .into());
        }
        if self.host.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "host must not be empty".to_string(),
            }
            .into());
        }
        if self.port < 1 || self.port > 65535 {
            return Err(ErrorKind::InvalidArgument {
                message: format!("port must be within [1, 65535], got {}", self.port),
            }
            .into());
        }
        if self.username.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "username must not be empty".to_string(),
            }
            .into());
        }
        if self.password.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "password must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Options for starting a logical session.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether reads in this session should be causally consistent with prior
    /// operations. Defaults to true.
    pub causal_consistency: Option<bool>,

    /// The options applied to transactions started on this session when
    /// `start_transaction` is called without its own options.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Options for a single transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern applied to the transaction's first operation.
    pub read_concern: Option<ReadConcern>,

    /// The write concern applied to the transaction's first operation and to
    /// the commit.
    pub write_concern: Option<WriteConcern>,

    /// The server-side time limit for the commit, passed as `maxTimeMS` on
    /// the `commitTransaction` command.
    pub max_commit_time: Option<Duration>,

    /// How many times [`with_transaction`](crate::Client::with_transaction)
    /// retries after a transient failure. Defaults to 3.
    pub max_retries: Option<u32>,

    /// The delay between [`with_transaction`](crate::Client::with_transaction)
    /// attempts. Defaults to 100 ms.
    pub retry_delay: Option<Duration>,
}

/// Options for [`Client::insert`](crate::Client::insert).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct InsertOptions {
    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::insert_many`](crate::Client::insert_many).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Whether the server should stop at the first failed document. Defaults
    /// to true; when true, a failure also stops subsequent batches.
    pub ordered: Option<bool>,

    /// How many documents are sent per `insert` command. Defaults to 1000.
    pub batch_size: Option<usize>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to each batch's command verbatim.
    pub extra: Option<Document>,
}

impl InsertManyOptions {
    pub(crate) fn ordered(&self) -> bool {
        self.ordered.unwrap_or(true)
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.filter(|size| *size > 0).unwrap_or(1000)
    }
}

/// Options for [`Client::update`](crate::Client::update).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// Whether all matching documents are updated, rather than the first.
    pub multi: Option<bool>,

    /// Whether a document is inserted when the filter matches nothing.
    pub upsert: Option<bool>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// One entry of a bulk [`Client::upsert`](crate::Client::upsert).
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct UpdateModel {
    /// The filter selecting the documents to update.
    pub filter: Document,

    /// The update document or pipeline.
    pub update: Document,

    /// Whether all matching documents are updated.
    #[builder(default)]
    pub multi: Option<bool>,
}

/// Options for [`Client::delete`](crate::Client::delete).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct DeleteOptions {
    /// Whether all matching documents are removed, rather than the first.
    /// Defaults to true.
    pub many: Option<bool>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::find`](crate::Client::find) and
/// [`Client::last_document`](crate::Client::last_document).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindOptions {
    /// The sort order of the results.
    pub sort: Option<Document>,

    /// The projection applied to returned documents.
    pub projection: Option<Document>,

    /// The maximum number of documents to return.
    pub limit: Option<i64>,

    /// The number of documents to skip.
    pub skip: Option<i64>,

    /// The number of documents returned per cursor batch.
    pub batch_size: Option<i32>,

    /// The server-side time limit, passed verbatim as `maxTimeMS`.
    pub max_time_ms: Option<i64>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::count`](crate::Client::count).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct CountOptions {
    /// The server-side time limit, passed verbatim as `maxTimeMS`.
    pub max_time_ms: Option<i64>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::aggregate`](crate::Client::aggregate).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents returned per cursor batch.
    pub batch_size: Option<i32>,

    /// The server-side time limit, passed verbatim as `maxTimeMS`.
    pub max_time_ms: Option<i64>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The write concern, applied when the pipeline writes (`$out`/`$merge`).
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::find_and_modify`](crate::Client::find_and_modify).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct FindAndModifyOptions {
    /// The update to apply to the matched document. Exactly one of `update`
    /// or `remove` must be provided.
    pub update: Option<Document>,

    /// Whether the matched document is removed instead of updated.
    pub remove: Option<bool>,

    /// Whether to return the post-image rather than the pre-image.
    pub new: Option<bool>,

    /// The sort order used to pick among multiple matches.
    pub sort: Option<Document>,

    /// The projection applied to the returned document.
    pub fields: Option<Document>,

    /// Whether a document is inserted when the filter matches nothing.
    pub upsert: Option<bool>,

    /// The server-side time limit, passed verbatim as `maxTimeMS`.
    pub max_time_ms: Option<i64>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::get_more`](crate::Client::get_more).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct GetMoreOptions {
    /// The number of documents returned in the batch.
    pub batch_size: Option<i32>,

    /// The server-side time limit, passed verbatim as `maxTimeMS`.
    pub max_time_ms: Option<i64>,

    /// The session to run the operation under.
    pub session: Option<Session>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::create_collection`](crate::Client::create_collection).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct CreateCollectionOptions {
    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options (`capped`, `size`, validators, ...),
    /// appended to the command verbatim.
    pub extra: Option<Document>,
}

/// Options for [`Client::create_indexes`](crate::Client::create_indexes) and
/// the drop operations.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct CommandOptions {
    /// The session to run the operation under.
    pub session: Option<Session>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Additional command options, appended to the command verbatim.
    pub extra: Option<Document>,
}

/// The specification of a single index for
/// [`Client::create_indexes`](crate::Client::create_indexes).
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct IndexModel {
    /// The index key pattern, e.g. `doc! { "name": 1 }`.
    pub keys: Document,

    /// Index options (`name`, `unique`, `partialFilterExpression`, ...)
    /// merged into the index specification. An index marked `unique` without
    /// a `partialFilterExpression` additionally gets `sparse: true`; see the
    /// crate documentation for this legacy quirk.
    #[builder(default)]
    pub options: Option<Document>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorCategory;

    fn base_options() -> ClientOptions {
        ClientOptions::builder()
            .database("testing")
            .host("localhost")
            .username("root")
            .password("example")
            .build()
    }

    #[test]
    fn default_port_is_27017() {
        assert_eq!(base_options().port, 27017);
        assert!(base_options().validate().is_ok());
    }

    #[test]
    fn out_of_range_ports_are_rejected() {
        for port in [0u32, 65536] {
            let mut options = base_options();
            options.port = port;
            let err = options.validate().unwrap_err();
            assert_eq!(err.category(), ErrorCategory::InvalidArgument, "port {}", port);
        }
        let mut options = base_options();
        options.port = 65535;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn empty_fields_are_rejected() {
        for field in ["database", "host", "username", "password"] {
            let mut options = base_options();
            match field {
                "database" => options.database.clear(),
                "host" => options.host.clear(),
                "username" => options.username.clear(),
                _ => options.password.clear(),
            }
            assert!(options.validate().is_err(), "field {}", field);
        }
    }

    #[test]
    fn insert_many_defaults() {
        let options = InsertManyOptions::default();
        assert!(options.ordered());
        assert_eq!(options.batch_size(), 1000);

        let tuned = InsertManyOptions::builder()
            .ordered(false)
            .batch_size(10)
            .build();
        assert!(!tuned.ordered());
        assert_eq!(tuned.batch_size(), 10);
    }
}
