//! This crate is a pure Rust MongoDB wire-protocol client. It speaks `OP_MSG`
//! over a single TCP connection, authenticates with SCRAM, and supports CRUD,
//! aggregation, index, and multi-document transaction commands together with
//! logical sessions and causally consistent reads.
//!
//! To connect, build a [`ClientOptions`](options::ClientOptions) and call
//! [`Client::connect`]:
//!
//! ```rust,no_run
//! # use mongolite::{error::Result, options::ClientOptions, Client};
//! # use bson::doc;
//! #
//! # async fn run() -> Result<()> {
//! let options = ClientOptions::builder()
//!     .database("testing")
//!     .host("localhost")
//!     .username("root")
//!     .password("example")
//!     .build();
//! let mut client = Client::new(options)?;
//! client.connect().await?;
//!
//! let inserted = client
//!     .insert("movies", doc! { "name": "Armageddon", "country": "USA" }, None)
//!     .await?;
//! println!("{:#?}", inserted);
//! # Ok(())
//! # }
//! ```
//!
//! A connection is a critical section: every operation takes `&mut self`, so a
//! single `Client` serves one caller at a time. Code that needs parallelism
//! should open multiple clients. Blocking callers can use [`sync::Client`],
//! which drives the async client on a private current-thread runtime.

pub use bson;

mod auth;
mod bson_util;
mod client;
mod command;
pub mod concern;
mod conn;
pub mod error;
pub mod options;
pub mod results;
mod session;
pub mod sync;
mod wire;

pub use crate::{
    client::Client,
    conn::ConnectionInfo,
    session::{ClusterTime, Session, TransactionState},
};

/// A boxed future, used by [`Client::with_transaction`] callbacks.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
