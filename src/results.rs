//! Typed views over the documents returned by read operations.

use serde::Deserialize;

use crate::{
    bson::Document,
    error::{Error, Result},
};

/// A cursor-bearing response, as returned by
/// [`Client::find`](crate::Client::find),
/// [`Client::aggregate`](crate::Client::aggregate), and
/// [`Client::get_more`](crate::Client::get_more) once deserialized with
/// [`CursorBody::from_document`].
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CursorBody {
    /// The cursor portion of the response.
    pub cursor: CursorInfo,
}

/// The server-side cursor state inside a [`CursorBody`].
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CursorInfo {
    /// The cursor's id; 0 when the cursor is exhausted.
    pub id: i64,

    /// The namespace the cursor reads from, as `db.collection`.
    #[serde(default)]
    pub ns: String,

    /// The initial batch of a `find`/`aggregate` response.
    #[serde(default)]
    pub first_batch: Vec<Document>,

    /// The batch of a `getMore` response.
    #[serde(default)]
    pub next_batch: Vec<Document>,
}

impl CursorBody {
    /// Deserializes a raw cursor response.
    pub fn from_document(doc: Document) -> Result<Self> {
        crate::bson::from_document(doc)
            .map_err(|e| Error::invalid_response(format!("malformed cursor response: {}", e)))
    }

    /// The documents of this response, whichever batch field they arrived in.
    pub fn batch(&self) -> &[Document] {
        if self.cursor.first_batch.is_empty() {
            &self.cursor.next_batch
        } else {
            &self.cursor.first_batch
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn find_response_deserializes() {
        let body = CursorBody::from_document(doc! {
            "cursor": {
                "id": 0i64,
                "ns": "testing.movies",
                "firstBatch": [ { "name": "Armageddon" } ],
            },
            "ok": 1.0,
        })
        .unwrap();
        assert_eq!(body.cursor.id, 0);
        assert_eq!(body.cursor.ns, "testing.movies");
        assert_eq!(body.batch(), &[doc! { "name": "Armageddon" }]);
    }

    #[test]
    fn get_more_batch_is_visible() {
        let body = CursorBody::from_document(doc! {
            "cursor": { "id": 42i64, "nextBatch": [ { "x": 2 } ] },
            "ok": 1.0,
        })
        .unwrap();
        assert_eq!(body.batch(), &[doc! { "x": 2 }]);
    }
}
