use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::{
    bson::{Bson, Document, Timestamp},
    concern::{ReadConcern, WriteConcern},
    error::Result,
    session::ClusterTime,
};

/// The commands that must never carry a `readConcern`, enforced as the last
/// step of session-field injection. Sending one anyway produces server error
/// `E72 InvalidOptions`.
pub(crate) static READ_CONCERN_FORBIDDEN: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut set = HashSet::new();
    set.insert("getMore");
    set.insert("killCursors");
    set
});

/// Client-side model of a database command.
///
/// The operation body is assembled first, with the command verb as its first
/// key; the session, transaction, and concern fields are attached by the
/// executor and serialized in a fixed order after the body. Insertion order
/// is preserved all the way to the wire, which is what lets the server
/// dispatch on the first key.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,

    pub(crate) target_db: String,

    pub(crate) body: Document,

    lsid: Option<Document>,

    txn_number: Option<i64>,

    start_transaction: bool,

    autocommit: Option<bool>,

    read_concern: Option<Document>,

    write_concern: Option<Document>,

    cluster_time: Option<ClusterTime>,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            lsid: None,
            txn_number: None,
            start_transaction: false,
            autocommit: None,
            read_concern: None,
            write_concern: None,
            cluster_time: None,
        }
    }

    /// Appends user-supplied options to the body verbatim.
    pub(crate) fn append_extra(&mut self, extra: &Document) {
        for (key, value) in extra {
            self.body.insert(key.clone(), value.clone());
        }
    }

    pub(crate) fn set_session(&mut self, lsid: Document) {
        self.lsid = Some(lsid);
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.txn_number = Some(txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.start_transaction = true;
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.autocommit = Some(false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcern) {
        self.read_concern = Some(read_concern.to_document());
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) -> Result<()> {
        self.write_concern = Some(write_concern.to_document()?);
        Ok(())
    }

    pub(crate) fn clear_read_concern(&mut self) {
        self.read_concern = None;
    }

    pub(crate) fn has_after_cluster_time(&self) -> bool {
        self.read_concern
            .as_ref()
            .map(|rc| rc.contains_key("afterClusterTime"))
            .unwrap_or(false)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.txn_number.is_some()
    }

    pub(crate) fn starts_transaction(&self) -> bool {
        self.start_transaction
    }

    /// Sets `readConcern.afterClusterTime`, preserving any level already
    /// present.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        let read_concern = self.read_concern.get_or_insert_with(Document::new);
        read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time = Some(cluster_time.clone());
    }

    pub(crate) fn forbids_read_concern(&self) -> bool {
        READ_CONCERN_FORBIDDEN.contains(self.name.as_str())
    }

    /// Flattens the command into the document that goes on the wire.
    pub(crate) fn into_document(self) -> Document {
        let mut doc = self.body;

        if let Some(lsid) = self.lsid {
            doc.insert("lsid", lsid);
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert("txnNumber", Bson::Int64(txn_number));
        }
        if self.start_transaction {
            doc.insert("startTransaction", true);
        }
        if let Some(autocommit) = self.autocommit {
            doc.insert("autocommit", autocommit);
        }
        if let Some(read_concern) = self.read_concern {
            doc.insert("readConcern", read_concern);
        }
        if let Some(write_concern) = self.write_concern {
            doc.insert("writeConcern", write_concern);
        }
        if let Some(cluster_time) = self.cluster_time {
            // Serialization of ClusterTime cannot fail; it is two plain
            // fields deserialized from a server document.
            if let Ok(cluster_time) = crate::bson::to_document(&cluster_time) {
                doc.insert("$clusterTime", cluster_time);
            }
        }
        doc.insert("$db", self.target_db);

        doc
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn verb_stays_first_after_injection() {
        let mut command = Command::new(
            "insert",
            "testing",
            doc! { "insert": "movies", "documents": [ { "x": 1 } ] },
        );
        command.set_session(doc! { "id": 1 });
        command.set_txn_number(4);
        command.set_start_transaction();
        command.set_autocommit();
        command.set_read_concern(&crate::concern::ReadConcern::majority());

        let doc = command.into_document();
        let keys: Vec<&str> = doc.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "insert",
                "documents",
                "lsid",
                "txnNumber",
                "startTransaction",
                "autocommit",
                "readConcern",
                "$db",
            ]
        );
        assert_eq!(doc.get("txnNumber"), Some(&Bson::Int64(4)));
        assert_eq!(doc.get("autocommit"), Some(&Bson::Boolean(false)));
    }

    #[test]
    fn after_cluster_time_preserves_level() {
        let mut command = Command::new("find", "testing", doc! { "find": "movies" });
        command.set_read_concern(&crate::concern::ReadConcern::local());
        command.set_after_cluster_time(Timestamp { time: 9, increment: 1 });

        let doc = command.into_document();
        let read_concern = doc.get_document("readConcern").unwrap();
        assert_eq!(read_concern.get_str("level").unwrap(), "local");
        assert!(read_concern.contains_key("afterClusterTime"));
    }

    #[test]
    fn read_concern_forbidden_commands() {
        assert!(Command::new("getMore", "testing", doc! { "getMore": 1i64 }).forbids_read_concern());
        assert!(Command::new("killCursors", "testing", doc! {}).forbids_read_concern());
        assert!(!Command::new("find", "testing", doc! {}).forbids_read_concern());
    }

    #[test]
    fn extra_options_are_appended_verbatim() {
        let mut command = Command::new("count", "testing", doc! { "count": "movies" });
        command.append_extra(&doc! { "hint": { "_id": 1 }, "comment": "why" });
        let doc = command.into_document();
        assert_eq!(doc.get_document("hint").unwrap(), &doc! { "_id": 1 });
        assert_eq!(doc.get_str("comment").unwrap(), "why");
    }
}
