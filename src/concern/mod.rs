//! Contains the types for read concerns and write concerns.

#[cfg(test)]
mod test;

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    error::{ErrorKind, Result},
};

/// Specifies the consistency and isolation properties of read operations.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/read-concern/) for
/// more information about read concerns.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    /// Creates a read concern with level "majority".
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Creates a read concern with level "local".
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// Creates a read concern with level "available".
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    /// Creates a read concern with level "linearizable".
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// Creates a read concern with level "snapshot".
    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    /// Creates a read concern from a level name. Only the five levels the
    /// server recognizes are accepted; anything else fails with an
    /// `InvalidConcern` error.
    pub fn from_spec(level: &str) -> Result<Self> {
        Ok(ReadConcernLevel::from_str(level)?.into())
    }

    pub(crate) fn to_document(&self) -> Document {
        doc! { "level": self.level.as_str() }
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// Specifies the level of a [`ReadConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// Reads return the node's most recent data, with no durability guarantee.
    Local,

    /// Like `Local`, but available on sharded clusters during recovery.
    Available,

    /// Reads return data acknowledged by a majority of the replica set.
    Majority,

    /// Reads reflect all earlier majority-acknowledged writes.
    Linearizable,

    /// Reads inside a transaction observe a single majority-committed
    /// snapshot.
    Snapshot,
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ReadConcernLevel::Local),
            "available" => Ok(ReadConcernLevel::Available),
            "majority" => Ok(ReadConcernLevel::Majority),
            "linearizable" => Ok(ReadConcernLevel::Linearizable),
            "snapshot" => Ok(ReadConcernLevel::Snapshot),
            other => Err(ErrorKind::InvalidConcern {
                message: format!("unrecognized read concern level {:?}", other),
            }
            .into()),
        }
    }

    /// Gets the string representation of the `ReadConcernLevel`.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Snapshot => "snapshot",
        }
    }
}

impl<'de> Deserialize<'de> for ReadConcernLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ReadConcernLevel::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ReadConcernLevel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_str().serialize(serializer)
    }
}

/// Specifies the level of acknowledgement requested from the server for write
/// operations.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/write-concern/) for
/// more information about write concerns.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a
    /// specific number or variety of servers.
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit for the write concern. If the operation has not
    /// propagated to the requested level within the limit, an error returns.
    /// The server does not roll back writes that occurred before the timeout.
    #[serde(rename = "wtimeout")]
    #[serde(serialize_with = "serialize_duration_as_int_millis")]
    #[serde(deserialize_with = "deserialize_duration_from_u64_millis")]
    #[serde(default)]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the operation has propagated to the
    /// on-disk journal.
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

fn serialize_duration_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

fn deserialize_duration_from_u64_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// The type of the `w` field in a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified
    /// number of nodes.
    ///
    /// Note: specifying 0 here indicates that the write is unacknowledged.
    Nodes(i32),

    /// Requires acknowledgement that the write has reached the majority of
    /// nodes.
    Majority,

    /// Requires acknowledgement according to the given custom write concern
    /// name configured on the replica set.
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Nodes(n) => serializer.serialize_i32(*n),
            Acknowledgment::Custom(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(i32),
            String(String),
        }
        match IntOrString::deserialize(deserializer)? {
            IntOrString::String(s) => Ok(s.into()),
            IntOrString::Int(i) => Ok(i.into()),
        }
    }
}

impl From<i32> for Acknowledgment {
    fn from(i: i32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s)
        }
    }
}

impl WriteConcern {
    /// Creates a write concern from a specification document with the
    /// recognized fields `w` (integer >= 0 or string), `j` (boolean), and
    /// `wtimeout` (non-negative integer milliseconds). Anything else fails
    /// with an `InvalidConcern` error.
    pub fn from_spec(spec: &Document) -> Result<Self> {
        let mut concern = WriteConcern::default();
        for (key, value) in spec {
            match (key.as_str(), value) {
                ("w", Bson::String(s)) => concern.w = Some(s.clone().into()),
                ("w", v) => match bson_util::get_int(v) {
                    Some(n) if n >= 0 && n <= i64::from(i32::MAX) => {
                        concern.w = Some(Acknowledgment::Nodes(n as i32));
                    }
                    _ => {
                        return Err(ErrorKind::InvalidConcern {
                            message: format!("w must be a string or a non-negative integer, got {:?}", v),
                        }
                        .into())
                    }
                },
                ("j", Bson::Boolean(j)) => concern.journal = Some(*j),
                ("j", v) => {
                    return Err(ErrorKind::InvalidConcern {
                        message: format!("j must be a boolean, got {:?}", v),
                    }
                    .into())
                }
                ("wtimeout", v) => match bson_util::get_int(v) {
                    Some(ms) if ms >= 0 => {
                        concern.w_timeout = Some(Duration::from_millis(ms as u64));
                    }
                    _ => {
                        return Err(ErrorKind::InvalidConcern {
                            message: format!("wtimeout must be a non-negative integer, got {:?}", v),
                        }
                        .into())
                    }
                },
                (other, _) => {
                    return Err(ErrorKind::InvalidConcern {
                        message: format!("unrecognized write concern option {:?}", other),
                    }
                    .into())
                }
            }
        }
        concern.validate()?;
        Ok(concern)
    }

    /// Whether the server will acknowledge this write.
    #[allow(dead_code)]
    pub(crate) fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Validates the write concern. A write concern is invalid if the `w`
    /// field is 0 and the `j` field is `true`.
    pub fn validate(&self) -> Result<()> {
        if let Some(Acknowledgment::Nodes(i)) = self.w {
            if i < 0 {
                return Err(ErrorKind::InvalidConcern {
                    message: "write concern `w` field cannot be a negative integer".to_string(),
                }
                .into());
            }
        }

        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(ErrorKind::InvalidConcern {
                message: "write concern cannot have w=0 and j=true".to_string(),
            }
            .into());
        }

        Ok(())
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        Ok(crate::bson::to_document(self)?)
    }
}
