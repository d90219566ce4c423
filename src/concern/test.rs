use std::time::Duration;

use crate::{
    bson::doc,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    error::ErrorCategory,
};

#[test]
fn read_concern_levels_round_trip() {
    for level in ["local", "available", "majority", "linearizable", "snapshot"] {
        let concern = ReadConcern::from_spec(level).unwrap();
        assert_eq!(concern.to_document(), doc! { "level": level });
    }
}

#[test]
fn unknown_read_concern_level_is_rejected() {
    let err = ReadConcern::from_spec("strongest").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidConcern);
}

#[test]
fn read_concern_majority_helper() {
    assert_eq!(
        ReadConcern::majority(),
        ReadConcern {
            level: ReadConcernLevel::Majority
        }
    );
}

#[test]
fn write_concern_from_spec() {
    let concern = WriteConcern::from_spec(&doc! { "w": "majority", "j": true, "wtimeout": 500 })
        .unwrap();
    assert_eq!(concern.w, Some(Acknowledgment::Majority));
    assert_eq!(concern.journal, Some(true));
    assert_eq!(concern.w_timeout, Some(Duration::from_millis(500)));

    let numeric = WriteConcern::from_spec(&doc! { "w": 2 }).unwrap();
    assert_eq!(numeric.w, Some(Acknowledgment::Nodes(2)));
}

#[test]
fn write_concern_rejects_invalid_fields() {
    for spec in [
        doc! { "w": -1 },
        doc! { "j": "yes" },
        doc! { "wtimeout": -5 },
        doc! { "fsync": true },
        doc! { "w": 0, "j": true },
    ] {
        let err = WriteConcern::from_spec(&spec).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidConcern, "{:?}", spec);
    }
}

#[test]
fn write_concern_serializes_as_wire_document() {
    let concern = WriteConcern::builder()
        .w(Acknowledgment::Nodes(1))
        .w_timeout(Duration::from_millis(100))
        .journal(true)
        .build();
    assert_eq!(
        concern.to_document().unwrap(),
        doc! { "w": 1, "wtimeout": 100i64, "j": true }
    );
}

#[test]
fn unacknowledged_writes_detected() {
    let unacked = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
    assert!(!unacked.is_acknowledged());
    assert!(WriteConcern::default().is_acknowledged());
}
