use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
};

/// Coerces numeric types into an `i64` if it would be lossless to do so.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Whether the response reports success. The server encodes `ok` variously as
/// a double, an i32, or an i64.
pub(crate) fn response_ok(doc: &Document) -> bool {
    doc.get("ok").and_then(get_int) == Some(1)
}

/// The logical operators whose array elements must each be a sub-document.
const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Validates the array-valued logical operators in a filter document: each
/// element of `$and`/`$or`/`$nor` must itself be a document, since the server
/// distinguishes an array of clauses from a raw array value.
pub(crate) fn normalize_logical_operators(filter: &Document) -> Result<()> {
    for op in LOGICAL_OPERATORS {
        if let Ok(clauses) = filter.get_array(op) {
            for clause in clauses {
                match clause {
                    Bson::Document(inner) => normalize_logical_operators(inner)?,
                    other => {
                        return Err(Error::invalid_argument(format!(
                            "each clause of {} must be a document, got {:?}",
                            op, other
                        )))
                    }
                }
            }
        }
    }
    Ok(())
}

/// Generates a server-style index name from its key document, e.g.
/// `{"a": 1, "b": -1}` becomes `a_1_b_-1`.
pub(crate) fn index_name_from_keys(keys: &Document) -> String {
    keys.iter()
        .map(|(field, value)| {
            let direction = match value {
                Bson::Int32(i) => i.to_string(),
                Bson::Int64(i) => i.to_string(),
                Bson::Double(f) => (*f as i64).to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}_{}", field, direction)
        })
        .collect::<Vec<_>>()
        .join("_")
}
