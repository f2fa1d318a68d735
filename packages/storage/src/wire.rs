//! Decoding upsert payloads into backend-agnostic records.

use ferry_storage_models::{Record, UpsertRequest};
use mongodb::bson::Document;
use serde_json::Value;

use crate::StorageError;

/// Decodes the payload of `request` into records.
///
/// Accepts a JSON array of objects or a single object. An empty (or
/// whitespace-only) payload and a literal `null` decode to zero records.
///
/// # Errors
///
/// Returns [`StorageError::Decode`] if the payload is not JSON, or if it
/// contains anything other than objects. Nothing is skipped silently.
pub fn decode_upsert_records(request: &UpsertRequest) -> Result<Vec<Record>, StorageError> {
    let decode_error = |message: String| StorageError::Decode {
        table: request.table.clone(),
        message,
    };

    if request.data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_slice(&request.data).map_err(|e| decode_error(e.to_string()))?;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(record) => Ok(vec![record]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(record) => Ok(record),
                other => Err(decode_error(format!(
                    "element {index} is {}, expected an object",
                    kind(&other)
                ))),
            })
            .collect(),
        other => Err(decode_error(format!(
            "payload is {}, expected an object or an array of objects",
            kind(&other)
        ))),
    }
}

/// Copies every field of `record` into `document`, overwriting fields that
/// already exist.
///
/// # Errors
///
/// Returns [`StorageError::Conversion`] if a value has no BSON
/// representation.
pub fn assign_record_document(record: &Record, document: &mut Document) -> Result<(), StorageError> {
    let converted =
        mongodb::bson::to_document(record).map_err(|e| StorageError::Conversion {
            message: e.to_string(),
        })?;
    for (key, value) in converted {
        document.insert(key, value);
    }
    Ok(())
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{Bson, doc};

    use super::*;

    fn request(data: &str) -> UpsertRequest {
        UpsertRequest::new("things", data.as_bytes().to_vec())
    }

    #[test]
    fn decodes_array_of_objects() {
        let records = decode_upsert_records(&request(r#"[{"id":1},{"id":2,"name":"b"}]"#)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["name"], "b");
    }

    #[test]
    fn decodes_single_object_as_one_record() {
        let records = decode_upsert_records(&request(r#"{"id":7}"#)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], 7);
    }

    #[test]
    fn empty_payloads_decode_to_no_records() {
        assert!(decode_upsert_records(&request("")).unwrap().is_empty());
        assert!(decode_upsert_records(&request("  \n")).unwrap().is_empty());
        assert!(decode_upsert_records(&request("null")).unwrap().is_empty());
        assert!(decode_upsert_records(&request("[]")).unwrap().is_empty());
    }

    #[test]
    fn rejects_non_object_elements() {
        let err = decode_upsert_records(&request(r#"[{"id":1}, 3]"#)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to decode records for table things: element 1 is a number, expected an object"
        );
    }

    #[test]
    fn rejects_scalar_and_invalid_payloads() {
        assert!(matches!(
            decode_upsert_records(&request(r#""text""#)),
            Err(StorageError::Decode { .. })
        ));
        assert!(matches!(
            decode_upsert_records(&request("{not json")),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn assigns_fields_over_existing_document() {
        let record = decode_upsert_records(&request(r#"{"name":"new","count":2}"#))
            .unwrap()
            .remove(0);
        let mut document = doc! { "name": "old", "kept": true };

        assign_record_document(&record, &mut document).unwrap();

        assert_eq!(document.get_str("name").unwrap(), "new");
        assert_eq!(document.get("kept"), Some(&Bson::Boolean(true)));
        assert!(document.contains_key("count"));
    }
}
