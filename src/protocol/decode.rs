//! Typed decoding of wire payloads.
//!
//! Every dynamic boundary of the protocol is validated here, once, turning
//! `serde_json` values into the closed types of [`super::types`]. Anything
//! malformed is an [`SyncError::InvalidData`]: a protocol mismatch that is
//! never silently recovered.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{ServerFault, SyncError, SyncResult};

use super::types::{
    CellValue, ChangeEvents, ChangeFeed, Record, ResultSet, RowVersion, ServerErrorBody,
    MANAGED_FAULT_TAG,
};

/// Classified body of a query response: either result sets or a single error
/// object.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Results(Vec<ResultSet>),
    Fault(ServerErrorBody),
}

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2}):(\d{2})\.(\d{3})Z$").unwrap());

static ROW_ID_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9]\d*$").unwrap());

// Non-greedy text followed by the in-band marker, then the table and the
// optional column, matching the message format the server emits for managed
// faults.
static MANAGED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(.*?)\s\[APP\](?:\[([^\]]+)\](?:\[([^\]]+)\])?)?").unwrap()
});

pub fn decode_query_payload(payload: Value) -> SyncResult<QueryOutcome> {
    match payload {
        Value::Array(sets) => {
            let mut decoded = Vec::with_capacity(sets.len());
            for (index, set) in sets.into_iter().enumerate() {
                decoded.push(decode_result_set(index, set)?);
            }
            Ok(QueryOutcome::Results(decoded))
        }
        payload @ Value::Object(_) => {
            let body: ServerErrorBody = serde_json::from_value(payload).map_err(|_| {
                SyncError::InvalidData("invalid or incomplete error object returned".to_string())
            })?;
            Ok(QueryOutcome::Fault(body))
        }
        _ => Err(SyncError::InvalidData(
            "query response is neither result sets nor an error object".to_string(),
        )),
    }
}

fn decode_result_set(index: usize, set: Value) -> SyncResult<ResultSet> {
    let invalid = || SyncError::InvalidData(format!("result set #{} is invalid", index));

    let Value::Object(mut set) = set else {
        return Err(invalid());
    };
    let affected_rows = set
        .remove("affectedRowCount")
        .and_then(|v| v.as_i64())
        .ok_or_else(invalid)?;
    let Some(Value::Array(rows)) = set.remove("rows") else {
        return Err(invalid());
    };
    let date_columns: Vec<String> = match set.remove("dateColumns") {
        Some(Value::Array(names)) => names
            .into_iter()
            .map(|n| match n {
                Value::String(s) => Ok(s),
                _ => Err(invalid()),
            })
            .collect::<SyncResult<_>>()?,
        _ => return Err(invalid()),
    };

    let mut decoded_rows = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.into_iter().enumerate() {
        let Value::Object(fields) = row else {
            return Err(SyncError::InvalidData(format!(
                "record #{} in result set #{} is invalid",
                row_index, index
            )));
        };
        let mut record = Record::new();
        for (name, value) in fields {
            let cell = if date_columns.iter().any(|c| c == &name) {
                decode_date_cell(&name, row_index, index, value)?
            } else {
                decode_cell(&name, row_index, index, value)?
            };
            record.insert(name, cell);
        }
        decoded_rows.push(record);
    }

    Ok(ResultSet {
        affected_rows,
        rows: decoded_rows,
    })
}

fn decode_cell(name: &str, row: usize, set: usize, value: Value) -> SyncResult<CellValue> {
    match value {
        Value::Null => Ok(CellValue::Null),
        Value::Bool(b) => Ok(CellValue::Bool(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(CellValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(CellValue::Float(f))
            } else {
                Err(SyncError::InvalidData(format!(
                    "numeric value '{}' in record #{} of result set #{} is out of range",
                    name, row, set
                )))
            }
        }
        Value::String(s) => Ok(CellValue::Text(s)),
        _ => Err(SyncError::InvalidData(format!(
            "value '{}' in record #{} of result set #{} has an unsupported type",
            name, row, set
        ))),
    }
}

fn decode_date_cell(name: &str, row: usize, set: usize, value: Value) -> SyncResult<CellValue> {
    match value {
        Value::Null => Ok(CellValue::Null),
        Value::String(s) => {
            let dt = rehydrate_date(&s).ok_or_else(|| {
                SyncError::InvalidData(format!(
                    "invalid date in value '{}' in record #{} of result set #{}",
                    name, row, set
                ))
            })?;
            Ok(CellValue::DateTime(dt))
        }
        _ => Err(SyncError::InvalidData(format!(
            "date value '{}' in record #{} of result set #{} is not a string",
            name, row, set
        ))),
    }
}

/// Validate a wire date against the strict `YYYY-MM-DDTHH:MM:SS.mmmZ` pattern
/// and convert it to a local wall-clock date-time. The literal components are
/// kept as-is rather than re-interpreted as UTC.
pub fn rehydrate_date(s: &str) -> Option<NaiveDateTime> {
    let caps = DATE_RE.captures(s)?;
    let field = |i: usize| caps.get(i).unwrap().as_str().parse::<u32>().ok();
    let year = caps.get(1).unwrap().as_str().parse::<i32>().ok()?;
    NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?
        .and_hms_milli_opt(field(4)?, field(5)?, field(6)?, field(7)?)
}

/// Recognize a managed fault by its trailing in-band marker. Returns `None`
/// for infrastructure errors, which have no marker.
pub fn parse_managed_fault(body: &ServerErrorBody) -> Option<ServerFault> {
    debug_assert!(MANAGED_FAULT_TAG == "[APP]");
    let caps = MANAGED_RE.captures(&body.message)?;
    Some(ServerFault {
        statement: body.command_index,
        message: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        table: caps.get(2).map(|m| m.as_str().to_string()),
        column: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

pub fn decode_change_feed(payload: Value) -> SyncResult<ChangeFeed> {
    let Value::Object(mut payload) = payload else {
        return Err(SyncError::InvalidData("no event object received".to_string()));
    };
    let last_event_id = payload
        .remove("lastEventId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| SyncError::InvalidData("event payload carries no event cursor".to_string()))?;
    if last_event_id < 0 {
        return Err(SyncError::InvalidData("event cursor is negative".to_string()));
    }
    let Some(Value::Object(sources)) = payload.remove("events") else {
        return Err(SyncError::InvalidData("event collection is invalid".to_string()));
    };

    let mut events: ChangeEvents = HashMap::new();
    for (source_name, source) in sources {
        let Value::Object(entries) = source else {
            return Err(SyncError::InvalidData(format!(
                "event source '{}' is not an object",
                source_name
            )));
        };
        let mut rows = HashMap::with_capacity(entries.len());
        for (id_key, version) in entries {
            if !ROW_ID_KEY_RE.is_match(&id_key) {
                return Err(SyncError::InvalidData(format!(
                    "id '{}' of event source '{}' is not numeric",
                    id_key, source_name
                )));
            }
            let id: i64 = id_key.parse().map_err(|_| {
                SyncError::InvalidData(format!(
                    "id '{}' of event source '{}' is out of range",
                    id_key, source_name
                ))
            })?;
            let version = match version {
                Value::Null => None,
                Value::String(s) => Some(RowVersion::parse(&s).map_err(|_| {
                    SyncError::InvalidData(format!(
                        "version of event #{} in source '{}' is invalid",
                        id, source_name
                    ))
                })?),
                _ => {
                    return Err(SyncError::InvalidData(format!(
                        "version of event #{} in source '{}' is invalid",
                        id, source_name
                    )))
                }
            };
            rows.insert(id, version);
        }
        events.insert(source_name, rows);
    }

    Ok(ChangeFeed {
        last_event_id,
        events,
    })
}
