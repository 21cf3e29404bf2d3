use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// In-band marker that distinguishes a managed (application-raised) server
/// fault from an infrastructure error. Managed error messages end in
/// `... [APP][table][column]` with the column part optional.
pub const MANAGED_FAULT_TAG: &str = "[APP]";

/// Name of the reserved identity column. Always the first column a table
/// metadata query returns.
pub const ID_COLUMN: &str = "ID";

/// Name of the reserved version column. Always the last column a table
/// metadata query returns.
pub const VERSION_COLUMN: &str = "Version";

/// Reserved field carrying the row identity in row wire payloads.
pub const ID_FIELD: &str = "$id";

/// Reserved field carrying the row version in row wire payloads.
pub const VERSION_FIELD: &str = "$version";

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9A-F]{16}$").unwrap());

/// Characters kept verbatim when percent-encoding string parameters. Matches
/// the unreserved set of RFC 3986 plus the sub-delims the query endpoint
/// round-trips unchanged.
const PARAM_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*');

/// An opaque 8-byte row version rendered as a fixed-format hex string.
///
/// The fixed width makes lexicographic order agree with numeric order, so the
/// derived `Ord` is the total order the reconciliation algorithm relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVersion(String);

impl RowVersion {
    pub fn parse(s: &str) -> SyncResult<Self> {
        if !VERSION_RE.is_match(s) {
            return Err(SyncError::InvalidData(format!("invalid row version '{}'", s)));
        }
        Ok(Self(s.to_string()))
    }

    /// The version of a row that has never been persisted.
    pub fn zero() -> Self {
        Self("0x0000000000000000".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single cell value. The enum is closed: every value a statement parameter
/// or a decoded row cell can hold is one of these variants, so no runtime
/// type scanning is needed.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A date-valued cell, held as local wall-clock time.
    DateTime(NaiveDateTime),
}

impl CellValue {
    /// Encode the value as parameter text for the query endpoint.
    pub fn encode_param(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(true) => "1".to_string(),
            CellValue::Bool(false) => "0".to_string(),
            CellValue::Int(n) => n.to_string(),
            CellValue::Float(n) => n.to_string(),
            CellValue::Text(s) => utf8_percent_encode(s, PARAM_ESCAPE).to_string(),
            // Wall-clock time serialized with the UTC suffix the endpoint
            // expects; no timezone conversion is applied.
            CellValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CellValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Truthiness of the flag columns the metadata query returns, which
    /// arrive either as booleans or as 0/1 integers.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            CellValue::Int(n) => Some(*n != 0),
            _ => None,
        }
    }
}

/// One decoded record, keyed by column name.
pub type Record = BTreeMap<String, CellValue>;

/// One decoded result set of a query response.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub affected_rows: i64,
    pub rows: Vec<Record>,
}

/// The error object a query response carries instead of result sets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorBody {
    pub command_index: i64,
    pub message: String,
}

/// Validated change-feed events: source name to row id to announced version.
/// A `None` version means "deleted or unknown, must re-check".
pub type ChangeEvents = HashMap<String, HashMap<i64, Option<RowVersion>>>;

/// One validated change-feed response.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    pub last_event_id: i64,
    pub events: ChangeEvents,
}

/// Descriptor of one visible table column, decoded from the metadata query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub id: i64,
    pub name: String,
    pub column_type: String,
    pub max_length: i64,
    pub precision: i64,
    pub scale: i64,
    pub required: bool,
    pub has_default: bool,
    pub read_only: bool,
    pub referenced_table: Option<String>,
}
