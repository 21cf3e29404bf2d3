//! Wire model of the query and change-feed endpoints.

pub mod decode;
pub mod types;

pub use decode::{decode_change_feed, decode_query_payload, parse_managed_fault, QueryOutcome};
pub use types::{
    CellValue, ChangeEvents, ChangeFeed, ColumnMeta, Record, ResultSet, RowVersion,
    ServerErrorBody, ID_COLUMN, ID_FIELD, MANAGED_FAULT_TAG, VERSION_COLUMN, VERSION_FIELD,
};
