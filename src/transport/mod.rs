//! Transport seam between the sync engine and the server endpoints.
//!
//! The engine never talks HTTP directly; it goes through [`Transport`], which
//! tests replace with in-process fakes.

mod http;

pub use http::{HttpTransport, HttpTransportBuilder};

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::protocol::{ChangeFeed, QueryOutcome};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one parameterized statement to the query endpoint. Parameter
    /// values are already encoded as text.
    async fn query(
        &self,
        statement: &str,
        parameters: &[(String, String)],
    ) -> SyncResult<QueryOutcome>;

    /// Long-poll the change-feed endpoint for events after `last_event_id`.
    async fn poll_changes(&self, last_event_id: i64) -> SyncResult<ChangeFeed>;
}
