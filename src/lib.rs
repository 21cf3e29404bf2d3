//! LiveTable
//!
//! Client-side data synchronization engine: parameterized commands with a
//! reviewable lifecycle, a long-poll notification bus, and live table mirrors
//! that reconcile local edits with server-pushed version updates.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use livetable::{CommandExecutor, HttpTransportBuilder, NotificationBus, Table};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), livetable::SyncError> {
//!     let transport = Arc::new(
//!         HttpTransportBuilder::new("http://localhost:8080/api")
//!             .bearer_token("secret")
//!             .build()?,
//!     );
//!
//!     let executor = Arc::new(CommandExecutor::new(transport.clone()));
//!     let bus = NotificationBus::start(transport);
//!
//!     let orders = Table::open(executor, &bus, "Orders", Some("Status < 5"))?;
//!     orders.ready().await?;
//!
//!     for row in orders.rows()? {
//!         println!("#{}: {:?}", row.id(), row.get("Subject"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod command;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod table;
pub mod transport;

pub use cancel::CancelToken;
pub use command::{Command, CommandExecutor, CommandState, Statement};
pub use error::{ServerFault, SyncError, SyncResult};
pub use notify::{NotificationBus, Subscription, SubscriptionId};
pub use protocol::{CellValue, ColumnMeta, Record, ResultSet, RowVersion};
pub use table::{ListenerHandle, Row, RowId, Table};
pub use transport::{HttpTransport, HttpTransportBuilder, Transport};
