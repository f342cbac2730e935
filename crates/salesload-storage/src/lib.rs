//! Storage for the sales loader: file lifecycle areas on disk and the relational sales store.

pub mod lifecycle;
pub mod memory;
pub mod postgres;
pub mod store;

pub use lifecycle::{ClaimedFile, IncomingFile, LifecycleAreas, LifecycleError, ReleasedClaims};
pub use memory::{MemorySalesStore, StoredLine};
pub use postgres::{PgSalesStore, MIGRATOR};
pub use store::{SalesStore, StoreCounts};
