//! Canonical store for the hit ledger.
//!
//! The store is a plain relational catalog: resources keyed by URL (not unique),
//! hits keyed by request id (unique once bootstrapped), and an open set of
//! dependent record kinds pointing at resources. All mutations go through a
//! [`UnitOfWork`], one transaction each.

pub mod bootstrap;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod store;

pub use bootstrap::BootstrapReport;
pub use error::{Result, StoreError};
pub use memory::{MemoryHit, MemoryStore, MemoryUnit};
pub use postgres::{PgStore, PgUnit};
pub use registry::{KindRegistry, HITS_TABLE};
pub use store::{Bootstrap, CanonicalStore, HitInsert, UnitOfWork};
