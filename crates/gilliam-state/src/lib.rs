//! gilliam-state — scheduler records and their embedded store.
//!
//! Backed by [redb](https://docs.rs/redb). Nodes, work units and leases are
//! JSON-serialized into `&[u8]` value columns keyed by their identifiers.
//!
//! Every scheduler state transition is written through [`StateStore::apply`]
//! as a single transaction, so a restart always sees a lease together with
//! the unit and node it references.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{Mutation, PersistedState, StateStore};
pub use types::*;
