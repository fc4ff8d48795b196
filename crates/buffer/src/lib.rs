//! Materialized query result buffers with keyset pagination.
//!
//! Filtering and sorting a large media library is expensive; paging through
//! the result with `OFFSET` makes it worse with every page. This crate runs
//! the expensive query once per distinct filter, freezes the ordered result
//! into its own indexed SQLite table (a *buffer*), and serves pages out of
//! that table by keyset cursor.
//!
//! # Architecture
//! - **Criteria** ([`FilterCriteria`]) are normalized value types whose
//!   canonical form is digested into a [`FilterHash`], the identity of a
//!   buffer.
//! - **Buffers** are built from a [`RecordSource`](source::RecordSource)
//!   into a staging table and published atomically through the registry.
//!   A buffer is never modified after publishing; a rebuild produces a new
//!   table and swaps the registry pointer.
//! - **Eviction** keeps the number and estimated size of buffers within the
//!   configured bounds, least recently used first.
//! - **Active filters** remember the last filter applied per session,
//!   independently of whether its buffer still exists.
//!
//! Everything is reached through [`BufferService`].
//!
//! The database is a cache: deleting it loses nothing but build time.

mod active;
mod criteria;
mod db;
pub mod error;
mod eviction;
mod health;
mod models;
mod page;
pub mod record;
mod registry;
mod service;
pub mod source;
mod store;

pub use crate::active::{ActiveFilter, ActiveFilterView, DEFAULT_SESSION};
pub use crate::criteria::{FILTER_HASH_LEN, FilterCriteria, FilterHash, NsfwMode, RawCriteria, SortDirection, SortField};
pub use crate::db::Database;
pub use crate::eviction::EvictionPolicy;
pub use crate::health::SourceStatus;
pub use crate::page::{Cursor, Page, PageOptions};
pub use crate::registry::RegistryEntry;
pub use crate::service::{BufferService, BufferStats, BufferSummary, EntryStats, ServiceOptions};
pub use crate::store::BuildOptions;
