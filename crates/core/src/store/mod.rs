//! Schema migrations and the SQLite-backed [`Storage`] type.

mod migrations;
mod sqlite;

pub use migrations::{Migration, MIGRATIONS};
pub use sqlite::{
    sanitize_fts5_query, CategoryStat, ListQuery, SortField, SortOrder, Storage, StoreError,
};
