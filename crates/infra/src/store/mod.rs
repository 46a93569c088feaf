//! In-memory transactional storage behind the ORM cursor.

mod database;
mod error;
mod filter;
mod schema;
mod snapshot;
mod table;

pub use database::{Cursor, Database, Savepoint, Values};
pub use error::{StoreError, StoreResult};
pub use filter::{CmpOp, Col, Filter, OrderBy, like_match};
pub use schema::{
    ColumnDef, ColumnType, ForeignKey, OnDelete, SchemaChange, TableDef, UniqueConstraint,
    quote_ident,
};
pub use snapshot::{DatabaseState, FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};
pub use table::{Row, Table};
