//! File-backed column-oriented table storage.
//!
//! Data lives under one root directory: a `schemata/` registry of
//! databases, and per database a tree of table schema files, column page
//! files, a deleted-row ledger, an auto-increment counter, view SQL and
//! secondary-index files. [`FlatDb`] wires the pieces together; most
//! callers go through it, grab the [`SchemaManager`] for DDL and open a
//! [`Table`] per table for row traffic.

use std::path::Path;
use std::sync::{Arc, Mutex};

mod column_data;
mod data_converter;
mod errors;
mod filesystem;
mod index;
mod schema;
mod schema_manager;
mod table;
mod value_resolver;

#[cfg(test)]
mod test_utils;

pub use column_data::{rows_per_page, ColumnData, BYTES_PER_PAGE};
pub use data_converter::DataConverter;
pub use errors::{StorageError, StorageResult};
pub use filesystem::{DbFile, FileLockGuard, FilePaths, Filesystem, LockMode, RealFilesystem};
pub use index::Index;
pub use schema::{
    ColumnDefinition, ColumnPage, DataType, DatabaseSchema, DefaultValue, IndexPage, TableSchema,
};
pub use schema_manager::{validate_database_id, SchemaManager};
pub use table::{ColumnId, RowData, RowId, Table};
pub use value_resolver::ValueResolver;

/// The storage engine: a filesystem root plus the schema registry built on
/// top of it. The handle is cheap to share; table handles opened from it
/// carry their own cursors.
pub struct FlatDb {
    schema_manager: Arc<Mutex<SchemaManager>>,
}

impl FlatDb {
    /// Open (or initialize) an engine rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let filesystem: Arc<dyn Filesystem> = Arc::new(RealFilesystem::new(path)?);
        Ok(Self {
            schema_manager: Arc::new(Mutex::new(SchemaManager::new(filesystem))),
        })
    }

    pub fn schema_manager(&self) -> Arc<Mutex<SchemaManager>> {
        Arc::clone(&self.schema_manager)
    }

    /// Create a table in the current database.
    pub fn create_table(&self, name: &str, columns: &[ColumnDefinition]) -> StorageResult<usize> {
        self.schema_manager
            .lock()
            .unwrap()
            .create_table(name, columns, None)
    }

    /// Open a row lifecycle manager over a table of the current database.
    /// Each call returns an independent handle with its own cursor.
    pub fn open_table(&self, name: &str) -> StorageResult<Table> {
        Table::open(Arc::clone(&self.schema_manager), name, None)
    }
}

#[cfg(test)]
mod flatdb_tests {
    use super::*;
    use crate::test_utils::TestDir;

    #[test]
    fn engine_round_trip_over_reopen() {
        let dir = TestDir::new_unique("flatdb_engine");

        {
            let db = FlatDb::new(&dir).unwrap();
            db.create_table(
                "orders",
                &[
                    ColumnDefinition::new("id", DataType::BigInt).primary_key(),
                    ColumnDefinition::new("amount", DataType::Int),
                ],
            )
            .unwrap();

            let mut orders = db.open_table("orders").unwrap();
            let row = orders
                .convert_string_row_to_data_row(
                    &[(0, Some("7".to_string())), (1, Some("70".to_string()))]
                        .into_iter()
                        .collect(),
                )
                .unwrap();
            let row: RowData = row
                .into_iter()
                .filter_map(|(id, v)| v.map(|v| (id, v)))
                .collect();
            assert_eq!(orders.add_row_data(&row).unwrap(), 0);
        }

        //  A fresh engine over the same directory sees the data.
        let db = FlatDb::new(&dir).unwrap();
        let mut orders = db.open_table("orders").unwrap();
        assert_eq!(orders.row_count().unwrap(), 1);

        let row = orders.get_row_data(Some(0)).unwrap();
        let strings = orders.convert_data_row_to_string_row(&row).unwrap();
        assert_eq!(strings[&1].as_deref(), Some("70"));
    }

    #[test]
    fn independent_table_handles_have_independent_cursors() {
        let dir = TestDir::new_unique("flatdb_engine");
        let db = FlatDb::new(&dir).unwrap();
        db.create_table(
            "t",
            &[ColumnDefinition::new("id", DataType::Int).primary_key()],
        )
        .unwrap();

        let mut writer = db.open_table("t").unwrap();
        for n in 0..2u64 {
            let payload = DataConverter::new()
                .string_to_binary(&n.to_string(), DataType::Int, 0, 0)
                .unwrap();
            writer.set_cell_data(n, 0, &payload).unwrap();
        }

        let mut a = db.open_table("t").unwrap();
        let mut b = db.open_table("t").unwrap();
        a.rewind().unwrap();
        a.advance().unwrap();
        b.rewind().unwrap();
        assert_eq!(a.tell(), Some(1));
        assert_eq!(b.tell(), Some(0));
    }
}
