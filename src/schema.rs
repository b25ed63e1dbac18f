//! Schema entities: data types, column metadata ([`ColumnPage`]), per-table
//! column layout ([`TableSchema`]) and the per-database table/view registry
//! ([`DatabaseSchema`]).
//!
//! All schema state is persisted immediately on mutation as fixed-width
//! binary records; there are no in-memory-only writes.

use std::sync::{Arc, Mutex};

use crate::errors::{StorageError, StorageResult};
use crate::filesystem::Filesystem;

/// Column data types understood by the engine.
///
/// The numeric code is the persisted representation and must stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Year,
    Date,
    Time,
    DateTime,
    Timestamp,
    Char,
    Varchar,
    Text,
    Blob,
}

impl DataType {
    pub(crate) fn code(self) -> u8 {
        match self {
            DataType::Bool => 1,
            DataType::TinyInt => 2,
            DataType::SmallInt => 3,
            DataType::Int => 4,
            DataType::BigInt => 5,
            DataType::Float => 6,
            DataType::Double => 7,
            DataType::Decimal => 8,
            DataType::Year => 9,
            DataType::Date => 10,
            DataType::Time => 11,
            DataType::DateTime => 12,
            DataType::Timestamp => 13,
            DataType::Char => 14,
            DataType::Varchar => 15,
            DataType::Text => 16,
            DataType::Blob => 17,
        }
    }

    pub(crate) fn from_code(code: u8) -> StorageResult<Self> {
        Ok(match code {
            1 => DataType::Bool,
            2 => DataType::TinyInt,
            3 => DataType::SmallInt,
            4 => DataType::Int,
            5 => DataType::BigInt,
            6 => DataType::Float,
            7 => DataType::Double,
            8 => DataType::Decimal,
            9 => DataType::Year,
            10 => DataType::Date,
            11 => DataType::Time,
            12 => DataType::DateTime,
            13 => DataType::Timestamp,
            14 => DataType::Char,
            15 => DataType::Varchar,
            16 => DataType::Text,
            17 => DataType::Blob,
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "unknown data-type code {other}"
                )))
            }
        })
    }

    /// Length applied when the column declares none.
    pub fn default_length(self) -> u32 {
        match self {
            DataType::Decimal => 10,
            DataType::Char | DataType::Varchar => 255,
            DataType::Text | DataType::Blob => 1024,
            _ => 0,
        }
    }

    /// Fixed payload width in bytes for a cell of this type, excluding the
    /// presence byte. Pure in (type, length, second_length) so page
    /// boundaries are reproducible without reading any page file.
    pub fn byte_length(self, length: u32, second_length: u32) -> u32 {
        let length = if length == 0 {
            self.default_length()
        } else {
            length
        };
        match self {
            DataType::Bool | DataType::TinyInt => 1,
            DataType::SmallInt | DataType::Year => 2,
            DataType::Int | DataType::Float => 4,
            DataType::BigInt | DataType::Double | DataType::Timestamp => 8,
            //  Decimal cells hold sign, digits and the separator as text.
            DataType::Decimal => length + second_length + 2,
            DataType::Date => 10,
            DataType::Time => 8,
            DataType::DateTime => 19,
            DataType::Char | DataType::Varchar | DataType::Text | DataType::Blob => length,
        }
    }

    /// Whether cells of this type participate in row-level reads and the
    /// row cache. Large out-of-line types are fetched per cell instead.
    pub fn is_row_cached(self) -> bool {
        !matches!(self, DataType::Text | DataType::Blob)
    }

    /// Whether a default value for this type must be re-resolved on every
    /// insert (e.g. `CURRENT_TIMESTAMP`) instead of once at column creation.
    pub fn must_resolve_default_at_insert(self) -> bool {
        matches!(self, DataType::Timestamp | DataType::DateTime)
    }
}

/// Pre-resolved or deferred default value of a column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultValue {
    None,
    /// Resolved once at column creation, stored as the cell payload.
    Binary(Vec<u8>),
    /// Raw text, re-resolved on every insert.
    Unresolved(String),
}

pub(crate) const COLUMN_RECORD_SIZE: usize = 256;
const COLUMN_NAME_CAP: usize = 64;
const COLUMN_DEFAULT_CAP: usize = 170;

/// Persisted metadata of one column: name, type, optional lengths, bit
/// flags and default value. One fixed-width record per column in the table
/// schema file; the record ordinal is the column index.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnPage {
    pub name: String,
    pub data_type: DataType,
    pub length: u32,
    pub second_length: u32,
    pub flags: u8,
    pub default_value: DefaultValue,
}

impl ColumnPage {
    pub const FLAG_AUTO_INCREMENT: u8 = 1 << 0;
    pub const FLAG_NOT_NULL: u8 = 1 << 1;
    pub const FLAG_PRIMARY_KEY: u8 = 1 << 2;
    pub const FLAG_UNIQUE_KEY: u8 = 1 << 3;
    pub const FLAG_UNSIGNED: u8 = 1 << 4;
    pub const FLAG_ZEROFILL: u8 = 1 << 5;

    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            length: 0,
            second_length: 0,
            flags: 0,
            default_value: DefaultValue::None,
        }
    }

    /// Payload width of one cell of this column.
    pub fn payload_size(&self) -> u32 {
        self.data_type.byte_length(self.length, self.second_length)
    }

    /// Full cell width: one presence byte plus the payload. The presence
    /// byte is zero for null cells, so existence checks read one byte.
    pub fn cell_size(&self) -> u32 {
        1 + self.payload_size()
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags & Self::FLAG_PRIMARY_KEY != 0
    }

    pub fn is_auto_increment(&self) -> bool {
        self.flags & Self::FLAG_AUTO_INCREMENT != 0
    }

    pub fn is_not_null(&self) -> bool {
        self.flags & Self::FLAG_NOT_NULL != 0
    }

    pub(crate) fn encode(&self) -> StorageResult<[u8; COLUMN_RECORD_SIZE]> {
        let mut record = [0u8; COLUMN_RECORD_SIZE];
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > COLUMN_NAME_CAP {
            return Err(StorageError::InvalidArgument(format!(
                "column name '{}' exceeds {COLUMN_NAME_CAP} bytes or is empty",
                self.name
            )));
        }
        record[0] = name.len() as u8;
        record[1..1 + name.len()].copy_from_slice(name);
        record[65] = self.data_type.code();
        record[66] = self.flags;
        record[67..71].copy_from_slice(&self.length.to_be_bytes());
        record[71..75].copy_from_slice(&self.second_length.to_be_bytes());
        let (kind, default_bytes): (u8, &[u8]) = match &self.default_value {
            DefaultValue::None => (0, &[]),
            DefaultValue::Binary(bytes) => (1, bytes),
            DefaultValue::Unresolved(text) => (2, text.as_bytes()),
        };
        if default_bytes.len() > COLUMN_DEFAULT_CAP {
            return Err(StorageError::InvalidArgument(format!(
                "default value of column '{}' exceeds {COLUMN_DEFAULT_CAP} bytes",
                self.name
            )));
        }
        record[75] = kind;
        record[76..78].copy_from_slice(&(default_bytes.len() as u16).to_be_bytes());
        record[78..78 + default_bytes.len()].copy_from_slice(default_bytes);
        Ok(record)
    }

    pub(crate) fn decode(record: &[u8]) -> StorageResult<Self> {
        if record.len() < COLUMN_RECORD_SIZE {
            return Err(StorageError::InvalidArgument(
                "truncated column record".to_string(),
            ));
        }
        let name_len = record[0] as usize;
        if name_len == 0 || name_len > COLUMN_NAME_CAP {
            return Err(StorageError::InvalidArgument(
                "corrupt column record: bad name length".to_string(),
            ));
        }
        let name = String::from_utf8(record[1..1 + name_len].to_vec())
            .map_err(|_| StorageError::InvalidArgument("corrupt column name".to_string()))?;
        let data_type = DataType::from_code(record[65])?;
        let flags = record[66];
        let length = u32::from_be_bytes(record[67..71].try_into().expect("4-byte slice"));
        let second_length = u32::from_be_bytes(record[71..75].try_into().expect("4-byte slice"));
        let default_len = u16::from_be_bytes(record[76..78].try_into().expect("2-byte slice")) as usize;
        if default_len > COLUMN_DEFAULT_CAP {
            return Err(StorageError::InvalidArgument(
                "corrupt column record: bad default length".to_string(),
            ));
        }
        let default_bytes = record[78..78 + default_len].to_vec();
        let default_value = match record[75] {
            0 => DefaultValue::None,
            1 => DefaultValue::Binary(default_bytes),
            2 => DefaultValue::Unresolved(
                String::from_utf8(default_bytes).map_err(|_| {
                    StorageError::InvalidArgument("corrupt default value".to_string())
                })?,
            ),
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "corrupt column record: default kind {other}"
                )))
            }
        };
        Ok(Self {
            name,
            data_type,
            length,
            second_length,
            flags,
            default_value,
        })
    }
}

/// Column definition as it arrives from the statement layer (`CREATE TABLE`
/// / `ALTER TABLE`), before conversion into a persisted [`ColumnPage`].
#[derive(Clone, Debug)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub length: Option<u32>,
    pub second_length: Option<u32>,
    pub is_auto_increment: bool,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub is_unsigned: bool,
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            length: None,
            second_length: None,
            is_auto_increment: false,
            is_nullable: true,
            is_primary_key: false,
            is_unique: false,
            is_unsigned: false,
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default_value = Some(default.to_string());
        self
    }
}

/// Secondary-index declaration stored in the table's index-schema file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPage {
    pub name: String,
    pub column_id: usize,
}

const INDEX_RECORD_SIZE: usize = 72;

impl IndexPage {
    fn encode(&self) -> StorageResult<[u8; INDEX_RECORD_SIZE]> {
        let mut record = [0u8; INDEX_RECORD_SIZE];
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > COLUMN_NAME_CAP {
            return Err(StorageError::InvalidArgument(format!(
                "index name '{}' exceeds {COLUMN_NAME_CAP} bytes or is empty",
                self.name
            )));
        }
        record[0] = name.len() as u8;
        record[1..1 + name.len()].copy_from_slice(name);
        record[65..69].copy_from_slice(&(self.column_id as u32).to_be_bytes());
        Ok(record)
    }

    fn decode(record: &[u8]) -> StorageResult<Self> {
        let name_len = record[0] as usize;
        if name_len == 0 || name_len > COLUMN_NAME_CAP {
            return Err(StorageError::InvalidArgument(
                "corrupt index record".to_string(),
            ));
        }
        let name = String::from_utf8(record[1..1 + name_len].to_vec())
            .map_err(|_| StorageError::InvalidArgument("corrupt index name".to_string()))?;
        let column_id = u32::from_be_bytes(record[65..69].try_into().expect("4-byte slice")) as usize;
        Ok(Self { name, column_id })
    }
}

/// Ordered column metadata for one table.
///
/// Invariant: column order is stable; the column index is a dense integer
/// key into the record sequence. Column names are unique within the table.
pub struct TableSchema {
    filesystem: Arc<dyn Filesystem>,
    path: String,
    index_path: String,
    table_name: String,
    columns: Vec<ColumnPage>,
    index_pages: Vec<IndexPage>,
    database_schema: Option<Arc<Mutex<DatabaseSchema>>>,
}

impl TableSchema {
    pub fn load(
        filesystem: Arc<dyn Filesystem>,
        path: String,
        index_path: String,
        table_name: String,
    ) -> StorageResult<Self> {
        let mut columns = Vec::new();
        {
            let mut file = filesystem.open(&path)?;
            let bytes = file.read_all()?;
            for record in bytes.chunks_exact(COLUMN_RECORD_SIZE) {
                columns.push(ColumnPage::decode(record)?);
            }
        }
        let mut index_pages = Vec::new();
        {
            let mut file = filesystem.open(&index_path)?;
            let bytes = file.read_all()?;
            for record in bytes.chunks_exact(INDEX_RECORD_SIZE) {
                index_pages.push(IndexPage::decode(record)?);
            }
        }
        Ok(Self {
            filesystem,
            path,
            index_path,
            table_name,
            columns,
            index_pages,
            database_schema: None,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Attach the owning database schema. Re-done on every registry lookup
    /// so swapped database schema objects propagate.
    pub fn set_database_schema(&mut self, schema: Arc<Mutex<DatabaseSchema>>) {
        self.database_schema = Some(schema);
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, column_id: usize) -> Option<&ColumnPage> {
        self.columns.get(column_id)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn columns(&self) -> &[ColumnPage] {
        &self.columns
    }

    /// (column id, column) pairs of the declared primary-key columns, in
    /// column order.
    pub fn primary_key_columns(&self) -> Vec<(usize, ColumnPage)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key())
            .map(|(id, c)| (id, c.clone()))
            .collect()
    }

    /// Ids of the columns participating in row-level reads and the row
    /// cache.
    pub fn cached_column_ids(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.data_type.is_row_cached())
            .map(|(id, _)| id)
            .collect()
    }

    /// Append a column record; returns the new column index.
    pub fn add_column_page(&mut self, column: ColumnPage) -> StorageResult<usize> {
        let record = column.encode()?;
        let column_id = self.columns.len();
        let mut file = self.filesystem.open(&self.path)?;
        file.write_all_at((column_id * COLUMN_RECORD_SIZE) as u64, &record)?;
        self.columns.push(column);
        Ok(column_id)
    }

    /// Rewrite an existing column record in place, preserving its index.
    pub fn write_column(&mut self, column_id: usize, column: ColumnPage) -> StorageResult<()> {
        if column_id >= self.columns.len() {
            return Err(StorageError::NotFound(format!(
                "column #{column_id} of table '{}'",
                self.table_name
            )));
        }
        let record = column.encode()?;
        let mut file = self.filesystem.open(&self.path)?;
        file.write_all_at((column_id * COLUMN_RECORD_SIZE) as u64, &record)?;
        self.columns[column_id] = column;
        Ok(())
    }

    pub fn index_pages(&self) -> &[IndexPage] {
        &self.index_pages
    }

    pub fn add_index_page(&mut self, index: IndexPage) -> StorageResult<()> {
        let record = index.encode()?;
        let mut file = self.filesystem.open(&self.index_path)?;
        file.write_all_at((self.index_pages.len() * INDEX_RECORD_SIZE) as u64, &record)?;
        self.index_pages.push(index);
        Ok(())
    }
}

/// Kind tag of a [`DatabaseSchema`] registry slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    Free,
    Table,
    View,
}

#[derive(Clone, Debug)]
struct SchemaEntry {
    kind: EntryKind,
    name: String,
}

const ENTRY_RECORD_SIZE: usize = 72;
const ENTRY_NAME_CAP: usize = 64;

/// Table/view registry of one database.
///
/// The slot ordinal is the stable table (or view) index used to key table
/// schema files; unregistering tombstones the slot instead of shifting the
/// entries behind it.
pub struct DatabaseSchema {
    filesystem: Arc<dyn Filesystem>,
    path: String,
    id: String,
    entries: Vec<SchemaEntry>,
}

impl DatabaseSchema {
    pub fn load(
        filesystem: Arc<dyn Filesystem>,
        path: String,
        id: String,
    ) -> StorageResult<Self> {
        let mut entries = Vec::new();
        {
            let mut file = filesystem.open(&path)?;
            let bytes = file.read_all()?;
            for record in bytes.chunks_exact(ENTRY_RECORD_SIZE) {
                entries.push(Self::decode_entry(record)?);
            }
        }
        Ok(Self {
            filesystem,
            path,
            id,
            entries,
        })
    }

    fn decode_entry(record: &[u8]) -> StorageResult<SchemaEntry> {
        let kind = match record[0] {
            0 => EntryKind::Free,
            1 => EntryKind::Table,
            2 => EntryKind::View,
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "corrupt schema entry kind {other}"
                )))
            }
        };
        let name_len = record[1] as usize;
        if name_len > ENTRY_NAME_CAP {
            return Err(StorageError::InvalidArgument(
                "corrupt schema entry name".to_string(),
            ));
        }
        let name = String::from_utf8(record[2..2 + name_len].to_vec())
            .map_err(|_| StorageError::InvalidArgument("corrupt schema entry name".to_string()))?;
        Ok(SchemaEntry { kind, name })
    }

    fn persist_entry(&self, slot: usize) -> StorageResult<()> {
        let entry = &self.entries[slot];
        let mut record = [0u8; ENTRY_RECORD_SIZE];
        record[0] = match entry.kind {
            EntryKind::Free => 0,
            EntryKind::Table => 1,
            EntryKind::View => 2,
        };
        let name = entry.name.as_bytes();
        if name.len() > ENTRY_NAME_CAP {
            return Err(StorageError::InvalidArgument(format!(
                "name '{}' exceeds {ENTRY_NAME_CAP} bytes",
                entry.name
            )));
        }
        record[1] = name.len() as u8;
        record[2..2 + name.len()].copy_from_slice(name);
        let mut file = self.filesystem.open(&self.path)?;
        file.write_all_at((slot * ENTRY_RECORD_SIZE) as u64, &record)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn find(&self, kind: EntryKind, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.kind == kind && e.name == name)
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.find(EntryKind::Table, name).is_some()
    }

    pub fn table_index(&self, name: &str) -> Option<usize> {
        self.find(EntryKind::Table, name)
    }

    pub fn view_index(&self, name: &str) -> Option<usize> {
        self.find(EntryKind::View, name)
    }

    pub fn table_name(&self, index: usize) -> Option<&str> {
        self.entries
            .get(index)
            .filter(|e| e.kind == EntryKind::Table)
            .map(|e| e.name.as_str())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Table)
            .map(|e| e.name.clone())
            .collect()
    }

    fn register(&mut self, kind: EntryKind, name: &str) -> StorageResult<usize> {
        if self.find(kind, name).is_some() {
            let what = if kind == EntryKind::Table { "table" } else { "view" };
            return Err(StorageError::AlreadyExists(format!("{what} '{name}'")));
        }
        //  Slots are never reused: a tombstoned index may still have stale
        //  table files on disk keyed by it.
        let slot = self.entries.len();
        self.entries.push(SchemaEntry {
            kind,
            name: name.to_string(),
        });
        self.persist_entry(slot)?;
        Ok(slot)
    }

    pub fn register_table(&mut self, name: &str) -> StorageResult<usize> {
        self.register(EntryKind::Table, name)
    }

    pub fn register_view(&mut self, name: &str) -> StorageResult<usize> {
        self.register(EntryKind::View, name)
    }

    pub fn unregister_table(&mut self, name: &str) -> StorageResult<()> {
        let slot = self
            .find(EntryKind::Table, name)
            .ok_or_else(|| StorageError::NotFound(format!("table '{name}'")))?;
        self.entries[slot].kind = EntryKind::Free;
        self.entries[slot].name.clear();
        self.persist_entry(slot)
    }
}
