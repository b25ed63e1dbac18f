//! Row Lifecycle Manager: maps logical rows onto column-oriented page
//! files, recycles row ids through the deleted-row ledger, maintains the
//! auto-increment counter and exposes a stateful cursor over live rows.
//!
//! A row is never materialized on disk: it is the tuple of cell values at
//! one row id across all column page files. A row id is live iff at least
//! one primary-key cell at that id is non-null; tables without primary-key
//! columns cannot answer existence or count questions and surface
//! [`StorageError::Unsupported`].
//!
//! Cross-process discipline: only the ledger is file-locked. Column-page
//! writes and counter advances race across processes, so callers must keep
//! a single writer per table (or hold an external per-table lock around
//! write sequences).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::column_data::{rows_per_page, ColumnData};
use crate::data_converter::DataConverter;
use crate::errors::{StorageError, StorageResult};
use crate::filesystem::{FileLockGuard, FilePaths, Filesystem, LockMode};
use crate::index::Index;
use crate::schema::{ColumnDefinition, ColumnPage, DefaultValue, TableSchema};
use crate::schema_manager::SchemaManager;
use crate::value_resolver::ValueResolver;

pub type RowId = u64;
pub type ColumnId = usize;

/// Cell payloads keyed by column id, as supplied to writes.
pub type RowData = HashMap<ColumnId, Vec<u8>>;

const DELETED_ROWS_RECORD_SIZE: u64 = 16;
const ROW_CACHE_SIZE: usize = 256;

/// Build the persisted column metadata out of a statement-level column
/// definition, resolving the default value now unless the data type
/// requires insertion-time resolution (then the raw text is kept and
/// re-resolved on every insert).
pub(crate) fn column_page_from_definition(
    definition: &ColumnDefinition,
    resolver: &ValueResolver,
    converter: &DataConverter,
) -> StorageResult<ColumnPage> {
    let mut column = ColumnPage::new(&definition.name, definition.data_type);
    if let Some(length) = definition.length {
        column.length = length;
    }
    if let Some(second_length) = definition.second_length {
        column.second_length = second_length;
    }

    let mut flags = 0u8;
    if definition.is_auto_increment {
        flags |= ColumnPage::FLAG_AUTO_INCREMENT;
    }
    if !definition.is_nullable {
        flags |= ColumnPage::FLAG_NOT_NULL;
    }
    if definition.is_primary_key {
        flags |= ColumnPage::FLAG_PRIMARY_KEY;
    }
    if definition.is_unique {
        flags |= ColumnPage::FLAG_UNIQUE_KEY;
    }
    if definition.is_unsigned {
        flags |= ColumnPage::FLAG_UNSIGNED;
    }
    column.flags = flags;

    column.default_value = match &definition.default_value {
        None => DefaultValue::None,
        Some(raw) => {
            if definition.data_type.must_resolve_default_at_insert() {
                DefaultValue::Unresolved(raw.clone())
            } else {
                let resolved = resolver.resolve(raw)?;
                DefaultValue::Binary(converter.string_to_binary(
                    &resolved,
                    column.data_type,
                    column.length,
                    column.second_length,
                )?)
            }
        }
    };
    Ok(column)
}

/// Cursor over live row ids. Exactly one per [`Table`] instance; multiple
/// cursors over the same table need separate `Table` instances sharing the
/// registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CursorState {
    Unpositioned,
    Positioned(RowId),
    Exhausted,
}

pub struct Table {
    schema_manager: Arc<Mutex<SchemaManager>>,
    filesystem: Arc<dyn Filesystem>,
    value_resolver: ValueResolver,
    data_converter: DataConverter,
    schema_id: String,
    table_name: String,
    table_id: usize,
    table_schema: Arc<Mutex<TableSchema>>,
    column_data_cache: HashMap<(ColumnId, u64), ColumnData>,
    row_cache: HashMap<RowId, HashMap<ColumnId, Option<Vec<u8>>>>,
    indices: HashMap<String, Index>,
    cursor: CursorState,
}

impl Table {
    /// Open the lifecycle manager for a registered table. Fails with
    /// [`StorageError::NotFound`] when the table is not in the database
    /// schema.
    pub fn open(
        schema_manager: Arc<Mutex<SchemaManager>>,
        table_name: &str,
        schema_id: Option<&str>,
    ) -> StorageResult<Self> {
        let (filesystem, schema_id, table_schema, table_id) = {
            let mut manager = schema_manager.lock().unwrap();
            let schema_id = schema_id
                .unwrap_or(manager.current_database_id())
                .to_string();
            let table_schema = manager
                .get_table_schema(table_name, Some(&schema_id))?
                .ok_or_else(|| {
                    StorageError::NotFound(format!(
                        "table '{table_name}' in database '{schema_id}'"
                    ))
                })?;
            let database_schema = manager.get_schema(Some(&schema_id))?;
            let table_id = database_schema
                .lock()
                .unwrap()
                .table_index(table_name)
                .ok_or_else(|| {
                    StorageError::NotFound(format!(
                        "table '{table_name}' in database '{schema_id}'"
                    ))
                })?;
            (manager.filesystem(), schema_id, table_schema, table_id)
        };
        Ok(Self {
            schema_manager,
            filesystem,
            value_resolver: ValueResolver::new(),
            data_converter: DataConverter::new(),
            schema_id,
            table_name: table_name.to_string(),
            table_id,
            table_schema,
            column_data_cache: HashMap::new(),
            row_cache: HashMap::new(),
            indices: HashMap::new(),
            cursor: CursorState::Unpositioned,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_id(&self) -> usize {
        self.table_id
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn table_schema(&self) -> Arc<Mutex<TableSchema>> {
        Arc::clone(&self.table_schema)
    }

    fn column(&self, column_id: ColumnId) -> StorageResult<ColumnPage> {
        self.table_schema
            .lock()
            .unwrap()
            .column(column_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "column #{column_id} of table '{}'",
                    self.table_name
                ))
            })
    }

    /// Page capacity in rows for one column; pure in the column's declared
    /// type and length.
    pub fn rows_per_column_data(&self, column_id: ColumnId) -> StorageResult<u64> {
        Ok(rows_per_page(&self.column(column_id)?))
    }

    /// The page holding `row_id`'s cell of the column, opened (and
    /// pre-sized) on first touch and cached per (column, page index).
    fn column_data(&mut self, row_id: RowId, column_id: ColumnId) -> StorageResult<&mut ColumnData> {
        let column = self.column(column_id)?;
        let rows = rows_per_page(&column);
        let page_index = row_id / rows;
        let key = (column_id, page_index);
        if !self.column_data_cache.contains_key(&key) {
            let path = FilePaths::column_data_file(
                &self.schema_id,
                &self.table_name,
                column_id,
                page_index,
            );
            let file = self.filesystem.open(&path)?;
            let mut data = ColumnData::new(file, column);
            if data.is_empty()? {
                data.preserve_space(rows)?;
            }
            self.column_data_cache.insert(key, data);
        }
        Ok(self
            .column_data_cache
            .get_mut(&key)
            .expect("column page cached above"))
    }

    /// Highest page index with a data file on disk for the column, or
    /// `None` when no page was ever created.
    fn last_column_page_index(&self, column_id: ColumnId) -> StorageResult<Option<u64>> {
        let dir = FilePaths::column_data_dir(&self.schema_id, &self.table_name, column_id);
        let mut last = None;
        for file_name in self.filesystem.list_dir(&dir)? {
            if let Some(stem) = file_name.strip_suffix(".data") {
                if let Ok(page_index) = stem.parse::<u64>() {
                    last = Some(last.map_or(page_index, |l: u64| l.max(page_index)));
                }
            }
        }
        Ok(last)
    }

    fn primary_key_columns(&self) -> StorageResult<Vec<(ColumnId, ColumnPage)>> {
        let columns = self.table_schema.lock().unwrap().primary_key_columns();
        if columns.is_empty() {
            return Err(StorageError::Unsupported(format!(
                "table '{}' has no primary-key columns; row existence and count are undefined",
                self.table_name
            )));
        }
        Ok(columns)
    }

    /// Whether a live row occupies `row_id` (or the cursor position when
    /// omitted). Existence is derived from primary-key cell contents, not
    /// from an explicit row directory.
    pub fn row_exists(&mut self, row_id: Option<RowId>) -> StorageResult<bool> {
        let row_id = match row_id.or_else(|| self.tell()) {
            Some(row_id) => row_id,
            None => return Ok(false),
        };
        for (column_id, column) in self.primary_key_columns()? {
            let offset = row_id % rows_per_page(&column);
            let data = self.column_data(row_id, column_id)?;
            //  A column whose watermark does not reach the offset has no
            //  say; the remaining key columns still get checked.
            if offset >= data.cell_count()? {
                continue;
            }
            if data.is_cell_set(offset)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Row count as "highest row id ever used, plus one, minus recorded
    /// deletions" — a dense-space approximation measured off the first
    /// primary-key column's last page file, not an exact scan.
    pub fn row_count(&mut self) -> StorageResult<u64> {
        let (column_id, column) = self.primary_key_columns()?.remove(0);
        let last_page_index = match self.last_column_page_index(column_id)? {
            Some(index) => index,
            None => return Ok(0),
        };
        let rows = rows_per_page(&column);
        let cells_on_last_page = self
            .column_data(last_page_index * rows, column_id)?
            .cell_count()?;
        let last_index = cells_on_last_page + rows * last_page_index;
        let deleted = self.deleted_rows_count()?;
        Ok(last_index.saturating_sub(deleted))
    }

    /// Direct page-level cell read; no schema-type validation here.
    pub fn get_cell_data(
        &mut self,
        row_id: RowId,
        column_id: ColumnId,
    ) -> StorageResult<Option<Vec<u8>>> {
        let offset = row_id % self.rows_per_column_data(column_id)?;
        self.column_data(row_id, column_id)?.get_cell(offset)
    }

    /// Direct page-level cell write; invalidates the row-cache entry.
    pub fn set_cell_data(
        &mut self,
        row_id: RowId,
        column_id: ColumnId,
        payload: &[u8],
    ) -> StorageResult<()> {
        let offset = row_id % self.rows_per_column_data(column_id)?;
        self.column_data(row_id, column_id)?.set_cell(offset, payload)?;
        self.row_cache.remove(&row_id);
        Ok(())
    }

    /// All cached columns' cells at the row (cursor position when
    /// omitted), keyed by column id. Consults and populates the bounded
    /// row cache.
    pub fn get_row_data(
        &mut self,
        row_id: Option<RowId>,
    ) -> StorageResult<HashMap<ColumnId, Option<Vec<u8>>>> {
        let row_id = row_id.or_else(|| self.tell()).ok_or_else(|| {
            StorageError::InvalidArgument("no row id available (cursor not positioned)".to_string())
        })?;
        if let Some(cached) = self.row_cache.get(&row_id) {
            return Ok(cached.clone());
        }
        let column_ids = self.table_schema.lock().unwrap().cached_column_ids();
        let mut row = HashMap::new();
        for column_id in column_ids {
            row.insert(column_id, self.get_cell_data(row_id, column_id)?);
        }
        if self.row_cache.len() < ROW_CACHE_SIZE {
            self.row_cache.insert(row_id, row.clone());
        }
        Ok(row)
    }

    /// Same as [`Table::get_row_data`], re-keyed by column name.
    pub fn get_named_row_data(
        &mut self,
        row_id: Option<RowId>,
    ) -> StorageResult<HashMap<String, Option<Vec<u8>>>> {
        let row = self.get_row_data(row_id)?;
        let schema = self.table_schema.lock().unwrap();
        let mut named = HashMap::new();
        for (column_id, value) in row {
            let name = schema
                .column(column_id)
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    StorageError::NotFound(format!(
                        "column #{column_id} of table '{}'",
                        self.table_name
                    ))
                })?;
            named.insert(name, value);
        }
        Ok(named)
    }

    /// Write the given columns' cells at the row id.
    pub fn set_row_data(&mut self, row_id: RowId, row_data: &RowData) -> StorageResult<()> {
        for (&column_id, payload) in row_data {
            let offset = row_id % self.rows_per_column_data(column_id)?;
            self.column_data(row_id, column_id)?.set_cell(offset, payload)?;
        }
        self.row_cache.remove(&row_id);
        Ok(())
    }

    /// Insert a row: recycles a ledger id when one is available, otherwise
    /// claims `row_count()` as the next id. Does not advance the
    /// auto-increment counter — the insert path calls that explicitly.
    pub fn add_row_data(&mut self, row_data: &RowData) -> StorageResult<RowId> {
        let row_id = match self.pop_deleted_row()? {
            Some(row_id) => row_id,
            None => self.row_count()?,
        };
        self.set_row_data(row_id, row_data)?;
        debug!(table = %self.table_name, row_id, "row added");
        Ok(row_id)
    }

    /// Clear every cached column's cell at the row and push the id onto
    /// the deleted-row ledger for reuse.
    pub fn remove_row(&mut self, row_id: RowId) -> StorageResult<()> {
        let column_ids = self.table_schema.lock().unwrap().cached_column_ids();
        for column_id in column_ids {
            let offset = row_id % self.rows_per_column_data(column_id)?;
            self.column_data(row_id, column_id)?.remove_cell(offset)?;
        }
        self.row_cache.remove(&row_id);
        self.push_deleted_row(row_id)?;
        debug!(table = %self.table_name, row_id, "row removed");
        Ok(())
    }

    /// The column's default as a cell payload, re-resolving deferred
    /// defaults against the present moment.
    pub fn resolve_column_default(&self, column: &ColumnPage) -> StorageResult<Option<Vec<u8>>> {
        match &column.default_value {
            DefaultValue::None => Ok(None),
            DefaultValue::Binary(payload) => Ok(Some(payload.clone())),
            DefaultValue::Unresolved(raw) => {
                let resolved = self.value_resolver.resolve(raw)?;
                Ok(Some(self.data_converter.string_to_binary(
                    &resolved,
                    column.data_type,
                    column.length,
                    column.second_length,
                )?))
            }
        }
    }

    /// Append a column to the table and backfill every existing row's new
    /// cell with the column default.
    pub fn add_column_definition(
        &mut self,
        definition: &ColumnDefinition,
    ) -> StorageResult<ColumnId> {
        if self
            .table_schema
            .lock()
            .unwrap()
            .column_index(&definition.name)
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "column '{}' already exists",
                definition.name
            )));
        }
        let column =
            column_page_from_definition(definition, &self.value_resolver, &self.data_converter)?;
        let column_id = self
            .table_schema
            .lock()
            .unwrap()
            .add_column_page(column.clone())?;
        debug!(table = %self.table_name, column = %definition.name, column_id, "column added");

        if let Some(payload) = self.resolve_column_default(&column)? {
            let row_count = self.row_count()?;
            for row_id in 0..row_count {
                self.set_cell_data(row_id, column_id, &payload)?;
            }
        }
        Ok(column_id)
    }

    /// Rewrite a column's metadata in place, preserving its index. Fails
    /// with [`StorageError::Conflict`] when no column of that name exists.
    pub fn modify_column_definition(
        &mut self,
        definition: &ColumnDefinition,
    ) -> StorageResult<()> {
        let column_id = self
            .table_schema
            .lock()
            .unwrap()
            .column_index(&definition.name)
            .ok_or_else(|| {
                StorageError::Conflict(format!("column '{}' does not exist", definition.name))
            })?;
        let column =
            column_page_from_definition(definition, &self.value_resolver, &self.data_converter)?;
        self.table_schema
            .lock()
            .unwrap()
            .write_column(column_id, column)?;
        //  Cached pages still carry the old cell width.
        self.column_data_cache
            .retain(|(cached_column, _), _| *cached_column != column_id);
        debug!(table = %self.table_name, column = %definition.name, "column modified");
        Ok(())
    }

    /// Lazily constructed, cached secondary-index handle.
    pub fn get_index(&mut self, index_name: &str) -> StorageResult<&mut Index> {
        if !self.indices.contains_key(index_name) {
            let index = Index::new(
                Arc::clone(&self.filesystem),
                Arc::clone(&self.schema_manager),
                index_name,
                &self.table_name,
                &self.schema_id,
            )?;
            self.indices.insert(index_name.to_string(), index);
        }
        Ok(self
            .indices
            .get_mut(index_name)
            .expect("index cached above"))
    }

    ///  Deleted-row ledger: a LIFO stack of freed row ids, one 16-byte
    ///  big-endian record per id, guarded by advisory file locks.
    fn push_deleted_row(&mut self, row_id: RowId) -> StorageResult<()> {
        let mut file = self
            .filesystem
            .open(&FilePaths::deleted_rows(&self.schema_id, &self.table_name))?;
        let mut guard = FileLockGuard::new(file.as_mut(), LockMode::Exclusive)?;
        let file = guard.file();
        let end = file.len()?;
        file.write_all_at(end, &(row_id as u128).to_be_bytes())
    }

    fn pop_deleted_row(&mut self) -> StorageResult<Option<RowId>> {
        let mut file = self
            .filesystem
            .open(&FilePaths::deleted_rows(&self.schema_id, &self.table_name))?;
        let mut guard = FileLockGuard::new(file.as_mut(), LockMode::Exclusive)?;
        let file = guard.file();
        let end = file.len()?;
        if end < DELETED_ROWS_RECORD_SIZE {
            return Ok(None);
        }
        let mut record = [0u8; DELETED_ROWS_RECORD_SIZE as usize];
        file.read_exact_at(end - DELETED_ROWS_RECORD_SIZE, &mut record)?;
        file.truncate(end - DELETED_ROWS_RECORD_SIZE)?;
        Ok(Some(u128::from_be_bytes(record) as RowId))
    }

    fn deleted_rows_count(&mut self) -> StorageResult<u64> {
        let mut file = self
            .filesystem
            .open(&FilePaths::deleted_rows(&self.schema_id, &self.table_name))?;
        let mut guard = FileLockGuard::new(file.as_mut(), LockMode::Shared)?;
        Ok(guard.file().len()? / DELETED_ROWS_RECORD_SIZE)
    }

    /// Next identity value, lazily initializing the counter file to 1.
    /// Only an absent or empty counter file triggers initialization; read
    /// failures propagate so a transient error cannot reset the sequence.
    pub fn auto_increment_id(&mut self) -> StorageResult<u64> {
        let path = FilePaths::auto_increment(&self.schema_id, &self.table_name);
        let contents = match self.filesystem.read_to_string(&path) {
            Ok(contents) => contents,
            Err(StorageError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };
        if contents.trim().is_empty() {
            self.filesystem.write_string(&path, "1")?;
            return Ok(1);
        }
        contents.trim().parse().map_err(|_| {
            StorageError::InvalidArgument(format!(
                "corrupt auto-increment counter of table '{}'",
                self.table_name
            ))
        })
    }

    /// Advance the counter by one. Not called implicitly on insert; the
    /// caller serializes advances per table.
    pub fn increment_auto_increment_id(&mut self) -> StorageResult<()> {
        let next = self.auto_increment_id()? + 1;
        self.filesystem.write_string(
            &FilePaths::auto_increment(&self.schema_id, &self.table_name),
            &next.to_string(),
        )
    }

    /// Encode a row of textual values into cell payloads per the schema.
    pub fn convert_string_row_to_data_row(
        &self,
        row: &HashMap<ColumnId, Option<String>>,
    ) -> StorageResult<HashMap<ColumnId, Option<Vec<u8>>>> {
        let schema = self.table_schema.lock().unwrap();
        let mut converted = HashMap::new();
        for (&column_id, value) in row {
            let column = schema.column(column_id).ok_or_else(|| {
                StorageError::NotFound(format!(
                    "column #{column_id} of table '{}'",
                    self.table_name
                ))
            })?;
            let payload = match value {
                None => None,
                Some(text) => Some(self.data_converter.string_to_binary(
                    text,
                    column.data_type,
                    column.length,
                    column.second_length,
                )?),
            };
            converted.insert(column_id, payload);
        }
        Ok(converted)
    }

    /// Decode a row of cell payloads back into textual values.
    pub fn convert_data_row_to_string_row(
        &self,
        row: &HashMap<ColumnId, Option<Vec<u8>>>,
    ) -> StorageResult<HashMap<ColumnId, Option<String>>> {
        let schema = self.table_schema.lock().unwrap();
        let mut converted = HashMap::new();
        for (&column_id, payload) in row {
            let column = schema.column(column_id).ok_or_else(|| {
                StorageError::NotFound(format!(
                    "column #{column_id} of table '{}'",
                    self.table_name
                ))
            })?;
            let text = match payload {
                None => None,
                Some(bytes) => Some(
                    self.data_converter
                        .binary_to_string(bytes, column.data_type)?,
                ),
            };
            converted.insert(column_id, text);
        }
        Ok(converted)
    }

    /// Cursor position, when positioned.
    pub fn tell(&self) -> Option<RowId> {
        match self.cursor {
            CursorState::Positioned(row_id) => Some(row_id),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.cursor, CursorState::Positioned(_))
    }

    /// Position the cursor on an existing row id.
    pub fn seek(&mut self, row_id: RowId) -> StorageResult<()> {
        if !self.row_exists(Some(row_id))? {
            return Err(StorageError::NotFound(format!(
                "row {row_id} of table '{}'",
                self.table_name
            )));
        }
        self.cursor = CursorState::Positioned(row_id);
        Ok(())
    }

    /// [`Table::seek`] for row ids arriving as decimal text.
    pub fn seek_str(&mut self, raw: &str) -> StorageResult<()> {
        let row_id = raw.trim().parse::<RowId>().map_err(|_| {
            StorageError::InvalidArgument(format!(
                "row-id '{raw}' is not a non-negative integer"
            ))
        })?;
        self.seek(row_id)
    }

    /// Seek to row 0 when the table has rows; stays unpositioned
    /// otherwise.
    pub fn rewind(&mut self) -> StorageResult<()> {
        if self.row_count()? > 0 {
            self.seek(0)?;
        }
        Ok(())
    }

    /// Scan forward from the position after the current one, skipping ids
    /// whose rows were deleted, until a live row is found or the id space
    /// is exhausted.
    pub fn advance(&mut self) -> StorageResult<()> {
        let start = match self.cursor {
            CursorState::Positioned(row_id) => row_id + 1,
            CursorState::Unpositioned => 0,
            CursorState::Exhausted => return Ok(()),
        };
        let row_count = self.row_count()?;
        let mut candidate = start;
        while candidate < row_count && !self.row_exists(Some(candidate))? {
            candidate += 1;
        }
        if self.row_exists(Some(candidate))? {
            self.cursor = CursorState::Positioned(candidate);
        } else {
            self.cursor = CursorState::Exhausted;
        }
        Ok(())
    }

    /// Named row data at the cursor; `None` unless positioned.
    pub fn current(&mut self) -> StorageResult<Option<HashMap<String, Option<Vec<u8>>>>> {
        match self.cursor {
            CursorState::Positioned(_) => Ok(Some(self.get_named_row_data(None)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod table_tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::filesystem::RealFilesystem;
    use crate::schema::DataType;
    use crate::test_utils::TestDir;

    fn manager(dir: &TestDir) -> Arc<Mutex<SchemaManager>> {
        let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem::new(dir).unwrap());
        Arc::new(Mutex::new(SchemaManager::new(fs)))
    }

    fn orders_table(dir: &TestDir) -> Table {
        let manager = manager(dir);
        manager
            .lock()
            .unwrap()
            .create_table(
                "orders",
                &[
                    ColumnDefinition::new("id", DataType::BigInt)
                        .primary_key()
                        .auto_increment(),
                    ColumnDefinition::new("amount", DataType::Int),
                    ColumnDefinition::new("customer", DataType::Varchar).with_length(16),
                ],
                None,
            )
            .unwrap();
        Table::open(manager, "orders", None).unwrap()
    }

    fn order_row(table: &Table, id: i64, amount: i32, customer: &str) -> RowData {
        let converter = DataConverter::new();
        let schema = table.table_schema();
        let schema = schema.lock().unwrap();
        let mut row = RowData::new();
        row.insert(
            0,
            converter
                .string_to_binary(&id.to_string(), schema.column(0).unwrap().data_type, 0, 0)
                .unwrap(),
        );
        row.insert(
            1,
            converter
                .string_to_binary(&amount.to_string(), DataType::Int, 0, 0)
                .unwrap(),
        );
        row.insert(
            2,
            converter
                .string_to_binary(customer, DataType::Varchar, 16, 0)
                .unwrap(),
        );
        row
    }

    #[test]
    fn add_row_exists_remove_and_reuse() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);

        let first = table.add_row_data(&order_row(&table, 1, 10, "ada")).unwrap();
        let second = table.add_row_data(&order_row(&table, 2, 20, "bob")).unwrap();
        assert_eq!((first, second), (0, 1));
        assert!(table.row_exists(Some(first)).unwrap());

        table.remove_row(first).unwrap();
        assert!(!table.row_exists(Some(first)).unwrap());

        //  The freed id is recycled before any new id is allocated.
        let reused = table.add_row_data(&order_row(&table, 3, 30, "eve")).unwrap();
        assert_eq!(reused, first);
        assert!(table.row_exists(Some(reused)).unwrap());
    }

    #[test]
    fn deleted_row_ledger_is_lifo_and_empty_pop_is_none() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);

        assert_eq!(table.pop_deleted_row().unwrap(), None);

        for row_id in [5u64, 9, 2] {
            table.push_deleted_row(row_id).unwrap();
        }
        assert_eq!(table.deleted_rows_count().unwrap(), 3);
        assert_eq!(table.pop_deleted_row().unwrap(), Some(2));
        assert_eq!(table.pop_deleted_row().unwrap(), Some(9));
        assert_eq!(table.pop_deleted_row().unwrap(), Some(5));
        assert_eq!(table.pop_deleted_row().unwrap(), None);
    }

    #[test]
    fn deleted_row_ledger_survives_reopen() {
        let dir = TestDir::new_unique("flatdb_table");
        {
            let mut table = orders_table(&dir);
            let row_id = table.add_row_data(&order_row(&table, 1, 10, "ada")).unwrap();
            table.remove_row(row_id).unwrap();
        }

        //  A fresh registry and table over the same directory still sees
        //  the freed id and hands it out first.
        let manager = manager(&dir);
        let mut table = Table::open(manager, "orders", None).unwrap();
        assert_eq!(table.deleted_rows_count().unwrap(), 1);
        let reused = table.add_row_data(&order_row(&table, 2, 20, "bob")).unwrap();
        assert_eq!(reused, 0);
        assert_eq!(table.pop_deleted_row().unwrap(), None);
    }

    #[test]
    fn composite_primary_key_checks_every_column() {
        let dir = TestDir::new_unique("flatdb_table");
        let manager = manager(&dir);
        manager
            .lock()
            .unwrap()
            .create_table(
                "pairs",
                &[
                    ColumnDefinition::new("a", DataType::Int).primary_key(),
                    ColumnDefinition::new("b", DataType::Int).primary_key(),
                ],
                None,
            )
            .unwrap();
        let mut table = Table::open(manager, "pairs", None).unwrap();

        //  Only the second key column holds a cell; the first column's
        //  page watermark never reaches the offset.
        let payload = DataConverter::new()
            .string_to_binary("7", DataType::Int, 0, 0)
            .unwrap();
        table.set_cell_data(0, 1, &payload).unwrap();
        assert!(table.row_exists(Some(0)).unwrap());
        assert!(!table.row_exists(Some(1)).unwrap());
    }

    #[test]
    fn row_count_formula_spans_pages_and_subtracts_deletions() {
        let dir = TestDir::new_unique("flatdb_table");
        let manager = manager(&dir);
        //  A 32767-byte varchar makes a 32768-byte cell: 4 rows per page.
        manager
            .lock()
            .unwrap()
            .create_table(
                "wide",
                &[ColumnDefinition::new("pk", DataType::Varchar)
                    .primary_key()
                    .with_length(32767)],
                None,
            )
            .unwrap();
        let mut table = Table::open(manager, "wide", None).unwrap();
        assert_eq!(table.rows_per_column_data(0).unwrap(), 4);
        assert_eq!(table.row_count().unwrap(), 0);

        let converter = DataConverter::new();
        for row_id in 0..6u64 {
            let payload = converter
                .string_to_binary(&format!("row{row_id}"), DataType::Varchar, 32767, 0)
                .unwrap();
            table.set_cell_data(row_id, 0, &payload).unwrap();
        }
        assert_eq!(table.row_count().unwrap(), 6);

        table.remove_row(1).unwrap();
        assert_eq!(table.row_count().unwrap(), 5);
    }

    #[test]
    fn cursor_visits_live_rows_in_order_then_exhausts() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        for n in 0..4i64 {
            table
                .add_row_data(&order_row(&table, n, n as i32 * 10, "x"))
                .unwrap();
        }
        table.remove_row(1).unwrap();

        table.rewind().unwrap();
        assert_eq!(table.tell(), Some(0));
        table.advance().unwrap();
        assert_eq!(table.tell(), Some(2));
        table.advance().unwrap();
        assert_eq!(table.tell(), Some(3));
        assert!(table.current().unwrap().is_some());

        table.advance().unwrap();
        assert!(!table.is_valid());
        assert_eq!(table.tell(), None);
        assert!(table.current().unwrap().is_none());

        //  Seeking a deleted id fails; malformed text ids are rejected.
        assert!(matches!(table.seek(1), Err(StorageError::NotFound(_))));
        assert!(matches!(
            table.seek_str("not-a-number"),
            Err(StorageError::InvalidArgument(_))
        ));
        table.seek_str("2").unwrap();
        assert_eq!(table.tell(), Some(2));
    }

    #[test]
    fn rewind_on_empty_table_stays_unpositioned() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        table.rewind().unwrap();
        assert!(!table.is_valid());
        assert_eq!(table.tell(), None);
        assert!(!table.row_exists(None).unwrap());
    }

    #[test]
    fn named_row_data_and_string_conversion() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        let row_id = table
            .add_row_data(&order_row(&table, 7, 70, "grace"))
            .unwrap();

        let named = table.get_named_row_data(Some(row_id)).unwrap();
        let amount = named.get("amount").unwrap().clone().unwrap();
        assert_eq!(
            table
                .data_converter
                .binary_to_string(&amount, DataType::Int)
                .unwrap(),
            "70"
        );

        let row = table.get_row_data(Some(row_id)).unwrap();
        let strings = table.convert_data_row_to_string_row(&row).unwrap();
        assert_eq!(strings[&2].as_deref(), Some("grace"));

        let back = table.convert_string_row_to_data_row(&strings).unwrap();
        assert_eq!(back[&1].as_deref(), row[&1].as_deref());
    }

    #[test]
    fn row_cache_is_invalidated_by_writes() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        let row_id = table.add_row_data(&order_row(&table, 1, 10, "ada")).unwrap();

        //  Populate the cache, then overwrite one cell.
        let before = table.get_row_data(Some(row_id)).unwrap();
        assert!(table.row_cache.contains_key(&row_id));

        let new_amount = DataConverter::new()
            .string_to_binary("99", DataType::Int, 0, 0)
            .unwrap();
        table.set_cell_data(row_id, 1, &new_amount).unwrap();
        let after = table.get_row_data(Some(row_id)).unwrap();
        assert_ne!(before[&1], after[&1]);
        assert_eq!(after[&1].as_deref(), Some(new_amount.as_slice()));
    }

    #[test]
    fn auto_increment_initializes_to_one_and_advances_explicitly() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);

        assert_eq!(table.auto_increment_id().unwrap(), 1);
        //  Inserts do not advance the counter by themselves.
        table.add_row_data(&order_row(&table, 1, 10, "ada")).unwrap();
        assert_eq!(table.auto_increment_id().unwrap(), 1);

        table.increment_auto_increment_id().unwrap();
        assert_eq!(table.auto_increment_id().unwrap(), 2);
    }

    /// Delegating filesystem that can be told to fail counter reads.
    struct FlakyFilesystem {
        inner: RealFilesystem,
        fail_counter_reads: AtomicBool,
    }

    impl Filesystem for FlakyFilesystem {
        fn open(&self, path: &str) -> StorageResult<Box<dyn crate::filesystem::DbFile>> {
            self.inner.open(path)
        }

        fn file_exists(&self, path: &str) -> bool {
            self.inner.file_exists(path)
        }

        fn unlink(&self, path: &str) -> StorageResult<()> {
            self.inner.unlink(path)
        }

        fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
            self.inner.list_dir(path)
        }

        fn read_to_string(&self, path: &str) -> StorageResult<String> {
            if path.ends_with("auto-increment.int")
                && self.fail_counter_reads.load(Ordering::SeqCst)
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected read failure",
                )
                .into());
            }
            self.inner.read_to_string(path)
        }

        fn write_string(&self, path: &str, contents: &str) -> StorageResult<()> {
            self.inner.write_string(path, contents)
        }
    }

    #[test]
    fn auto_increment_read_failure_propagates_without_reset() {
        let dir = TestDir::new_unique("flatdb_table");
        let fs = Arc::new(FlakyFilesystem {
            inner: RealFilesystem::new(&dir).unwrap(),
            fail_counter_reads: AtomicBool::new(false),
        });
        let shared: Arc<dyn Filesystem> = fs.clone();
        let manager = Arc::new(Mutex::new(SchemaManager::new(shared)));
        manager
            .lock()
            .unwrap()
            .create_table(
                "orders",
                &[ColumnDefinition::new("id", DataType::BigInt).primary_key()],
                None,
            )
            .unwrap();
        let mut table = Table::open(manager, "orders", None).unwrap();

        table.auto_increment_id().unwrap();
        for _ in 0..4 {
            table.increment_auto_increment_id().unwrap();
        }
        assert_eq!(table.auto_increment_id().unwrap(), 5);

        //  A transient read failure must surface, not re-initialize.
        fs.fail_counter_reads.store(true, Ordering::SeqCst);
        assert!(matches!(
            table.auto_increment_id(),
            Err(StorageError::Io(_))
        ));

        fs.fail_counter_reads.store(false, Ordering::SeqCst);
        assert_eq!(table.auto_increment_id().unwrap(), 5);
    }

    #[test]
    fn add_column_backfills_default_without_touching_others() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        for n in 0..3i64 {
            table
                .add_row_data(&order_row(&table, n, n as i32, "x"))
                .unwrap();
        }
        let amounts_before: Vec<_> = (0..3u64)
            .map(|r| table.get_cell_data(r, 1).unwrap())
            .collect();

        let column_id = table
            .add_column_definition(&ColumnDefinition::new("status", DataType::Int).with_default("0"))
            .unwrap();
        assert_eq!(column_id, 3);

        let zero = DataConverter::new()
            .string_to_binary("0", DataType::Int, 0, 0)
            .unwrap();
        for row_id in 0..3u64 {
            assert_eq!(
                table.get_cell_data(row_id, column_id).unwrap().as_deref(),
                Some(zero.as_slice())
            );
            assert_eq!(table.get_cell_data(row_id, 1).unwrap(), amounts_before[row_id as usize]);
        }

        //  Duplicate names conflict.
        assert!(matches!(
            table.add_column_definition(&ColumnDefinition::new("status", DataType::Int)),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn modify_column_rewrites_metadata_in_place() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);

        table
            .modify_column_definition(
                &ColumnDefinition::new("customer", DataType::Varchar).with_length(32),
            )
            .unwrap();
        {
            let schema = table.table_schema();
            let schema = schema.lock().unwrap();
            assert_eq!(schema.column_index("customer"), Some(2));
            assert_eq!(schema.column(2).unwrap().length, 32);
        }

        assert!(matches!(
            table.modify_column_definition(&ColumnDefinition::new("ghost", DataType::Int)),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn timestamp_default_is_deferred_and_resolves_per_call() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        let column_id = table
            .add_column_definition(
                &ColumnDefinition::new("created_at", DataType::Timestamp)
                    .with_default("CURRENT_TIMESTAMP"),
            )
            .unwrap();

        let schema = table.table_schema();
        let column = schema.lock().unwrap().column(column_id).cloned().unwrap();
        assert!(matches!(column.default_value, DefaultValue::Unresolved(_)));

        let payload = table.resolve_column_default(&column).unwrap().unwrap();
        let secs = u64::from_be_bytes(payload.try_into().unwrap());
        assert!(secs > 1_600_000_000);
    }

    #[test]
    fn tables_without_primary_key_are_unsupported_for_existence_and_count() {
        let dir = TestDir::new_unique("flatdb_table");
        let manager = manager(&dir);
        manager
            .lock()
            .unwrap()
            .create_table(
                "bare",
                &[ColumnDefinition::new("v", DataType::Int)],
                None,
            )
            .unwrap();
        let mut table = Table::open(manager, "bare", None).unwrap();

        assert!(matches!(
            table.row_count(),
            Err(StorageError::Unsupported(_))
        ));
        assert!(matches!(
            table.row_exists(Some(0)),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn get_index_returns_cached_handle() {
        let dir = TestDir::new_unique("flatdb_table");
        let mut table = orders_table(&dir);
        table.get_index("by_customer").unwrap().insert(b"ada", 0).unwrap();
        assert_eq!(
            table.get_index("by_customer").unwrap().search(b"ada").unwrap(),
            vec![0]
        );
    }

    #[test]
    fn opening_an_unknown_table_is_not_found() {
        let dir = TestDir::new_unique("flatdb_table");
        let manager = manager(&dir);
        assert!(matches!(
            Table::open(manager, "ghost", None),
            Err(StorageError::NotFound(_))
        ));
    }
}
