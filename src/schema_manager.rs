//! Schema Registry: resolves database ids to [`DatabaseSchema`] objects and
//! (database, table) pairs to cached [`TableSchema`] objects, owns the
//! database-id grammar check and the meta-database protection rules, and
//! persists view queries.
//!
//! Caches are process-local and live for the registry's lifetime; callers
//! must not assume cross-process freshness without re-instantiating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::errors::{StorageError, StorageResult};
use crate::filesystem::{FilePaths, Filesystem};
use crate::schema::{ColumnDefinition, DatabaseSchema, TableSchema};
use crate::table::column_page_from_definition;
use crate::value_resolver::ValueResolver;
use crate::data_converter::DataConverter;

/// Check a database-id against the id grammar: a leading alphanumeric or
/// underscore, then alphanumerics, underscores and hyphens, at most 64
/// bytes.
pub fn validate_database_id(id: &str) -> StorageResult<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if !valid || id.len() > 64 {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}

pub struct SchemaManager {
    filesystem: Arc<dyn Filesystem>,
    current_database_id: String,
    schemas: HashMap<String, Arc<Mutex<DatabaseSchema>>>,
    table_schemas: HashMap<(String, usize), Arc<Mutex<TableSchema>>>,
}

impl SchemaManager {
    pub const DATABASE_ID_DEFAULT: &'static str = "default";
    pub const DATABASE_ID_META_MYSQL: &'static str = "mysql";
    pub const DATABASE_ID_META_INFORMATION_SCHEMA: &'static str = "information_schema";
    pub const DATABASE_ID_META_PERFORMANCE_SCHEMA: &'static str = "performance_schema";
    pub const DATABASE_ID_META_INDICES: &'static str = "indices";

    pub fn new(filesystem: Arc<dyn Filesystem>) -> Self {
        Self {
            filesystem,
            current_database_id: Self::DATABASE_ID_DEFAULT.to_string(),
            schemas: HashMap::new(),
            table_schemas: HashMap::new(),
        }
    }

    pub fn filesystem(&self) -> Arc<dyn Filesystem> {
        Arc::clone(&self.filesystem)
    }

    pub fn current_database_id(&self) -> &str {
        &self.current_database_id
    }

    pub fn set_current_database_id(&mut self, schema_id: &str) -> StorageResult<()> {
        validate_database_id(schema_id)?;
        if !self.schema_exists(schema_id)? {
            return Err(StorageError::NotFound(format!("database '{schema_id}'")));
        }
        self.current_database_id = schema_id.to_string();
        Ok(())
    }

    pub fn is_meta_schema(schema_id: &str) -> bool {
        [
            Self::DATABASE_ID_META_INDICES,
            Self::DATABASE_ID_META_INFORMATION_SCHEMA,
            Self::DATABASE_ID_META_MYSQL,
            Self::DATABASE_ID_META_PERFORMANCE_SCHEMA,
        ]
        .contains(&schema_id)
    }

    /// Resolve (and cache) the schema object of a database. The `default`
    /// database is created implicitly when absent; other ids come into
    /// existence on first access, mirroring the lazy file creation of the
    /// backing store.
    pub fn get_schema(&mut self, schema_id: Option<&str>) -> StorageResult<Arc<Mutex<DatabaseSchema>>> {
        let schema_id = schema_id.unwrap_or(&self.current_database_id).to_string();

        if !self.schema_exists(Self::DATABASE_ID_DEFAULT)? {
            self.create_schema(Self::DATABASE_ID_DEFAULT)?;
        }

        validate_database_id(&schema_id)?;

        if !self.schemas.contains_key(&schema_id) {
            let schema = DatabaseSchema::load(
                Arc::clone(&self.filesystem),
                FilePaths::schema(&schema_id),
                schema_id.clone(),
            )?;
            self.schemas
                .insert(schema_id.clone(), Arc::new(Mutex::new(schema)));
        }

        Ok(Arc::clone(&self.schemas[&schema_id]))
    }

    pub fn schema_exists(&self, schema_id: &str) -> StorageResult<bool> {
        validate_database_id(schema_id)?;
        if self.schemas.contains_key(schema_id) {
            return Ok(true);
        }
        Ok(self.filesystem.file_exists(&FilePaths::schema(schema_id)))
    }

    pub fn create_schema(&mut self, schema_id: &str) -> StorageResult<Arc<Mutex<DatabaseSchema>>> {
        validate_database_id(schema_id)?;
        if self.schema_exists(schema_id)? {
            return Err(StorageError::AlreadyExists(format!("database '{schema_id}'")));
        }
        debug!(schema_id, "creating database schema");
        let schema = DatabaseSchema::load(
            Arc::clone(&self.filesystem),
            FilePaths::schema(schema_id),
            schema_id.to_string(),
        )?;
        //  Loading touched the backing file, so the database is visible to
        //  schema_exists and list_schemas even before its first table.
        let schema = Arc::new(Mutex::new(schema));
        self.schemas.insert(schema_id.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn remove_schema(&mut self, schema_id: &str) -> StorageResult<()> {
        validate_database_id(schema_id)?;
        if Self::is_meta_schema(schema_id) {
            return Err(StorageError::Forbidden(schema_id.to_string()));
        }
        debug!(schema_id, "removing database schema");
        self.filesystem.unlink(&FilePaths::schema(schema_id))?;
        self.schemas.remove(schema_id);
        self.table_schemas.retain(|(id, _), _| id != schema_id);
        Ok(())
    }

    /// Enumerate databases: schema files on disk plus the always-present
    /// meta-databases.
    pub fn list_schemas(&mut self) -> StorageResult<Vec<String>> {
        if !self.schema_exists(Self::DATABASE_ID_DEFAULT)? {
            self.create_schema(Self::DATABASE_ID_DEFAULT)?;
        }
        let mut result = Vec::new();
        for file_name in self.filesystem.list_dir(FilePaths::SCHEMA_DIR)? {
            if let Some(schema_id) = file_name.strip_suffix(FilePaths::SCHEMA_SUFFIX) {
                result.push(schema_id.to_string());
            }
        }
        result.push(Self::DATABASE_ID_META_INFORMATION_SCHEMA.to_string());
        result.sort();
        result.dedup();
        Ok(result)
    }

    /// Resolve a table schema by name or numeric index string.
    ///
    /// Returns `Ok(None)` when the table is not registered — callers must
    /// check. The cached object is re-attached to the owning database
    /// schema on every call so swapped schema objects propagate.
    pub fn get_table_schema(
        &mut self,
        table: &str,
        schema_id: Option<&str>,
    ) -> StorageResult<Option<Arc<Mutex<TableSchema>>>> {
        let schema_id = schema_id.unwrap_or(&self.current_database_id).to_string();
        let database_schema = self.get_schema(Some(&schema_id))?;

        let (table_index, table_name) = {
            let schema = database_schema.lock().unwrap();
            if let Ok(index) = table.parse::<usize>() {
                match schema.table_name(index) {
                    Some(name) => (index, name.to_string()),
                    None => return Ok(None),
                }
            } else {
                match schema.table_index(table) {
                    Some(index) => (index, table.to_string()),
                    None => return Ok(None),
                }
            }
        };

        let cache_key = (schema_id.clone(), table_index);
        if !self.table_schemas.contains_key(&cache_key) {
            let table_schema = TableSchema::load(
                Arc::clone(&self.filesystem),
                FilePaths::table_schema(&schema_id, table_index),
                FilePaths::table_index_schema(&schema_id, table_index),
                table_name,
            )?;
            self.table_schemas
                .insert(cache_key.clone(), Arc::new(Mutex::new(table_schema)));
        }

        let table_schema = Arc::clone(&self.table_schemas[&cache_key]);
        table_schema
            .lock()
            .unwrap()
            .set_database_schema(database_schema);
        Ok(Some(table_schema))
    }

    /// Register a table and persist its column layout. Returns the table
    /// index within the database schema.
    pub fn create_table(
        &mut self,
        table_name: &str,
        columns: &[ColumnDefinition],
        schema_id: Option<&str>,
    ) -> StorageResult<usize> {
        let schema_id = schema_id.unwrap_or(&self.current_database_id).to_string();
        let database_schema = self.get_schema(Some(&schema_id))?;
        let table_index = database_schema.lock().unwrap().register_table(table_name)?;
        debug!(schema_id, table_name, table_index, "creating table");

        let mut table_schema = TableSchema::load(
            Arc::clone(&self.filesystem),
            FilePaths::table_schema(&schema_id, table_index),
            FilePaths::table_index_schema(&schema_id, table_index),
            table_name.to_string(),
        )?;
        let resolver = ValueResolver::new();
        let converter = DataConverter::new();
        for definition in columns {
            let column = column_page_from_definition(definition, &resolver, &converter)?;
            table_schema.add_column_page(column)?;
        }
        Ok(table_index)
    }

    pub fn drop_table(&mut self, table_name: &str, schema_id: Option<&str>) -> StorageResult<()> {
        let schema_id = schema_id.unwrap_or(&self.current_database_id).to_string();
        let database_schema = self.get_schema(Some(&schema_id))?;
        let mut schema = database_schema.lock().unwrap();
        let table_index = schema
            .table_index(table_name)
            .ok_or_else(|| StorageError::NotFound(format!("table '{table_name}'")))?;
        schema.unregister_table(table_name)?;
        drop(schema);
        debug!(schema_id, table_name, "dropped table");
        self.table_schemas.remove(&(schema_id, table_index));
        Ok(())
    }

    /// Stored SQL text of a view; `Ok(None)` for unknown views.
    pub fn get_view_query(
        &mut self,
        view_name: &str,
        schema_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let database_schema = self.get_schema(schema_id)?;
        let (schema_id, view_index) = {
            let schema = database_schema.lock().unwrap();
            match schema.view_index(view_name) {
                Some(index) => (schema.id().to_string(), index),
                None => return Ok(None),
            }
        };
        let query = self
            .filesystem
            .read_to_string(&FilePaths::view_sql(&schema_id, view_index))?;
        Ok(Some(query))
    }

    /// Persist the SQL text of a view, lazily registering the view name.
    pub fn set_view_query(
        &mut self,
        query: &str,
        view_name: &str,
        schema_id: Option<&str>,
    ) -> StorageResult<()> {
        let database_schema = self.get_schema(schema_id)?;
        let (schema_id, view_index) = {
            let mut schema = database_schema.lock().unwrap();
            let index = match schema.view_index(view_name) {
                Some(index) => index,
                None => schema.register_view(view_name)?,
            };
            (schema.id().to_string(), index)
        };
        self.filesystem
            .write_string(&FilePaths::view_sql(&schema_id, view_index), query)
    }
}

#[cfg(test)]
mod schema_manager_tests {
    use super::*;
    use crate::filesystem::RealFilesystem;
    use crate::schema::DataType;
    use crate::test_utils::TestDir;

    fn manager(dir: &TestDir) -> SchemaManager {
        let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem::new(dir).unwrap());
        SchemaManager::new(fs)
    }

    fn orders_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", DataType::BigInt).primary_key(),
            ColumnDefinition::new("amount", DataType::Int),
        ]
    }

    #[test]
    fn database_id_grammar() {
        for good in ["default", "db_1", "A-2", "_x"] {
            assert!(validate_database_id(good).is_ok(), "{good} should pass");
        }
        for bad in ["", "bad id", "a/b", "-lead", &"x".repeat(65)] {
            assert!(
                matches!(validate_database_id(bad), Err(StorageError::InvalidId(_))),
                "{bad} should fail"
            );
        }
    }

    #[test]
    fn default_schema_is_created_implicitly() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);

        assert!(!manager.schema_exists("default").unwrap());
        manager.get_schema(None).unwrap();
        assert!(manager.schema_exists("default").unwrap());
    }

    #[test]
    fn create_remove_and_protection_rules() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);

        manager.create_schema("sales").unwrap();
        assert!(matches!(
            manager.create_schema("sales"),
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            manager.remove_schema("information_schema"),
            Err(StorageError::Forbidden(_))
        ));

        manager.remove_schema("sales").unwrap();
        assert!(!manager.schema_exists("sales").unwrap());
    }

    #[test]
    fn list_schemas_includes_meta_and_dedupes() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);
        manager.create_schema("sales").unwrap();

        let listed = manager.list_schemas().unwrap();
        assert!(listed.contains(&"default".to_string()));
        assert!(listed.contains(&"sales".to_string()));
        assert!(listed.contains(&"information_schema".to_string()));
        let mut deduped = listed.clone();
        deduped.dedup();
        assert_eq!(listed, deduped);
    }

    #[test]
    fn set_current_database_requires_existing_schema() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);

        assert!(matches!(
            manager.set_current_database_id("nope"),
            Err(StorageError::NotFound(_))
        ));
        manager.create_schema("sales").unwrap();
        manager.set_current_database_id("sales").unwrap();
        assert_eq!(manager.current_database_id(), "sales");
    }

    #[test]
    fn table_schema_lookups_hit_the_same_cached_object() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);
        manager.create_table("orders", &orders_columns(), None).unwrap();

        let first = manager.get_table_schema("orders", None).unwrap().unwrap();
        let second = manager.get_table_schema("orders", None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        //  Numeric index strings resolve to the same table.
        let by_index = manager.get_table_schema("0", None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &by_index));

        assert!(manager.get_table_schema("ghost", None).unwrap().is_none());
    }

    #[test]
    fn drop_and_recreate_yields_fresh_table_schema() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);
        manager.create_table("orders", &orders_columns(), None).unwrap();

        let before = manager.get_table_schema("orders", None).unwrap().unwrap();
        assert_eq!(before.lock().unwrap().column_count(), 2);

        manager.drop_table("orders", None).unwrap();
        assert!(manager.get_table_schema("orders", None).unwrap().is_none());
        assert!(matches!(
            manager.drop_table("orders", None),
            Err(StorageError::NotFound(_))
        ));

        manager
            .create_table(
                "orders",
                &[ColumnDefinition::new("id", DataType::Int).primary_key()],
                None,
            )
            .unwrap();
        let after = manager.get_table_schema("orders", None).unwrap().unwrap();
        assert_eq!(after.lock().unwrap().column_count(), 1);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn view_query_round_trip() {
        let dir = TestDir::new_unique("flatdb_registry");
        let mut manager = manager(&dir);

        assert!(manager.get_view_query("report", None).unwrap().is_none());
        manager
            .set_view_query("SELECT 1", "report", None)
            .unwrap();
        assert_eq!(
            manager.get_view_query("report", None).unwrap().as_deref(),
            Some("SELECT 1")
        );

        //  Re-setting overwrites in place.
        manager
            .set_view_query("SELECT 2", "report", None)
            .unwrap();
        assert_eq!(
            manager.get_view_query("report", None).unwrap().as_deref(),
            Some("SELECT 2")
        );
    }
}
