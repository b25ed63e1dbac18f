//! Secondary-index handle handed out by [`crate::table::Table::get_index`].
//!
//! The search structure is deliberately simple: a flat file of fixed-width
//! entries (state byte, key length, key bytes, row id), scanned linearly.
//! Freed entry slots are reused on insert. The row lifecycle manager only
//! depends on the insert/search/remove contract, so a smarter structure
//! can replace this file format without touching the table layer.

use std::sync::{Arc, Mutex};

use crate::errors::{StorageError, StorageResult};
use crate::filesystem::{FilePaths, Filesystem};
use crate::table::RowId;
use crate::schema_manager::SchemaManager;

const ENTRY_SIZE: u64 = 75;
const KEY_CAP: usize = 64;

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;

pub struct Index {
    filesystem: Arc<dyn Filesystem>,
    path: String,
    name: String,
    /// Column the index covers, when declared in the table's index schema.
    column_id: Option<usize>,
}

impl Index {
    pub fn new(
        filesystem: Arc<dyn Filesystem>,
        schema_manager: Arc<Mutex<SchemaManager>>,
        index_name: &str,
        table_name: &str,
        schema_id: &str,
    ) -> StorageResult<Self> {
        let column_id = {
            let mut manager = schema_manager.lock().unwrap();
            match manager.get_table_schema(table_name, Some(schema_id))? {
                Some(table_schema) => table_schema
                    .lock()
                    .unwrap()
                    .index_pages()
                    .iter()
                    .find(|page| page.name == index_name)
                    .map(|page| page.column_id),
                None => None,
            }
        };
        Ok(Self {
            filesystem,
            path: FilePaths::index_file(schema_id, table_name, index_name),
            name: index_name.to_string(),
            column_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_id(&self) -> Option<usize> {
        self.column_id
    }

    fn encode_entry(key: &[u8], row_id: RowId) -> StorageResult<[u8; ENTRY_SIZE as usize]> {
        if key.is_empty() || key.len() > KEY_CAP {
            return Err(StorageError::InvalidArgument(format!(
                "index key of {} bytes (cap {KEY_CAP})",
                key.len()
            )));
        }
        let mut entry = [0u8; ENTRY_SIZE as usize];
        entry[0] = STATE_LIVE;
        entry[1..3].copy_from_slice(&(key.len() as u16).to_be_bytes());
        entry[3..3 + key.len()].copy_from_slice(key);
        entry[67..75].copy_from_slice(&row_id.to_be_bytes());
        Ok(entry)
    }

    /// All entries currently in the file, live and free alike, paired with
    /// their slot offsets.
    fn scan(&mut self) -> StorageResult<Vec<(u64, u8, Vec<u8>, RowId)>> {
        let mut file = self.filesystem.open(&self.path)?;
        let bytes = file.read_all()?;
        let mut entries = Vec::new();
        for (slot, entry) in bytes.chunks_exact(ENTRY_SIZE as usize).enumerate() {
            let key_len = u16::from_be_bytes(entry[1..3].try_into().expect("2-byte slice")) as usize;
            if key_len > KEY_CAP {
                return Err(StorageError::InvalidArgument(format!(
                    "corrupt index entry in '{}'",
                    self.path
                )));
            }
            let key = entry[3..3 + key_len].to_vec();
            let row_id = RowId::from_be_bytes(entry[67..75].try_into().expect("8-byte slice"));
            entries.push((slot as u64, entry[0], key, row_id));
        }
        Ok(entries)
    }

    pub fn insert(&mut self, key: &[u8], row_id: RowId) -> StorageResult<()> {
        let encoded = Self::encode_entry(key, row_id)?;
        let free_slot = self
            .scan()?
            .into_iter()
            .find(|(_, state, _, _)| *state == STATE_FREE)
            .map(|(slot, _, _, _)| slot);
        let mut file = self.filesystem.open(&self.path)?;
        let offset = match free_slot {
            Some(slot) => slot * ENTRY_SIZE,
            None => file.len()?,
        };
        file.write_all_at(offset, &encoded)
    }

    /// Row ids of all live entries with this key, in slot order.
    pub fn search(&mut self, key: &[u8]) -> StorageResult<Vec<RowId>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|(_, state, entry_key, _)| *state == STATE_LIVE && entry_key == key)
            .map(|(_, _, _, row_id)| row_id)
            .collect())
    }

    /// Free the entry for (key, row id); `false` when no such entry lives.
    pub fn remove(&mut self, key: &[u8], row_id: RowId) -> StorageResult<bool> {
        let slot = self
            .scan()?
            .into_iter()
            .find(|(_, state, entry_key, entry_row)| {
                *state == STATE_LIVE && entry_key == key && *entry_row == row_id
            })
            .map(|(slot, _, _, _)| slot);
        match slot {
            Some(slot) => {
                let mut file = self.filesystem.open(&self.path)?;
                file.write_all_at(slot * ENTRY_SIZE, &[0u8; ENTRY_SIZE as usize])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
