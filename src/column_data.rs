//! Column Page Store: one fixed-capacity binary file per
//! (column, page index), holding consecutive rows' cells for one column.
//!
//! File layout: an 8-byte big-endian watermark (number of cells ever
//! written, i.e. highest used in-page offset plus one) followed by the
//! fixed-size cell array. Each cell is one presence byte (zero = null)
//! plus the column's payload. Deleting a cell zeroes it but never lowers
//! the watermark; the row-count formula depends on that.

use crate::errors::{StorageError, StorageResult};
use crate::filesystem::DbFile;
use crate::schema::ColumnPage;

/// Cell bytes budgeted per page file (the watermark header is on top).
pub const BYTES_PER_PAGE: u64 = 131072;

const HEADER_SIZE: u64 = 8;

/// Page capacity in rows for a column; pure in the column's type and
/// lengths so page boundaries are reproducible without any file access.
pub fn rows_per_page(column: &ColumnPage) -> u64 {
    BYTES_PER_PAGE.div_ceil(column.cell_size() as u64)
}

/// One open column page.
pub struct ColumnData {
    file: Box<dyn DbFile>,
    column: ColumnPage,
}

impl ColumnData {
    pub fn new(file: Box<dyn DbFile>, column: ColumnPage) -> Self {
        Self { file, column }
    }

    pub fn column(&self) -> &ColumnPage {
        &self.column
    }

    fn cell_size(&self) -> u64 {
        self.column.cell_size() as u64
    }

    fn cell_offset(&self, offset: u64) -> u64 {
        HEADER_SIZE + offset * self.cell_size()
    }

    pub fn is_empty(&mut self) -> StorageResult<bool> {
        Ok(self.file.len()? == 0)
    }

    /// Pre-size the file for `rows` cells so later cell writes never grow
    /// it. Extension is zero-filled, which reads back as all-null cells.
    pub fn preserve_space(&mut self, rows: u64) -> StorageResult<()> {
        let wanted = HEADER_SIZE + rows * self.cell_size();
        if self.file.len()? < wanted {
            self.file.truncate(wanted)?;
        }
        Ok(())
    }

    /// Number of cells ever written to this page (highest used in-page
    /// offset plus one). Unaffected by deletions.
    pub fn cell_count(&mut self) -> StorageResult<u64> {
        if self.file.len()? < HEADER_SIZE {
            return Ok(0);
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        self.file.read_exact_at(0, &mut header)?;
        Ok(u64::from_be_bytes(header))
    }

    fn bump_cell_count(&mut self, offset: u64) -> StorageResult<()> {
        if self.cell_count()? < offset + 1 {
            self.file.write_all_at(0, &(offset + 1).to_be_bytes())?;
        }
        Ok(())
    }

    /// Cheap existence probe: one header read plus one presence byte.
    pub fn is_cell_set(&mut self, offset: u64) -> StorageResult<bool> {
        if offset >= self.cell_count()? {
            return Ok(false);
        }
        let mut presence = [0u8; 1];
        self.file.read_exact_at(self.cell_offset(offset), &mut presence)?;
        Ok(presence[0] != 0)
    }

    /// Read one cell payload; `None` for null (or never-written) cells.
    pub fn get_cell(&mut self, offset: u64) -> StorageResult<Option<Vec<u8>>> {
        if !self.is_cell_set(offset)? {
            return Ok(None);
        }
        let mut payload = vec![0u8; self.column.payload_size() as usize];
        self.file
            .read_exact_at(self.cell_offset(offset) + 1, &mut payload)?;
        Ok(Some(payload))
    }

    /// Write one cell payload; marks the cell live and raises the
    /// watermark when the offset is beyond it.
    pub fn set_cell(&mut self, offset: u64, payload: &[u8]) -> StorageResult<()> {
        let expected = self.column.payload_size() as usize;
        if payload.len() != expected {
            return Err(StorageError::InvalidArgument(format!(
                "cell payload of {} bytes for column '{}' (expected {expected})",
                payload.len(),
                self.column.name
            )));
        }
        let mut cell = Vec::with_capacity(expected + 1);
        cell.push(1u8);
        cell.extend_from_slice(payload);
        self.file.write_all_at(self.cell_offset(offset), &cell)?;
        self.bump_cell_count(offset)
    }

    /// Null out one cell. The watermark keeps recording that the offset
    /// was used.
    pub fn remove_cell(&mut self, offset: u64) -> StorageResult<()> {
        let cell = vec![0u8; self.column.cell_size() as usize];
        self.file.write_all_at(self.cell_offset(offset), &cell)?;
        Ok(())
    }
}
