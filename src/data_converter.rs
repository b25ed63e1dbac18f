//! Binary codec between textual values and fixed-size cell payloads.
//!
//! Every cell of a column has the exact payload width reported by
//! [`DataType::byte_length`]; the codec pads or rejects values so page
//! arithmetic never depends on cell contents.

use crate::errors::{StorageError, StorageResult};
use crate::schema::DataType;

pub struct DataConverter;

impl DataConverter {
    pub fn new() -> Self {
        Self
    }

    /// Encode a textual value into the fixed-width payload for the given
    /// type. Fails with [`StorageError::InvalidArgument`] when the value
    /// does not parse or does not fit.
    pub fn string_to_binary(
        &self,
        value: &str,
        data_type: DataType,
        length: u32,
        second_length: u32,
    ) -> StorageResult<Vec<u8>> {
        let width = data_type.byte_length(length, second_length) as usize;
        let payload = match data_type {
            DataType::Bool => {
                let bit = match value {
                    "0" | "false" | "FALSE" => 0u8,
                    "1" | "true" | "TRUE" => 1u8,
                    other => {
                        return Err(StorageError::InvalidArgument(format!(
                            "'{other}' is not a boolean"
                        )))
                    }
                };
                vec![bit]
            }
            DataType::TinyInt => Self::int_bytes(value, 1)?,
            DataType::SmallInt => Self::int_bytes(value, 2)?,
            DataType::Int => Self::int_bytes(value, 4)?,
            DataType::BigInt => Self::int_bytes(value, 8)?,
            DataType::Year => {
                let year: u16 = value.parse().map_err(|_| {
                    StorageError::InvalidArgument(format!("'{value}' is not a year"))
                })?;
                year.to_be_bytes().to_vec()
            }
            DataType::Float => {
                let f: f32 = value.parse().map_err(|_| {
                    StorageError::InvalidArgument(format!("'{value}' is not a float"))
                })?;
                f.to_be_bytes().to_vec()
            }
            DataType::Double => {
                let f: f64 = value.parse().map_err(|_| {
                    StorageError::InvalidArgument(format!("'{value}' is not a double"))
                })?;
                f.to_be_bytes().to_vec()
            }
            DataType::Timestamp => {
                let secs: u64 = value.parse().map_err(|_| {
                    StorageError::InvalidArgument(format!(
                        "'{value}' is not an epoch-seconds timestamp"
                    ))
                })?;
                secs.to_be_bytes().to_vec()
            }
            //  Text-shaped types: stored as bytes, right-padded with NULs.
            DataType::Decimal
            | DataType::Date
            | DataType::Time
            | DataType::DateTime
            | DataType::Char
            | DataType::Varchar
            | DataType::Text
            | DataType::Blob => {
                let bytes = value.as_bytes();
                if bytes.len() > width {
                    return Err(StorageError::InvalidArgument(format!(
                        "value of {} bytes exceeds the {width}-byte cell",
                        bytes.len()
                    )));
                }
                bytes.to_vec()
            }
        };
        debug_assert!(payload.len() <= width);
        let mut cell = payload;
        cell.resize(width, 0);
        Ok(cell)
    }

    /// Decode a fixed-width payload back into its textual form.
    pub fn binary_to_string(&self, payload: &[u8], data_type: DataType) -> StorageResult<String> {
        Ok(match data_type {
            DataType::Bool => {
                if payload.first().copied().unwrap_or(0) == 0 {
                    "0".to_string()
                } else {
                    "1".to_string()
                }
            }
            DataType::TinyInt => Self::int_from_bytes(payload, 1)?.to_string(),
            DataType::SmallInt => Self::int_from_bytes(payload, 2)?.to_string(),
            DataType::Int => Self::int_from_bytes(payload, 4)?.to_string(),
            DataType::BigInt => Self::int_from_bytes(payload, 8)?.to_string(),
            DataType::Year => {
                let bytes: [u8; 2] = payload
                    .get(..2)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| {
                        StorageError::InvalidArgument("truncated year cell".to_string())
                    })?;
                u16::from_be_bytes(bytes).to_string()
            }
            DataType::Float => {
                let bytes: [u8; 4] = payload
                    .get(..4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| {
                        StorageError::InvalidArgument("truncated float cell".to_string())
                    })?;
                f32::from_be_bytes(bytes).to_string()
            }
            DataType::Double => {
                let bytes: [u8; 8] = payload
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| {
                        StorageError::InvalidArgument("truncated double cell".to_string())
                    })?;
                f64::from_be_bytes(bytes).to_string()
            }
            DataType::Timestamp => {
                let bytes: [u8; 8] = payload
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| {
                        StorageError::InvalidArgument("truncated timestamp cell".to_string())
                    })?;
                u64::from_be_bytes(bytes).to_string()
            }
            DataType::Decimal
            | DataType::Date
            | DataType::Time
            | DataType::DateTime
            | DataType::Char
            | DataType::Varchar
            | DataType::Text
            | DataType::Blob => {
                let end = payload
                    .iter()
                    .rposition(|&b| b != 0)
                    .map(|p| p + 1)
                    .unwrap_or(0);
                String::from_utf8(payload[..end].to_vec()).map_err(|_| {
                    StorageError::InvalidArgument("cell payload is not valid utf-8".to_string())
                })?
            }
        })
    }

    /// Two's-complement big-endian encoding at the given width.
    fn int_bytes(value: &str, width: usize) -> StorageResult<Vec<u8>> {
        let n: i64 = value
            .trim()
            .parse()
            .map_err(|_| StorageError::InvalidArgument(format!("'{value}' is not an integer")))?;
        let bits = (width * 8) as u32;
        if width < 8 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if n < min || n > max {
                return Err(StorageError::InvalidArgument(format!(
                    "{n} out of range for a {width}-byte integer"
                )));
            }
        }
        Ok(n.to_be_bytes()[8 - width..].to_vec())
    }

    /// Sign-extending decode of a big-endian integer cell.
    fn int_from_bytes(payload: &[u8], width: usize) -> StorageResult<i64> {
        let bytes = payload.get(..width).ok_or_else(|| {
            StorageError::InvalidArgument("truncated integer cell".to_string())
        })?;
        let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
        let mut full = [fill; 8];
        full[8 - width..].copy_from_slice(bytes);
        Ok(i64::from_be_bytes(full))
    }
}

impl Default for DataConverter {
    fn default() -> Self {
        Self::new()
    }
}
