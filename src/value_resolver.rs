//! Default-value resolution.
//!
//! Literal defaults resolve to themselves (quotes stripped); context
//! dependent defaults such as `CURRENT_TIMESTAMP` resolve against the
//! moment of the call, which is why columns of types that carry such
//! defaults store the raw text and re-resolve on every insert.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{StorageError, StorageResult};

pub struct ValueResolver;

impl ValueResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, raw: &str) -> StorageResult<String> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("CURRENT_TIMESTAMP")
            || trimmed.eq_ignore_ascii_case("NOW()")
        {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| {
                    StorageError::InvalidArgument("system clock before unix epoch".to_string())
                })?;
            return Ok(now.as_secs().to_string());
        }
        //  Quoted literal: strip one layer of matching quotes.
        let bytes = trimmed.as_bytes();
        if bytes.len() >= 2 {
            let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
            if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
                return Ok(trimmed[1..trimmed.len() - 1].to_string());
            }
        }
        Ok(trimmed.to_string())
    }
}

impl Default for ValueResolver {
    fn default() -> Self {
        Self::new()
    }
}
