//! Instruction/response corpus loading from JSONL files.

use crate::{Error, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// One instruction/response pair.
///
/// Missing fields deserialize as empty strings; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Record {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub response: String,
}

/// Load all records from a JSONL file.
///
/// One JSON object per non-blank line, in file order. Whitespace-only lines
/// are skipped. A malformed line fails the whole load with its 1-based line
/// number; there is no partial success.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Corpus(format!("cannot read {}: {e}", path.display())))?;

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line).map_err(|e| {
            Error::Corpus(format!("{}:{}: invalid JSON: {e}", path.display(), line_no + 1))
        })?;
        records.push(record);
    }

    Ok(records)
}

/// SHA-256 digest of the raw corpus file, for run provenance.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let bytes = std::fs::read(path.as_ref())?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}
