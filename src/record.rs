use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Leading bytes of every staging artifact.
const MAGIC: &[u8; 4] = b"LTRR";

/// Bumped whenever the layout of [`ResultRecord`] changes.
const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 1;

/// The result of one worker run: an approximation of Euler's number and how it was obtained.
///
/// Every run generates a fresh [`Uuid`], so a record left over from an earlier run can be told
/// apart from the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub uuid: Uuid,
    pub e_value: f64,
    pub duration: Duration,
    pub iterations: u64,
}

impl ResultRecord {
    /// Creates an empty record with a freshly generated identifier.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            e_value: 0.0,
            duration: Duration::ZERO,
            iterations: 0,
        }
    }

    /// Encodes the record into the staging artifact format.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a staging artifact, describing what is wrong with it on failure.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("{} bytes is too short for the header", bytes.len()));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        if &header[..MAGIC.len()] != MAGIC {
            return Err("bad magic".into());
        }
        let version = header[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {version} (expected {FORMAT_VERSION})"
            ));
        }

        let record: Self = bincode::deserialize(body).map_err(|e| e.to_string())?;
        let expected = bincode::serialized_size(&record).map_err(|e| e.to_string())?;
        if expected != body.len() as u64 {
            return Err(format!(
                "{} trailing bytes after record",
                body.len() as u64 - expected
            ));
        }
        Ok(record)
    }
}

impl Default for ResultRecord {
    fn default() -> Self {
        Self::new()
    }
}
