//! Series labels and the canonical binary partition-key encoding.

use crate::{MemShardError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Maximum length of label name.
pub const MAX_LABEL_NAME_LEN: usize = 256;

/// Maximum length of label value.
pub const MAX_LABEL_VALUE_LEN: usize = 16 * 1024;

/// A series label. A label with a missing or oversized name or value does
/// not marshal; it is rejected, never silently altered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Creates a new label. The content is validated at marshal time.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Checks that the label can be carried by the key encoding: name and
    /// value non-empty and within the length limits.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.value.is_empty() {
            return Err(MemShardError::InvalidSeriesKey(
                "label name and value must be non-empty".to_string(),
            ));
        }
        if self.name.len() > MAX_LABEL_NAME_LEN {
            return Err(MemShardError::InvalidSeriesKey(format!(
                "label name of {} bytes exceeds the {MAX_LABEL_NAME_LEN}-byte limit",
                self.name.len()
            )));
        }
        if self.value.len() > MAX_LABEL_VALUE_LEN {
            return Err(MemShardError::InvalidSeriesKey(format!(
                "label value of {} bytes exceeds the {MAX_LABEL_VALUE_LEN}-byte limit",
                self.value.len()
            )));
        }
        Ok(())
    }

    /// Convenience form of [`Label::validate`].
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.name.cmp(&other.name) {
            Ordering::Equal => self.value.cmp(&other.value),
            other => other,
        }
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Marshals a label set into the canonical binary partition key.
///
/// Labels are sorted by (name, value) so equal label sets always produce the
/// same bytes, and distinct label sets never collide: every byte of every
/// label is carried verbatim, so any label the limits cannot hold is an
/// error. Layout: u16 label count, then per label a u16-length-prefixed name
/// followed by a u16-length-prefixed value, all little-endian.
pub fn marshal_series_key(labels: &[Label]) -> Result<Vec<u8>> {
    for label in labels {
        label.validate()?;
    }

    let mut sorted: Vec<&Label> = labels.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut size = 2;
    for label in &sorted {
        size += 4 + label.name.len() + label.value.len();
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(sorted.len() as u16).to_le_bytes());

    for label in &sorted {
        let name = label.name.as_bytes();
        let value = label.value.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
    }

    Ok(out)
}

/// Unmarshals a canonical binary partition key back into its labels.
pub fn unmarshal_series_key(key: &[u8]) -> Result<Vec<Label>> {
    let mut pos = 0usize;

    let count = read_u16(key, &mut pos)? as usize;
    let mut labels = Vec::with_capacity(count);

    for _ in 0..count {
        let name_len = read_u16(key, &mut pos)? as usize;
        let name = read_bytes(key, &mut pos, name_len)?;
        let value_len = read_u16(key, &mut pos)? as usize;
        let value = read_bytes(key, &mut pos, value_len)?;

        labels.push(Label {
            name: String::from_utf8(name.to_vec())
                .map_err(|e| MemShardError::InvalidSeriesKey(e.to_string()))?,
            value: String::from_utf8(value.to_vec())
                .map_err(|e| MemShardError::InvalidSeriesKey(e.to_string()))?,
        });
    }

    if pos != key.len() {
        return Err(MemShardError::InvalidSeriesKey(format!(
            "{} trailing bytes after {} labels",
            key.len() - pos,
            count
        )));
    }

    Ok(labels)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    let bytes = read_bytes(buf, pos, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| MemShardError::InvalidSeriesKey("length overflow".to_string()))?;
    if end > buf.len() {
        return Err(MemShardError::InvalidSeriesKey(format!(
            "truncated key: need {} bytes at offset {}, have {}",
            len,
            pos,
            buf.len()
        )));
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}
