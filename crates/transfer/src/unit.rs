//! Transfer units and their stable identifiers.

use std::borrow::Borrow;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier of a transfer unit; the checkpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an identifier from a source locator: the first 16 hex
    /// characters of its SHA-256.
    pub fn from_locator(locator: &str) -> Self {
        let digest = Sha256::digest(locator.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for UnitId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which storage operation moves a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `source` is a local file, `destination` an object key (`put`).
    #[default]
    Upload,
    /// `source` is an object key or URL, `destination` a local file (`get`).
    Download,
}

/// One file to move. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UnitRecord")]
pub struct TransferUnit {
    id: UnitId,
    source: String,
    destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_hint: Option<u64>,
}

/// Wire form of a unit; `id` may be omitted and is then derived from `source`.
#[derive(Deserialize)]
struct UnitRecord {
    #[serde(default)]
    id: Option<String>,
    source: String,
    destination: String,
    #[serde(default)]
    size_hint: Option<u64>,
}

impl From<UnitRecord> for TransferUnit {
    fn from(r: UnitRecord) -> Self {
        let id = match r.id {
            Some(id) if !id.is_empty() => UnitId::new(id),
            _ => UnitId::from_locator(&r.source),
        };
        Self {
            id,
            source: r.source,
            destination: r.destination,
            size_hint: r.size_hint,
        }
    }
}

impl TransferUnit {
    /// Creates a unit whose id is derived from `source`.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: UnitId::from_locator(&source),
            source,
            destination: destination.into(),
            size_hint: None,
        }
    }

    /// Creates a unit with a caller-chosen id.
    pub fn with_id(
        id: impl Into<UnitId>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            size_hint: None,
        }
    }

    /// Returns a copy carrying an expected size in bytes.
    pub fn sized(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// The side of the transfer that lives on the local filesystem.
    pub fn local_path(&self, direction: Direction) -> &Path {
        match direction {
            Direction::Upload => Path::new(&self.source),
            Direction::Download => Path::new(&self.destination),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_is_stable() {
        let a = TransferUnit::new("/staging/pdb/1abc.cif.gz", "pdb/1abc.cif.gz");
        let b = TransferUnit::new("/staging/pdb/1abc.cif.gz", "other/key");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().as_str().len(), 16);

        let c = TransferUnit::new("/staging/pdb/2xyz.cif.gz", "pdb/2xyz.cif.gz");
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn deserialize_without_id_derives_one() {
        let json = r#"{"source":"/staging/a.cif","destination":"pdb/a.cif","size_hint":12}"#;
        let unit: TransferUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.id(), &UnitId::from_locator("/staging/a.cif"));
        assert_eq!(unit.size_hint(), Some(12));
    }

    #[test]
    fn deserialize_keeps_explicit_id() {
        let json = r#"{"id":"unit_3","source":"s","destination":"d"}"#;
        let unit: TransferUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.id().as_str(), "unit_3");
        assert_eq!(unit.size_hint(), None);
    }

    #[test]
    fn local_path_follows_direction() {
        let unit = TransferUnit::with_id("u", "/local/a.cif", "remote/a.cif");
        assert_eq!(unit.local_path(Direction::Upload), Path::new("/local/a.cif"));
        assert_eq!(
            unit.local_path(Direction::Download),
            Path::new("remote/a.cif")
        );
    }

    #[test]
    fn direction_serde_lowercase() {
        let d: Direction = serde_json::from_str("\"download\"").unwrap();
        assert_eq!(d, Direction::Download);
        assert_eq!(serde_json::to_string(&Direction::Upload).unwrap(), "\"upload\"");
    }
}
