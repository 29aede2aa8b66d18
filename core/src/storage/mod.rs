//! Persistence boundary
//!
//! The core never talks to a database. A persistence collaborator
//! implements [`StorageAdapter`] over opaque bytes produced by
//! [`CrdtValue::to_bytes`](crate::crdt::CrdtValue::to_bytes); the store
//! writes and reads whole instances through it.

use crate::crdt::CrdtValue;
use crate::error::{Result, SyncError};
use crate::ObjectId;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Key-value persistence for serialized CRDT instances
pub trait StorageAdapter: Send + Sync {
    fn save(&self, object_id: &str, bytes: &[u8]) -> Result<()>;

    /// `None` if nothing is stored under `object_id`
    fn load(&self, object_id: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether anything was removed
    fn delete(&self, object_id: &str) -> Result<bool>;

    fn list(&self) -> Result<Vec<ObjectId>>;
}

/// In-process storage, mainly for tests and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<ObjectId, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl StorageAdapter for MemoryStorage {
    fn save(&self, object_id: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(object_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, object_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(object_id).cloned())
    }

    fn delete(&self, object_id: &str) -> Result<bool> {
        Ok(self.objects.write().remove(object_id).is_some())
    }

    fn list(&self) -> Result<Vec<ObjectId>> {
        Ok(self.objects.read().keys().cloned().collect())
    }
}

/// Encode a value as base64 text (for text-only stores)
pub fn export_base64(value: &CrdtValue) -> Result<String> {
    let engine = base64::engine::general_purpose::STANDARD;
    Ok(engine.encode(value.to_bytes()?))
}

/// Decode a value written by [`export_base64`]
pub fn import_base64(text: &str) -> Result<CrdtValue> {
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine
        .decode(text.trim())
        .map_err(|e| SyncError::Serialization(format!("invalid base64: {}", e)))?;
    CrdtValue::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::OrSet;

    #[test]
    fn test_memory_storage_crud() {
        let storage = MemoryStorage::new();
        storage.save("a", b"one").unwrap();
        storage.save("b", b"two").unwrap();
        storage.save("a", b"three").unwrap();

        assert_eq!(storage.load("a").unwrap(), Some(b"three".to_vec()));
        assert_eq!(storage.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(storage.delete("a").unwrap());
        assert!(!storage.delete("a").unwrap());
        assert_eq!(storage.load("a").unwrap(), None);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_base64_export() {
        let mut set = OrSet::new();
        set.add("x".to_string(), "n1");
        set.add("y".to_string(), "n2");
        set.remove(&"x".to_string());
        let value = CrdtValue::from(set);

        let text = export_base64(&value).unwrap();
        let restored = import_base64(&text).unwrap();

        assert_eq!(restored, value);
        assert_eq!(restored.value_json().unwrap(), serde_json::json!(["y"]));
    }

    #[test]
    fn test_base64_rejects_garbage() {
        assert!(matches!(
            import_base64("not base64!"),
            Err(SyncError::Serialization(_))
        ));
    }
}
