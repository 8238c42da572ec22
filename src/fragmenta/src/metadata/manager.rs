use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::{PROTECTED_TAGS, TAG_CREATION_TIME, TAG_LAST_MODIFIED};
use crate::error::{FragmentaError, Result};
use crate::handle::StoreContext;

use super::query::{Condition, MetadataQuery, QueryResult};

/// One operation inside a [`MetadataBatch`] (§4.4).
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set { tag: u16, value: Vec<u8> },
    Delete { tag: u16 },
    /// Appends `value` to the tag's current bytes, treating an absent tag as empty.
    Append { tag: u16, value: Vec<u8> },
}

/// A sequence of metadata operations applied together (§4.4).
#[derive(Debug, Clone, Default)]
pub struct MetadataBatch {
    pub ops: Vec<BatchOp>,
    /// Hold the write guard for the whole batch so intermediate states are
    /// never observed by a concurrent reader.
    pub atomic: bool,
    /// On the first failing op, restore the pre-batch snapshot and return
    /// that error (the "preferred implementation" of Design Note 2).
    pub rollback_on_error: bool,
}

struct MetadataState {
    map: HashMap<u16, Vec<u8>>,
    dirty: bool,
    last_modified: i64,
}

pub struct MetadataManager {
    ctx: Arc<StoreContext>,
    state: RwLock<MetadataState>,
}

impl MetadataManager {
    pub(crate) fn new(ctx: Arc<StoreContext>) -> Self {
        MetadataManager {
            ctx,
            state: RwLock::new(MetadataState {
                map: HashMap::new(),
                dirty: false,
                last_modified: 0,
            }),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().unwrap().dirty
    }

    pub fn clear_dirty(&self) {
        self.state.write().unwrap().dirty = false;
    }

    pub fn set(&self, tag: u16, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        self.apply_set(&mut state, tag, value);
        Ok(())
    }

    fn apply_set(&self, state: &mut MetadataState, tag: u16, value: Vec<u8>) {
        if tag == TAG_CREATION_TIME && value.len() == 8 {
            let mut header = self.ctx.header.write().unwrap();
            if header.creation_timestamp == 0 {
                header.creation_timestamp = (&value[..]).read_i64::<BigEndian>().unwrap_or(0);
            }
        }
        if tag == TAG_LAST_MODIFIED && value.len() == 8 {
            if let Ok(ts) = (&value[..]).read_i64::<BigEndian>() {
                self.ctx.header.write().unwrap().last_modified = ts;
                state.last_modified = ts;
            }
        }
        state.map.insert(tag, value);
        state.dirty = true;
    }

    pub fn get(&self, tag: u16) -> Result<Vec<u8>> {
        let state = self.state.read().unwrap();
        state
            .map
            .get(&tag)
            .cloned()
            .ok_or(FragmentaError::MetadataNotFound { tag })
    }

    pub fn delete(&self, tag: u16) -> Result<()> {
        let mut state = self.state.write().unwrap();
        self.apply_delete(&mut state, tag)
    }

    fn apply_delete(&self, state: &mut MetadataState, tag: u16) -> Result<()> {
        if PROTECTED_TAGS.contains(&tag) {
            return Err(FragmentaError::ProtectedMetadata { tag });
        }
        if state.map.remove(&tag).is_none() {
            return Err(FragmentaError::MetadataNotFound { tag });
        }
        state.dirty = true;
        Ok(())
    }

    pub fn list(&self) -> HashMap<u16, Vec<u8>> {
        self.state.read().unwrap().map.clone()
    }

    /// Applies every op in `batch`. See [`MetadataBatch`] for the atomicity
    /// and rollback semantics.
    pub fn batch(&self, batch: MetadataBatch) -> Result<()> {
        if batch.atomic {
            let mut state = self.state.write().unwrap();
            let snapshot = batch.rollback_on_error.then(|| state.map.clone());
            if let Err(err) = self.apply_ops(&mut state, &batch.ops) {
                if let Some(snapshot) = snapshot {
                    state.map = snapshot;
                }
                return Err(err);
            }
            Ok(())
        } else {
            let snapshot = if batch.rollback_on_error {
                Some(self.state.read().unwrap().map.clone())
            } else {
                None
            };
            for op in &batch.ops {
                let result = {
                    let mut state = self.state.write().unwrap();
                    self.apply_one(&mut state, op)
                };
                if let Err(err) = result {
                    if let Some(snapshot) = snapshot {
                        self.state.write().unwrap().map = snapshot;
                    }
                    return Err(err);
                }
            }
            Ok(())
        }
    }

    fn apply_ops(&self, state: &mut MetadataState, ops: &[BatchOp]) -> Result<()> {
        for op in ops {
            self.apply_one(state, op)?;
        }
        Ok(())
    }

    fn apply_one(&self, state: &mut MetadataState, op: &BatchOp) -> Result<()> {
        match op {
            BatchOp::Set { tag, value } => {
                self.apply_set(state, *tag, value.clone());
                Ok(())
            }
            BatchOp::Delete { tag } => self.apply_delete(state, *tag),
            BatchOp::Append { tag, value } => {
                let mut current = state.map.get(tag).cloned().unwrap_or_default();
                current.extend_from_slice(value);
                self.apply_set(state, *tag, current);
                Ok(())
            }
        }
    }

    pub fn query(&self, query: &MetadataQuery) -> Result<QueryResult> {
        let state = self.state.read().unwrap();
        super::query::evaluate(query, &state.map)
    }

    /// Loads the metadata region per §4.4: empty map if `MetadataSize == 0`,
    /// else `count` followed by `count` `{tag,size,flags,reserved,value}` entries.
    pub fn load<R: std::io::Read + std::io::Seek>(&self, reader: &mut R) -> Result<()> {
        let (metadata_offset, metadata_size) = {
            let header = self.ctx.header.read().unwrap();
            (header.metadata_offset, header.metadata_size)
        };

        let mut map = HashMap::new();
        if metadata_size != 0 {
            reader.seek(std::io::SeekFrom::Start(metadata_offset))?;
            let count = reader.read_u32::<BigEndian>()?;
            for _ in 0..count {
                let tag = reader.read_u16::<BigEndian>()?;
                let size = reader.read_u16::<BigEndian>()?;
                let _flags = reader.read_u8()?;
                let _reserved = reader.read_u8()?;
                let mut value = vec![0u8; size as usize];
                reader.read_exact(&mut value)?;
                map.insert(tag, value);
            }
        }

        let mut state = self.state.write().unwrap();
        state.map = map;
        state.dirty = false;
        Ok(())
    }

    /// Serializes the metadata region per §3.2/§4.4 and returns its bytes
    /// (the caller — [`crate::store::Store`] — positions them relative to
    /// `BlockOffset` and updates `MetadataSize`).
    pub fn serialize(&self) -> Vec<u8> {
        let state = self.state.read().unwrap();
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(state.map.len() as u32).unwrap();
        for (tag, value) in state.map.iter() {
            out.write_u16::<BigEndian>(*tag).unwrap();
            out.write_u16::<BigEndian>(value.len() as u16).unwrap();
            out.write_u8(0).unwrap(); // flags
            out.write_u8(0).unwrap(); // reserved
            out.extend_from_slice(value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{StorageMode, TAG_FRAGMENTA_TYPE, TAG_VERSION};
    use crate::header::StoreHeader;
    use std::sync::Arc;
    use tempfile::tempfile;

    fn manager() -> MetadataManager {
        let file = tempfile().unwrap();
        let header = StoreHeader::new(StorageMode::Container, [0u8; 16]);
        let ctx = Arc::new(StoreContext::new(file, header));
        MetadataManager::new(ctx)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mgr = manager();
        mgr.set(0x1001, b"hello".to_vec()).unwrap();
        assert_eq!(mgr.get(0x1001).unwrap(), b"hello");
        mgr.delete(0x1001).unwrap();
        assert!(matches!(mgr.get(0x1001), Err(FragmentaError::MetadataNotFound { .. })));
    }

    #[test]
    fn protected_tags_cannot_be_deleted() {
        let mgr = manager();
        mgr.set(TAG_VERSION, vec![1, 0]).unwrap();
        mgr.set(TAG_FRAGMENTA_TYPE, b"fragmenta".to_vec()).unwrap();
        for tag in PROTECTED_TAGS {
            let err = mgr.delete(tag);
            assert!(matches!(err, Err(FragmentaError::ProtectedMetadata { .. })));
        }
    }

    #[test]
    fn batch_atomic_rollback_restores_snapshot() {
        let mgr = manager();
        mgr.set(0x1001, b"value1".to_vec()).unwrap();

        let batch = MetadataBatch {
            ops: vec![
                BatchOp::Set { tag: 0x1002, value: b"value2".to_vec() },
                BatchOp::Delete { tag: 0x9999 }, // fails: not found
            ],
            atomic: true,
            rollback_on_error: true,
        };
        let err = mgr.batch(batch).unwrap_err();
        assert!(matches!(err, FragmentaError::MetadataNotFound { .. }));
        // 0x1002 should have been rolled back.
        assert!(matches!(mgr.get(0x1002), Err(FragmentaError::MetadataNotFound { .. })));
        assert_eq!(mgr.get(0x1001).unwrap(), b"value1");
    }

    #[test]
    fn batch_without_rollback_keeps_partial_effects() {
        let mgr = manager();
        let batch = MetadataBatch {
            ops: vec![
                BatchOp::Set { tag: 0x1002, value: b"value2".to_vec() },
                BatchOp::Delete { tag: 0x9999 },
            ],
            atomic: true,
            rollback_on_error: false,
        };
        let err = mgr.batch(batch).unwrap_err();
        assert!(matches!(err, FragmentaError::MetadataNotFound { .. }));
        assert_eq!(mgr.get(0x1002).unwrap(), b"value2");
    }

    #[test]
    fn append_concatenates_bytes() {
        let mgr = manager();
        mgr.batch(MetadataBatch {
            ops: vec![
                BatchOp::Set { tag: 0x1001, value: b"foo".to_vec() },
                BatchOp::Append { tag: 0x1001, value: b"bar".to_vec() },
            ],
            atomic: true,
            rollback_on_error: false,
        })
        .unwrap();
        assert_eq!(mgr.get(0x1001).unwrap(), b"foobar");
    }

    #[test]
    fn serialize_and_load_roundtrip() {
        let mgr = manager();
        mgr.set(0x1001, b"a".to_vec()).unwrap();
        mgr.set(0x1002, b"bc".to_vec()).unwrap();

        let bytes = mgr.serialize();
        {
            let mut header = mgr.ctx.header.write().unwrap();
            header.metadata_size = bytes.len() as u64;
        }

        let mut cursor = std::io::Cursor::new(vec![0u8; mgr.ctx.header.read().unwrap().metadata_offset as usize]);
        cursor.get_mut().extend_from_slice(&bytes);

        let mgr2 = manager();
        {
            let mut header = mgr2.ctx.header.write().unwrap();
            header.metadata_offset = mgr.ctx.header.read().unwrap().metadata_offset;
            header.metadata_size = bytes.len() as u64;
        }
        mgr2.load(&mut cursor).unwrap();
        assert_eq!(mgr2.get(0x1001).unwrap(), b"a");
        assert_eq!(mgr2.get(0x1002).unwrap(), b"bc");
    }
}
