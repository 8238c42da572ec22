//! Block allocation, linking, checksum verification, and the linear-scan
//! lookup fallback (§4.3).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use md5::{Digest, Md5};

use super::header::BlockHeader;
use crate::constants::{BlockFlags, BlockType, BLOCK_HEADER_SIZE};
use crate::error::{FragmentaError, Result};
use crate::handle::StoreContext;
use crate::security::SecurityManager;

/// Bounded size of the in-memory payload cache; headers are cached without bound
/// (they are tiny — 64 bytes each) but decoded payloads can be large.
const PAYLOAD_CACHE_CAPACITY: usize = 128;

/// Inputs to [`BlockManager::write_block`] (§4.3).
#[derive(Debug, Clone, Default)]
pub struct WriteBlockOptions {
    pub block_type: BlockType,
    pub compress: bool,
    pub encrypt: bool,
    pub checksum: bool,
    pub append_to_id: Option<u32>,
}

impl Default for BlockType {
    fn default() -> Self {
        BlockType::Normal
    }
}

struct BlockManagerState {
    next_id: u32,
    free_list: Vec<u32>,
    /// id -> (physical file offset, header). Memoized lazily on first touch.
    headers: HashMap<u32, (u64, BlockHeader)>,
    /// id -> logical (post-decrypt) payload, bounded LRU via `cache_order`.
    payloads: HashMap<u32, Vec<u8>>,
    cache_order: VecDeque<u32>,
    /// Ids that were deleted: a stale on-disk block with this id must never
    /// be resurrected by a later linear scan.
    deleted: HashSet<u32>,
    /// True once we've scanned all the way to the end of the block region
    /// at least once (`GetBlockInfo`/`ReadBlock` can then trust a cache miss).
    fully_scanned: bool,
}

pub struct BlockManager {
    ctx: Arc<StoreContext>,
    security: RwLock<Option<Arc<dyn SecurityManager>>>,
    state: RwLock<BlockManagerState>,
}

impl BlockManager {
    pub(crate) fn new(ctx: Arc<StoreContext>, security: Option<Arc<dyn SecurityManager>>) -> Self {
        BlockManager {
            ctx,
            security: RwLock::new(security),
            state: RwLock::new(BlockManagerState {
                next_id: 1,
                free_list: Vec::new(),
                headers: HashMap::new(),
                payloads: HashMap::new(),
                cache_order: VecDeque::new(),
                deleted: HashSet::new(),
                fully_scanned: false,
            }),
        }
    }

    /// Allocates the next block id: the free-list head if non-empty, else
    /// the monotonic counter (§4.3 Id assignment).
    fn next_id(state: &mut BlockManagerState) -> u32 {
        if let Some(id) = state.free_list.pop() {
            id
        } else {
            let id = state.next_id;
            state.next_id += 1;
            id
        }
    }

    pub fn write_block(&self, payload: &[u8], options: WriteBlockOptions) -> Result<u32> {
        let mut state = self.state.write().unwrap();

        let predecessor_offset = if let Some(pred_id) = options.append_to_id {
            Some(self.locate(&mut state, pred_id)?)
        } else {
            None
        };

        let id = Self::next_id(&mut state);
        state.deleted.remove(&id);

        let mut flags = BlockFlags::empty();
        if options.compress {
            flags.insert(BlockFlags::COMPRESSED);
        }

        let mut on_disk_payload = payload.to_vec();
        if options.encrypt {
            if let Some(security) = self.security.read().unwrap().as_ref() {
                on_disk_payload = security.encrypt(id, payload)?;
                flags.insert(BlockFlags::ENCRYPTED);
            }
        }

        let checksum = if options.checksum {
            flags.insert(BlockFlags::CHECKSUM_PRESENT);
            md5_of(&on_disk_payload)
        } else {
            [0u8; 16]
        };

        let timestamp = now_nanos();
        let mut header = BlockHeader::new(id, options.block_type, on_disk_payload.len() as u32, timestamp);
        header.flags = flags;
        header.checksum = checksum;
        if let Some(pred_id) = options.append_to_id {
            header.previous_block = pred_id;
        }

        let physical_offset = {
            let mut store_header = self.ctx.header.write().unwrap();
            if store_header.block_offset == 0 {
                store_header.block_offset = store_header.metadata_offset + store_header.metadata_size;
            }
            let offset = store_header.block_offset + store_header.block_size;
            store_header.block_size += header.total_size();
            store_header.total_size = store_header.block_offset + store_header.block_size;
            offset
        };

        let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + on_disk_payload.len());
        header.write_to(&mut bytes)?;
        bytes.extend_from_slice(&on_disk_payload);
        self.ctx.write_at(physical_offset, &bytes)?;

        if let Some(pred_offset) = predecessor_offset {
            self.patch_next(&mut state, pred_offset, id)?;
        }

        state.headers.insert(id, (physical_offset, header));
        self.cache_payload(&mut state, id, payload.to_vec());

        Ok(id)
    }

    pub fn read_block(&self, id: u32) -> Result<Vec<u8>> {
        let mut state = self.state.write().unwrap();
        if state.deleted.contains(&id) {
            return Err(FragmentaError::BlockNotFound { block_id: id });
        }

        let offset = self.locate(&mut state, id)?;
        let (_, header) = *state.headers.get(&id).unwrap();

        // A checksummed block must be re-verified against disk on every
        // read, so the payload cache is only a valid shortcut when there's
        // no checksum to check: otherwise a write followed by an on-disk
        // corruption and a read would just hand back the stale cached bytes.
        let checksummed = header.flags.contains(BlockFlags::CHECKSUM_PRESENT);
        if !checksummed {
            if let Some(payload) = state.payloads.get(&id) {
                return Ok(payload.clone());
            }
        }

        let mut raw = vec![0u8; header.payload_size as usize];
        self.ctx.read_at(offset + BLOCK_HEADER_SIZE, &mut raw)?;

        if checksummed {
            let computed = md5_of(&raw);
            if computed != header.checksum {
                warn!("checksum mismatch for block {id}");
                return Err(FragmentaError::ChecksumMismatch { block_id: id });
            }
        }

        let logical = if header.flags.contains(BlockFlags::ENCRYPTED) {
            match self.security.read().unwrap().as_ref() {
                Some(security) => security.decrypt(id, &raw)?,
                None => raw,
            }
        } else {
            raw
        };

        self.cache_payload(&mut state, id, logical.clone());
        Ok(logical)
    }

    pub fn delete_block(&self, id: u32) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.deleted.contains(&id) {
            return Err(FragmentaError::BlockNotFound { block_id: id });
        }
        self.locate(&mut state, id)?;
        let (_, header) = *state.headers.get(&id).unwrap();

        if header.previous_block != 0 {
            if let Ok(pred_offset) = self.locate(&mut state, header.previous_block) {
                self.patch_next(&mut state, pred_offset, header.next_block)?;
            }
        }
        if header.next_block != 0 {
            if let Ok(succ_offset) = self.locate(&mut state, header.next_block) {
                self.patch_previous(&mut state, succ_offset, header.previous_block)?;
            }
        }

        state.headers.remove(&id);
        state.payloads.remove(&id);
        state.cache_order.retain(|cached| *cached != id);
        state.deleted.insert(id);
        state.free_list.push(id);
        Ok(())
    }

    pub fn link_blocks(&self, source: u32, target: u32) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let source_offset = self.locate(&mut state, source)?;
        let _ = self.locate(&mut state, target)?;
        self.patch_next(&mut state, source_offset, target)?;
        let target_offset = self.locate(&mut state, target)?;
        self.patch_previous(&mut state, target_offset, source)?;
        Ok(())
    }

    /// Registers (or clears) the security manager invoked by `write_block`
    /// and `read_block` when a call opts into encryption.
    pub fn set_security(&self, manager: Option<Arc<dyn SecurityManager>>) {
        *self.security.write().unwrap() = manager;
    }

    /// `(block_count, free_list_len)` for [`crate::store::Store::stats`].
    pub fn stats(&self) -> (usize, usize) {
        let state = self.state.read().unwrap();
        (state.headers.len(), state.free_list.len())
    }

    pub fn get_block_info(&self, id: u32) -> Result<BlockHeader> {
        let mut state = self.state.write().unwrap();
        if state.deleted.contains(&id) {
            return Err(FragmentaError::BlockNotFound { block_id: id });
        }
        self.locate(&mut state, id)?;
        Ok(state.headers.get(&id).unwrap().1)
    }

    /// Rewrites surviving blocks contiguously from `block_offset`, reclaiming
    /// the space left by deleted blocks (§4.4, SPEC_FULL.md §C.1).
    pub fn optimize(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let block_offset = self.ctx.header.read().unwrap().block_offset;
        if block_offset == 0 {
            return Ok(());
        }

        let survivors = self.full_scan(&mut state, block_offset)?;

        let mut cursor = block_offset;
        let mut rewritten = HashMap::new();
        for (_, header) in &survivors {
            let mut raw = vec![0u8; header.payload_size as usize];
            // Re-read via the *old* offset before any bytes move.
            let old_offset = state.headers.get(&header.block_id).map(|(o, _)| *o).unwrap_or(cursor);
            self.ctx.read_at(old_offset + BLOCK_HEADER_SIZE, &mut raw)?;

            let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + raw.len());
            header.write_to(&mut bytes)?;
            bytes.extend_from_slice(&raw);
            self.ctx.write_at(cursor, &bytes)?;

            rewritten.insert(header.block_id, (cursor, *header));
            cursor += header.total_size();
        }

        let new_block_size = cursor - block_offset;
        self.ctx.set_len(cursor)?;
        {
            let mut store_header = self.ctx.header.write().unwrap();
            store_header.block_size = new_block_size;
            store_header.total_size = block_offset + new_block_size;
        }

        state.headers = rewritten;
        state.fully_scanned = true;
        Ok(())
    }

    // --- internal helpers -------------------------------------------------

    fn cache_payload(&self, state: &mut BlockManagerState, id: u32, payload: Vec<u8>) {
        if !state.payloads.contains_key(&id) {
            state.cache_order.push_back(id);
        }
        state.payloads.insert(id, payload);
        while state.cache_order.len() > PAYLOAD_CACHE_CAPACITY {
            if let Some(evict) = state.cache_order.pop_front() {
                state.payloads.remove(&evict);
            }
        }
    }

    /// Ensures `state.headers` has an entry for `id`, scanning from
    /// `BlockOffset` if necessary. Returns the physical offset.
    fn locate(&self, state: &mut BlockManagerState, id: u32) -> Result<u64> {
        if let Some((offset, _)) = state.headers.get(&id) {
            return Ok(*offset);
        }
        if state.fully_scanned {
            return Err(FragmentaError::BlockNotFound { block_id: id });
        }

        let block_offset = self.ctx.header.read().unwrap().block_offset;
        if block_offset == 0 {
            return Err(FragmentaError::BlockNotFound { block_id: id });
        }

        for (offset, header) in self.full_scan(state, block_offset)? {
            if header.block_id == id && !state.deleted.contains(&id) {
                return Ok(offset);
            }
        }
        Err(FragmentaError::BlockNotFound { block_id: id })
    }

    /// Walks the block region from `start`, memoizing every header it
    /// passes. Stops at the first block whose header or payload is
    /// truncated — that is treated strictly as end-of-region, never as a
    /// partially recoverable block (Design Note / Open Question 1).
    fn full_scan(&self, state: &mut BlockManagerState, start: u64) -> Result<Vec<(u64, BlockHeader)>> {
        let region_end = {
            let header = self.ctx.header.read().unwrap();
            header.block_offset + header.block_size
        };
        let file_len = self.ctx.file_len()?;
        let region_end = region_end.min(file_len);

        let mut offset = start;
        let mut found = Vec::new();
        while offset + BLOCK_HEADER_SIZE <= region_end {
            let mut raw_header = vec![0u8; BLOCK_HEADER_SIZE as usize];
            if self.ctx.read_at(offset, &mut raw_header).is_err() {
                break;
            }
            let header = match BlockHeader::read_from(&mut &raw_header[..]) {
                Ok(h) => h,
                Err(_) => break,
            };
            if offset + header.total_size() > region_end {
                break;
            }

            state.headers.insert(header.block_id, (offset, header));
            found.push((offset, header));
            offset += header.total_size();
        }
        if offset >= region_end {
            state.fully_scanned = true;
        }
        Ok(found.into_iter().filter(|(_, h)| !state.deleted.contains(&h.block_id)).collect())
    }

    fn patch_next(&self, state: &mut BlockManagerState, offset: u64, next: u32) -> Result<()> {
        self.patch_header(state, offset, |h| h.next_block = next)
    }

    fn patch_previous(&self, state: &mut BlockManagerState, offset: u64, previous: u32) -> Result<()> {
        self.patch_header(state, offset, |h| h.previous_block = previous)
    }

    fn patch_header(
        &self,
        state: &mut BlockManagerState,
        offset: u64,
        mutate: impl FnOnce(&mut BlockHeader),
    ) -> Result<()> {
        let mut raw = vec![0u8; BLOCK_HEADER_SIZE as usize];
        self.ctx.read_at(offset, &mut raw)?;
        let mut header = BlockHeader::read_from(&mut &raw[..])?;
        mutate(&mut header);

        let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE as usize);
        header.write_to(&mut bytes)?;
        self.ctx.write_at(offset, &bytes)?;

        state.headers.insert(header.block_id, (offset, header));
        Ok(())
    }
}

fn md5_of(bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::StorageMode;
    use crate::header::StoreHeader;
    use tempfile::tempfile;

    fn manager() -> BlockManager {
        let file = tempfile().unwrap();
        let mut header = StoreHeader::new(StorageMode::Container, [0u8; 16]);
        header.block_offset = header.metadata_offset + header.metadata_size;
        let ctx = Arc::new(StoreContext::new(file, header));
        BlockManager::new(ctx, None)
    }

    #[test]
    fn ids_increase_from_an_empty_free_list() {
        let mgr = manager();
        let a = mgr.write_block(b"one", WriteBlockOptions::default()).unwrap();
        let b = mgr.write_block(b"two", WriteBlockOptions::default()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mgr = manager();
        let id = mgr.write_block(b"payload", WriteBlockOptions::default()).unwrap();
        assert_eq!(mgr.read_block(id).unwrap(), b"payload");
    }

    #[test]
    fn deleted_id_is_reused_before_the_counter_advances() {
        let mgr = manager();
        let a = mgr.write_block(b"one", WriteBlockOptions::default()).unwrap();
        mgr.write_block(b"two", WriteBlockOptions::default()).unwrap();
        mgr.delete_block(a).unwrap();
        let reused = mgr.write_block(b"three", WriteBlockOptions::default()).unwrap();
        assert_eq!(reused, a);
        assert_eq!(mgr.read_block(reused).unwrap(), b"three");
    }

    #[test]
    fn deleted_block_is_not_found() {
        let mgr = manager();
        let a = mgr.write_block(b"one", WriteBlockOptions::default()).unwrap();
        mgr.delete_block(a).unwrap();
        assert!(matches!(mgr.read_block(a), Err(FragmentaError::BlockNotFound { .. })));
    }

    #[test]
    fn checksum_mismatch_on_corrupted_payload() {
        let mgr = manager();
        let options = WriteBlockOptions { checksum: true, ..Default::default() };
        let id = mgr.write_block(b"hello world", options).unwrap();

        let offset = mgr.state.read().unwrap().headers.get(&id).unwrap().0;
        let mut corrupt = [0u8; 1];
        mgr.ctx.read_at(offset + BLOCK_HEADER_SIZE, &mut corrupt).unwrap();
        corrupt[0] ^= 0xFF;
        mgr.ctx.write_at(offset + BLOCK_HEADER_SIZE, &corrupt).unwrap();

        assert!(matches!(mgr.read_block(id), Err(FragmentaError::ChecksumMismatch { .. })));
    }

    #[test]
    fn link_blocks_sets_both_directions() {
        let mgr = manager();
        let a = mgr.write_block(b"d1", WriteBlockOptions::default()).unwrap();
        let b = mgr.write_block(
            b"d2",
            WriteBlockOptions { append_to_id: Some(a), ..Default::default() },
        )
        .unwrap();

        assert_eq!(mgr.get_block_info(a).unwrap().next_block, b);
        assert_eq!(mgr.get_block_info(b).unwrap().previous_block, a);

        mgr.delete_block(a).unwrap();
        assert_eq!(mgr.get_block_info(b).unwrap().previous_block, 0);
    }

    #[test]
    fn optimize_reclaims_deleted_space_and_preserves_survivors() {
        let mgr = manager();
        let a = mgr.write_block(b"aaaa", WriteBlockOptions::default()).unwrap();
        let b = mgr.write_block(b"bbbb", WriteBlockOptions::default()).unwrap();
        let c = mgr.write_block(b"cccc", WriteBlockOptions::default()).unwrap();
        mgr.delete_block(b).unwrap();

        mgr.optimize().unwrap();

        assert_eq!(mgr.read_block(a).unwrap(), b"aaaa");
        assert_eq!(mgr.read_block(c).unwrap(), b"cccc");
        assert!(matches!(mgr.read_block(b), Err(FragmentaError::BlockNotFound { .. })));
    }
}
