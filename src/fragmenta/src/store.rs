//! The top-level store object: open/create, dirty tracking, commit, and the
//! public surface that wires the block and metadata managers together (§4.5).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::block::{BlockHeader, BlockManager, WriteBlockOptions};
use crate::constants::{
    StorageMode, CURRENT_VERSION, HEADER_SIZE, TAG_CREATION_TIME, TAG_FRAGMENTA_TYPE, TAG_LAST_MODIFIED,
    TAG_VERSION,
};
use crate::error::{FragmentaError, Result};
use crate::handle::StoreContext;
use crate::header::StoreHeader;
use crate::metadata::{MetadataBatch, MetadataManager, MetadataQuery, QueryResult};
use crate::security::SecurityManager;

/// `StorageMode`s this `Store` can actually construct and open today.
///
/// [`crate::layout::DirectoryLayout`] fixes the on-disk path conventions
/// for directory mode (§6), but wiring it through `Store` needs a block
/// backend that addresses blocks by file rather than by byte offset in
/// one shared file — [`crate::block::BlockManager`] is offset-addressed
/// only. Until that backend exists, `Store` rejects `Directory`/`Hybrid`
/// up front instead of silently writing a container file at a
/// directory-shaped path.
fn require_container_mode(mode: StorageMode) -> Result<()> {
    match mode {
        StorageMode::Container => Ok(()),
        StorageMode::Directory | StorageMode::Hybrid => Err(FragmentaError::InvalidOperation(format!(
            "storage mode {mode:?} is not yet implemented by this store; only StorageMode::Container is constructible (see DESIGN.md)"
        ))),
    }
}

/// Identifies fragmenta stores in the `fragmenta-type` system tag.
const FRAGMENTA_TYPE_TAG_VALUE: &[u8] = b"fragmenta";

/// Tunables for [`Store::create`] (§8 Scenario A).
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub mode: StorageMode,
    /// Advisory hint for callers batching writes; the core does not itself
    /// chunk blocks to this size (§4.5 `WriteFromReader`).
    pub block_size: u32,
    pub user_defined_id: Option<[u8; 16]>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            mode: StorageMode::Container,
            block_size: 4096,
            user_defined_id: None,
        }
    }
}

/// Tunables for [`Store::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub read_only: bool,
}

/// Read-only snapshot of derived state (SPEC_FULL.md §C.2).
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub block_count: usize,
    pub free_list_len: usize,
    pub metadata_bytes: u64,
    pub dirty: bool,
}

/// The top-level Fragmenta handle. Exclusively owns the file, the header,
/// and the block/metadata managers; callers get copies of bytes, never
/// aliases into internal buffers (§3.5).
pub struct Store {
    ctx: Arc<StoreContext>,
    blocks: BlockManager,
    metadata: MetadataManager,
    path: PathBuf,
    read_only: AtomicBool,
    dirty: AtomicBool,
}

impl Store {
    /// Creates a new store at `path`, truncating any existing file (§4.5 Create).
    pub fn create(path: impl AsRef<Path>, options: CreateOptions) -> Result<Self> {
        require_container_mode(options.mode)?;
        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let user_defined_id = options
            .user_defined_id
            .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());

        let header = StoreHeader::new(options.mode, user_defined_id);
        header.write_to(&mut file)?;

        let ctx = Arc::new(StoreContext::new(file, header));
        if !ctx.try_lock_exclusive()? {
            warn!("store already open elsewhere: {}", path.display());
            return Err(FragmentaError::AlreadyOpenElsewhere);
        }

        let blocks = BlockManager::new(ctx.clone(), None);
        let metadata = MetadataManager::new(ctx.clone());

        let store = Store {
            ctx,
            blocks,
            metadata,
            path,
            read_only: AtomicBool::new(false),
            dirty: AtomicBool::new(true),
        };
        store.seed_system_tags()?;
        debug!("created store at {}", store.path.display());
        Ok(store)
    }

    fn seed_system_tags(&self) -> Result<()> {
        let now = now_nanos();
        self.metadata.set(TAG_CREATION_TIME, now.to_be_bytes().to_vec())?;
        self.metadata.set(TAG_VERSION, CURRENT_VERSION.to_be_bytes().to_vec())?;
        self.metadata.set(TAG_FRAGMENTA_TYPE, FRAGMENTA_TYPE_TAG_VALUE.to_vec())?;
        Ok(())
    }

    /// Opens an existing store, falling back to a read-only handle on a
    /// permission failure (§4.5 Open).
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (mut file, read_only) = if options.read_only {
            (File::options().read(true).open(&path)?, true)
        } else {
            match File::options().read(true).write(true).open(&path) {
                Ok(file) => (file, false),
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    (File::options().read(true).open(&path)?, true)
                }
                Err(err) => return Err(err.into()),
            }
        };

        let header = StoreHeader::read_from(&mut file)?;
        require_container_mode(header.storage_mode)?;
        let ctx = Arc::new(StoreContext::new(file, header));

        let locked = if read_only {
            ctx.try_lock_shared()?
        } else {
            ctx.try_lock_exclusive()?
        };
        if !locked {
            warn!("store already open elsewhere: {}", path.display());
            return Err(FragmentaError::AlreadyOpenElsewhere);
        }

        let blocks = BlockManager::new(ctx.clone(), None);
        let metadata = MetadataManager::new(ctx.clone());
        metadata.load(&mut CtxReader::new(&ctx))?;

        debug!("opened store at {} (read_only={read_only})", path.display());
        Ok(Store {
            ctx,
            blocks,
            metadata,
            path,
            read_only: AtomicBool::new(read_only),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst) || self.metadata.is_dirty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_header(&self) -> StoreHeader {
        self.ctx.header.read().unwrap().clone()
    }

    /// Registers the security manager whose `encrypt`/`decrypt` hooks the
    /// block manager calls for writes/reads that opt into encryption (§6).
    pub fn set_security_manager(&self, manager: Option<Arc<dyn SecurityManager>>) {
        self.blocks.set_security(manager);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(FragmentaError::ReadOnly);
        }
        Ok(())
    }

    // --- blocks -------------------------------------------------------

    pub fn write_block(&self, payload: &[u8], options: WriteBlockOptions) -> Result<u32> {
        self.ensure_writable()?;
        let id = self.blocks.write_block(payload, options)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(id)
    }

    pub fn read_block(&self, id: u32) -> Result<Vec<u8>> {
        self.blocks.read_block(id)
    }

    pub fn delete_block(&self, id: u32) -> Result<()> {
        self.ensure_writable()?;
        self.blocks.delete_block(id)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn link_blocks(&self, source: u32, target: u32) -> Result<()> {
        self.ensure_writable()?;
        self.blocks.link_blocks(source, target)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_block_info(&self, id: u32) -> Result<BlockHeader> {
        self.blocks.get_block_info(id)
    }

    /// Reads `reader` to EOF and writes it as a single block (§4.5).
    pub fn write_from_reader<R: Read>(&self, mut reader: R, options: WriteBlockOptions) -> Result<u32> {
        self.ensure_writable()?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        self.write_block(&buf, options)
    }

    /// Reads block id 1 and writes it to `writer` (§4.5).
    pub fn read_to_writer<W: Write>(&self, mut writer: W) -> Result<()> {
        let payload = self.read_block(1)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Compacts the block region in place, reclaiming deleted blocks' space (§4.3, §9).
    pub fn optimize_storage(&self) -> Result<()> {
        self.ensure_writable()?;
        self.blocks.optimize()?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    // --- metadata -------------------------------------------------------

    pub fn set_metadata(&self, tag: u16, value: Vec<u8>) -> Result<()> {
        self.ensure_writable()?;
        self.metadata.set(tag, value)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_metadata(&self, tag: u16) -> Result<Vec<u8>> {
        self.metadata.get(tag)
    }

    pub fn delete_metadata(&self, tag: u16) -> Result<()> {
        self.ensure_writable()?;
        self.metadata.delete(tag)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn batch_metadata(&self, batch: MetadataBatch) -> Result<()> {
        self.ensure_writable()?;
        self.metadata.batch(batch)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn list_metadata(&self) -> HashMap<u16, Vec<u8>> {
        self.metadata.list()
    }

    pub fn query_metadata(&self, query: &MetadataQuery) -> Result<QueryResult> {
        self.metadata.query(query)
    }

    // --- mode conversions -------------------------------------------------

    /// Valid only from container mode; the actual data relocation is an
    /// external collaborator, with the core's contract being to flip
    /// `StorageMode` once that relocation has succeeded (§4.5). Rejected
    /// outright today: see [`require_container_mode`] — flipping the flag
    /// without a directory-mode block backend would produce a store this
    /// crate could no longer open.
    pub fn convert_to_directory_mode(&self) -> Result<()> {
        self.ensure_writable()?;
        let header = self.ctx.header.read().unwrap();
        if header.storage_mode != StorageMode::Container {
            return Err(FragmentaError::InvalidOperation(
                "ConvertToDirectoryMode requires container mode".into(),
            ));
        }
        drop(header);
        Err(FragmentaError::InvalidOperation(
            "ConvertToDirectoryMode is not yet implemented by this store; \
             it requires a directory-mode block backend this crate does not yet have (see DESIGN.md)"
                .into(),
        ))
    }

    pub fn convert_to_container_mode(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut header = self.ctx.header.write().unwrap();
        if header.storage_mode != StorageMode::Directory {
            return Err(FragmentaError::InvalidOperation(
                "ConvertToContainerMode requires directory mode".into(),
            ));
        }
        header.storage_mode = StorageMode::Container;
        drop(header);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    // --- lifecycle -------------------------------------------------------

    pub fn stats(&self) -> StoreStats {
        let (block_count, free_list_len) = self.blocks.stats();
        StoreStats {
            block_count,
            free_list_len,
            metadata_bytes: self.ctx.header.read().unwrap().metadata_size,
            dirty: self.is_dirty(),
        }
    }

    /// Flushes metadata and rewrites the header if dirty; a no-op otherwise (§4.5).
    pub fn commit(&self) -> Result<()> {
        self.ensure_writable()?;
        if !self.is_dirty() {
            return Ok(());
        }

        let now = now_nanos();
        self.ctx.header.write().unwrap().last_modified = now;
        self.metadata.set(TAG_LAST_MODIFIED, now.to_be_bytes().to_vec())?;

        let bytes = self.metadata.serialize();
        let (metadata_offset, block_offset) = {
            let header = self.ctx.header.read().unwrap();
            (header.metadata_offset, header.block_offset)
        };

        if block_offset != 0 && metadata_offset + bytes.len() as u64 > block_offset {
            return Err(FragmentaError::StorageLimitExceeded(
                "metadata region grew past block_offset; run OptimizeStorage to make room".into(),
            ));
        }

        self.ctx.write_at(metadata_offset, &bytes)?;
        {
            let mut header = self.ctx.header.write().unwrap();
            header.metadata_size = bytes.len() as u64;
            header.total_size = header.block_offset.max(header.metadata_offset + header.metadata_size)
                + header.block_size;
        }
        self.write_header()?;

        self.dirty.store(false, Ordering::SeqCst);
        self.metadata.clear_dirty();
        debug!("committed store at {}", self.path.display());
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let header = self.ctx.header.read().unwrap().clone();
        let mut buf = Cursor::new(vec![0u8; HEADER_SIZE as usize]);
        header.write_to(&mut buf)?;
        self.ctx.write_at(0, buf.get_ref())?;
        Ok(())
    }

    /// Commits if dirty, releases the advisory lock. Idempotent (§4.5).
    pub fn close(&self) -> Result<()> {
        if self.is_dirty() {
            self.commit()?;
        }
        self.ctx.sync_all()?;
        let _ = self.ctx.unlock();
        Ok(())
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Adapts [`StoreContext::read_at`] (positional, non-seeking) into a
/// `Read + Seek` stream for [`MetadataManager::load`], which seeks to an
/// absolute offset before reading sequentially.
struct CtxReader<'a> {
    ctx: &'a StoreContext,
    pos: u64,
}

impl<'a> CtxReader<'a> {
    fn new(ctx: &'a StoreContext) -> Self {
        CtxReader { ctx, pos: 0 }
    }
}

impl<'a> Read for CtxReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ctx.read_at(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }
}

impl<'a> Seek for CtxReader<'a> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => (self.pos as i64 + delta) as u64,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seek from end is not supported while loading metadata",
                ))
            }
        };
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{is_user_tag, Logic, Operator};
    use crate::metadata::{Condition, MetadataQuery};
    use tempfile::tempdir;

    #[test]
    fn create_commit_reopen_roundtrips_metadata_and_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.frag");

        let store = Store::create(&path, CreateOptions::default()).unwrap();
        let tag = 0x1001;
        assert!(is_user_tag(tag));
        store.set_metadata(tag, "hello".as_bytes().to_vec()).unwrap();
        let options = WriteBlockOptions { checksum: true, ..Default::default() };
        let block_id = store.write_block("payload".as_bytes(), options).unwrap();
        store.commit().unwrap();
        store.close().unwrap();

        let reopened = Store::open(&path, OpenOptions::default()).unwrap();
        assert_eq!(reopened.get_metadata(tag).unwrap(), b"hello");
        assert_eq!(reopened.read_block(block_id).unwrap(), b"payload");
    }

    #[test]
    fn fresh_store_seeds_protected_system_tags() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("a.frag"), CreateOptions::default()).unwrap();
        assert!(store.get_metadata(TAG_CREATION_TIME).is_ok());
        assert!(store.delete_metadata(TAG_CREATION_TIME).is_err());
        assert!(store.list_metadata().contains_key(&TAG_CREATION_TIME));
    }

    #[test]
    fn query_and_logic_matches_containment() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("a.frag"), CreateOptions::default()).unwrap();
        store.set_metadata(0x1000, b"doc".to_vec()).unwrap();
        store.set_metadata(0x1001, b"audio".to_vec()).unwrap();

        let query = MetadataQuery {
            conditions: vec![Condition { tag: 0x1000, operator: Operator::Contains, value: b"do".to_vec() }],
            logic: Logic::And,
            limit: 10,
            offset: 0,
            sort_by: None,
            sort_order: crate::constants::SortOrder::Asc,
        };
        let result = store.query_metadata(&query).unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.return_count, 1);
        assert_eq!(result.entries[0].tag, 0x1000);
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.frag");
        let store = Store::create(&path, CreateOptions::default()).unwrap();
        store.commit().unwrap();
        store.close().unwrap();

        let reopened = Store::open(&path, OpenOptions { read_only: true }).unwrap();
        assert!(reopened.is_read_only());
        assert!(matches!(
            reopened.set_metadata(0x1001, b"x".to_vec()),
            Err(FragmentaError::ReadOnly)
        ));
    }
}
