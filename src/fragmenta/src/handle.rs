//! The narrow interface a [`Store`](crate::store::Store) hands to its
//! sub-managers, per the "invert the back-pointer" design note: the block
//! manager and metadata manager never hold a reference back to the store
//! itself, only this handle (`{file_read_at, file_write_at, header}`).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, RwLock};

use crate::header::StoreHeader;

/// Shared, positional access to the store's single file handle plus the
/// header. Cheap to clone (it's an `Arc` in practice); every method takes
/// `&self` so it composes with concurrent readers/writers as long as the
/// caller already holds the appropriate logical guard (§5).
pub(crate) struct StoreContext {
    file: Mutex<File>,
    pub header: RwLock<StoreHeader>,
}

impl StoreContext {
    pub fn new(file: File, header: StoreHeader) -> Self {
        StoreContext {
            file: Mutex::new(file),
            header: RwLock::new(header),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset`, independent of any
    /// other in-flight seek (the whole seek+read sequence is serialized
    /// under the file mutex, approximating `pread` on platforms without
    /// a convenient safe positional-read API in `std`).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.set_len(len)
    }

    pub fn sync_all(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
    }

    pub fn file_len(&self) -> io::Result<u64> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }

    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        use fs2::FileExt;
        let file = self.file.lock().unwrap();
        match file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn try_lock_shared(&self) -> io::Result<bool> {
        use fs2::FileExt;
        let file = self.file.lock().unwrap();
        match file.try_lock_shared() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        use fs2::FileExt;
        let file = self.file.lock().unwrap();
        file.unlock()
    }
}
