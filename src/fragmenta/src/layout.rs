//! Directory-mode path layout (§6): the alternative to one self-contained
//! container file is a directory of cooperating files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Path helpers for a directory-mode store rooted at `root`.
pub struct DirectoryLayout {
    root: PathBuf,
}

impl DirectoryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `meta.frag` — the header and metadata region.
    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.frag")
    }

    /// Optional `index.frag`.
    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.frag")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    /// `blocks/NNNN.blk` — zero-padded hex block id.
    pub fn block_path(&self, block_id: u32) -> PathBuf {
        self.blocks_dir().join(format!("{block_id:08x}.blk"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Creates `root/`, `root/blocks/`, and `root/temp/` if they don't exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.blocks_dir())?;
        fs::create_dir_all(self.temp_dir())?;
        Ok(())
    }

    /// Removes `temp/` and recreates it empty. Called on `Store::close`
    /// per §6 ("the core may create and must clean on Close").
    pub fn clean_temp(&self) -> Result<()> {
        let temp = self.temp_dir();
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }
        fs::create_dir_all(&temp)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_are_rooted_under_the_directory() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::new(dir.path());
        assert_eq!(layout.meta_path(), dir.path().join("meta.frag"));
        assert_eq!(layout.block_path(1), dir.path().join("blocks/00000001.blk"));
    }

    #[test]
    fn ensure_dirs_creates_the_tree() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::new(dir.path().join("store"));
        layout.ensure_dirs().unwrap();
        assert!(layout.blocks_dir().is_dir());
        assert!(layout.temp_dir().is_dir());
    }

    #[test]
    fn clean_temp_clears_leftover_files() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        fs::write(layout.temp_dir().join("scratch"), b"x").unwrap();
        layout.clean_temp().unwrap();
        assert_eq!(fs::read_dir(layout.temp_dir()).unwrap().count(), 0);
    }
}
