//! Served files and their block delivery state.
//!
//! Each file gets a dense id in argument order and a bitmap with one bit per
//! block. Bits only ever go from unsent to sent.

use crate::error::{Result, ServeError};
use crate::streaming::protocol::{block_offset, blocks_for_size, FileId, BLOCK_SIZE};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// One entry of the served set.
#[derive(Debug)]
pub struct ServedFile {
    /// Dense 0-based id, also the index into the registry
    pub id: FileId,

    /// Path given at startup, used only in diagnostics
    pub path: PathBuf,

    /// Total size in bytes
    pub size: u64,

    sent: Vec<bool>,
    sent_count: usize,
    file: File,
}

impl ServedFile {
    pub fn new(id: FileId, path: PathBuf, size: u64, file: File) -> Self {
        Self {
            id,
            path,
            size,
            sent: vec![false; blocks_for_size(size)],
            sent_count: 0,
            file,
        }
    }

    /// Stat and open `path` read-only.
    pub fn open(id: FileId, path: &Path) -> Result<Self> {
        let io_err = |source| ServeError::FileIo {
            path: path.to_path_buf(),
            source,
        };
        let size = std::fs::metadata(path).map_err(io_err)?.len();
        let file = File::open(path).map_err(io_err)?;
        Ok(Self::new(id, path.to_path_buf(), size, file))
    }

    pub fn block_count(&self) -> usize {
        self.sent.len()
    }

    pub fn sent_count(&self) -> usize {
        self.sent_count
    }

    pub fn is_sent(&self, index: usize) -> bool {
        self.sent.get(index).copied().unwrap_or(false)
    }

    pub fn all_sent(&self) -> bool {
        self.sent_count == self.sent.len()
    }

    /// Record `index` as delivered. Setting an already set bit changes nothing.
    pub fn mark_sent(&mut self, index: usize) -> Result<()> {
        let blocks = self.sent.len();
        let bit = self
            .sent
            .get_mut(index)
            .ok_or(ServeError::BlockOutOfRange {
                file_id: self.id,
                index: index as i64,
                blocks,
            })?;
        if !*bit {
            *bit = true;
            self.sent_count += 1;
        }
        Ok(())
    }

    /// Read block `index` into `buf`, returning the number of bytes read.
    ///
    /// The last block of a file is usually short.
    pub fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<usize> {
        if index >= self.sent.len() {
            return Err(ServeError::BlockOutOfRange {
                file_id: self.id,
                index: index as i64,
                blocks: self.sent.len(),
            });
        }

        let offset = block_offset(index);
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ServeError::FileIo {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(filled)
    }
}

/// Fixed set of served files, indexed by file id.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: Vec<ServedFile>,
}

impl FileRegistry {
    /// Open every path in order, assigning ids 0, 1, 2, ...
    ///
    /// Any file that cannot be stat-ed or opened fails the whole registry.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.len() > FileId::MAX as usize + 1 {
            return Err(ServeError::TooManyFiles(paths.len()));
        }
        let files = paths
            .iter()
            .enumerate()
            .map(|(i, p)| ServedFile::open(i as FileId, p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, id: FileId) -> Option<&ServedFile> {
        usize::try_from(id).ok().and_then(|i| self.files.get(i))
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut ServedFile> {
        usize::try_from(id).ok().and_then(|i| self.files.get_mut(i))
    }

    pub fn total_block_count(&self, id: FileId) -> Option<usize> {
        self.get(id).map(ServedFile::block_count)
    }

    /// True once every block of every file has been sent.
    pub fn all_sent(&self) -> bool {
        self.files.iter().all(ServedFile::all_sent)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServedFile> {
        self.files.iter()
    }
}
