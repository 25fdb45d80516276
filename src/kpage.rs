use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::error::{Error, IoOp, Result};
use crate::scan::KernelPaths;

bitflags! {
    /// Page flag bits from /proc/kpageflags (linux/kernel-page-flags.h).
    /// Only the bits the scanner classifies on; the rest are ignored.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KPageFlags: u64 {
        const LRU = 1 << 5;
        const ANON = 1 << 12;
        const COMPOUND_TAIL = 1 << 16;
        const UNEVICTABLE = 1 << 18;
    }
}

/// A kernel pseudo-file addressed in 64-bit words. Every transfer seeks
/// absolutely; there is no stream buffering to second-guess the batching.
#[derive(Debug)]
pub struct WordFile {
    file: File,
    path: PathBuf,
}

impl WordFile {
    fn open(path: &Path, write: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .map_err(|e| Error::open(path, e))?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn read_words(&self, word_pos: u64, buf: &mut [u64]) -> Result<()> {
        self.file
            .read_exact_at(bytemuck::cast_slice_mut(buf), word_pos * 8)
            .map_err(|e| Error::transfer(&self.path, IoOp::Read, word_pos, buf.len(), e))
    }

    pub fn write_words(&self, word_pos: u64, buf: &[u64]) -> Result<()> {
        self.file
            .write_all_at(bytemuck::cast_slice(buf), word_pos * 8)
            .map_err(|e| Error::transfer(&self.path, IoOp::Write, word_pos, buf.len(), e))
    }
}

/// The three per-PFN kernel interfaces, held open for the scanner's lifetime.
///
/// `flags` and `cgroup` hold one word per PFN at offset `pfn * 8`. `idle`
/// packs 64 idle bits per word, LSB first; the kernel requires accesses to it
/// to be aligned to whole words, i.e. to 64 PFNs.
pub struct PageIo {
    pub flags: WordFile,
    pub cgroup: WordFile,
    pub idle: WordFile,
}

impl PageIo {
    pub fn open(paths: &KernelPaths) -> Result<Self> {
        Ok(Self {
            flags: WordFile::open(&paths.kpageflags, false)?,
            cgroup: WordFile::open(&paths.kpagecgroup, false)?,
            idle: WordFile::open(&paths.idle_bitmap, true)?,
        })
    }
}
