use std::collections::BTreeMap;
use std::path::PathBuf;

use ahash::AHashMap;
use tracing::debug;

use crate::age::AgeArray;
use crate::error::{Error, Result};
use crate::kpage::{KPageFlags, PageIo};
use crate::memcg;
use crate::stats::{CgroupStat, IdleStat, MemType};
use crate::zoneinfo;

/// Where the kernel interfaces live. The defaults are the real ones; tests
/// point them at synthetic files.
#[derive(Clone, Debug)]
pub struct KernelPaths {
    pub zoneinfo: PathBuf,
    pub kpageflags: PathBuf,
    pub kpagecgroup: PathBuf,
    pub idle_bitmap: PathBuf,
    pub mounts: PathBuf,
    /// When set, skip mount-table discovery and treat this directory as the
    /// memory cgroup root.
    pub memcg_root: Option<PathBuf>,
}

impl Default for KernelPaths {
    fn default() -> Self {
        Self {
            zoneinfo: "/proc/zoneinfo".into(),
            kpageflags: "/proc/kpageflags".into(),
            kpagecgroup: "/proc/kpagecgroup".into(),
            idle_bitmap: "/sys/kernel/mm/page_idle/bitmap".into(),
            mounts: "/proc/self/mounts".into(),
            memcg_root: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// Pages per read/write burst. Must be a nonzero multiple of 64 for the
    /// sake of the idle bitmap.
    pub batch: usize,
    /// Pages one iteration covers at sampling 1.
    pub scan_chunk: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            batch: 4096,
            scan_chunk: 32768,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepProgress {
    /// More iterations remain in the current sweep.
    More,
    /// The sweep just covered the last PFN; results are complete.
    Complete,
}

struct ScanBuffers {
    flags: Vec<u64>,
    cgroup: Vec<u64>,
    idle: Vec<u64>,
    mark: Vec<u64>,
}

impl ScanBuffers {
    fn new(batch: usize) -> Self {
        Self {
            flags: vec![0; batch],
            cgroup: vec![0; batch],
            idle: vec![0; batch / 64],
            mark: vec![!0; batch / 64],
        }
    }
}

/// Estimates per-cgroup working-set size by sweeping the physical page frame
/// range and classifying each LRU page as idle or active.
///
/// A sweep covers `[0, end_pfn)` in `nr_iters` iterations; the caller drives
/// it by calling [`iterate`](Self::iterate) until it returns
/// [`SweepProgress::Complete`], then harvests [`result`](Self::result).
/// Pages found idle have a per-PFN age counter incremented (saturating at
/// 255); pages found active reset to zero. After counting, the swept range
/// is marked idle again so the next sweep observes accesses made in between.
pub struct IdleScanner {
    paths: KernelPaths,
    tunables: Tunables,
    end_pfn: u64,
    memcg_root: PathBuf,
    age: AgeArray,
    stats: AHashMap<u64, IdleStat>,
    bufs: ScanBuffers,
    // opened on first iteration; kept until teardown
    io: Option<PageIo>,
    sampling: u64,
    // sampling changes land at the next sweep boundary so the age counters
    // stay in step with the idle bits on disk
    pending_sampling: Option<u64>,
    iter_span: u64,
    scan_iter: u64,
}

impl IdleScanner {
    pub fn new(paths: KernelPaths) -> Result<Self> {
        Self::with_tunables(paths, Tunables::default())
    }

    pub fn with_tunables(paths: KernelPaths, tunables: Tunables) -> Result<Self> {
        if tunables.batch == 0 || tunables.batch % 64 != 0 {
            return Err(Error::config(format!(
                "batch must be a nonzero multiple of 64, got {}",
                tunables.batch
            )));
        }
        if tunables.scan_chunk == 0 {
            return Err(Error::config("scan_chunk must be nonzero"));
        }

        let end_pfn = zoneinfo::end_pfn(&paths.zoneinfo)?;
        let memcg_root = match &paths.memcg_root {
            Some(root) => root.clone(),
            None => memcg::find_memcg_mount(&paths.mounts)?,
        };
        let age = AgeArray::new(end_pfn)?;
        debug!(end_pfn, ?memcg_root, "idle page scanner ready");

        Ok(Self {
            bufs: ScanBuffers::new(tunables.batch),
            paths,
            end_pfn,
            memcg_root,
            age,
            stats: AHashMap::new(),
            io: None,
            sampling: 1,
            pending_sampling: None,
            iter_span: tunables.scan_chunk,
            scan_iter: 0,
            tunables,
        })
    }

    /// Whether the running kernel exposes idle page tracking at all.
    pub fn supported(paths: &KernelPaths) -> bool {
        paths.idle_bitmap.exists()
    }

    pub fn end_pfn(&self) -> u64 {
        self.end_pfn
    }

    pub fn sampling(&self) -> u64 {
        self.sampling
    }

    /// Iterations per full sweep at the current sampling.
    pub fn nr_iters(&self) -> u64 {
        self.end_pfn.div_ceil(self.iter_span)
    }

    /// Scan only 1 in `sampling` batches of pages. Takes effect at the next
    /// sweep boundary (immediately when already at one).
    pub fn set_sampling(&mut self, sampling: u64) -> Result<()> {
        if sampling < 1 {
            return Err(Error::config(format!(
                "sampling must be >= 1, got {sampling}"
            )));
        }
        if self.scan_iter == 0 {
            self.pending_sampling = None;
            self.apply_sampling(sampling);
        } else {
            self.pending_sampling = Some(sampling);
        }
        Ok(())
    }

    /// Like [`set_sampling`](Self::set_sampling), but takes the fraction of
    /// pages to scan: a ratio in `(0, 1]` maps to `max(1, floor(1/ratio))`.
    pub fn set_sampling_ratio(&mut self, ratio: f64) -> Result<()> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::config(format!(
                "sampling ratio must be in (0, 1], got {ratio}"
            )));
        }
        self.set_sampling(((1.0 / ratio) as u64).max(1))
    }

    fn apply_sampling(&mut self, sampling: u64) {
        self.sampling = sampling;
        self.iter_span = self.tunables.scan_chunk * sampling;
    }

    /// Run one iteration: count the pages of the next PFN span, then mark the
    /// span idle for the next sweep.
    ///
    /// On error the iteration cursor does not advance, so a retry covers the
    /// failing span again; since its partial counts were already recorded,
    /// callers are better off abandoning the sweep with [`reset`](Self::reset).
    pub fn iterate(&mut self) -> Result<SweepProgress> {
        if self.scan_iter == 0 {
            if let Some(sampling) = self.pending_sampling.take() {
                self.apply_sampling(sampling);
            }
            self.stats.clear();
        }

        let lo = self.scan_iter * self.iter_span;
        let hi = (lo + self.iter_span).min(self.end_pfn);

        let io = match &mut self.io {
            Some(io) => &*io,
            none => &*none.insert(PageIo::open(&self.paths)?),
        };
        count_pages(
            io,
            &mut self.age,
            &mut self.stats,
            &mut self.bufs,
            self.sampling,
            lo,
            hi,
        )?;
        mark_idle(io, &mut self.bufs, self.sampling, lo, hi)?;

        if hi == self.end_pfn {
            self.scan_iter = 0;
            Ok(SweepProgress::Complete)
        } else {
            self.scan_iter += 1;
            Ok(SweepProgress::More)
        }
    }

    /// Abandon the in-flight sweep; the next [`iterate`](Self::iterate)
    /// starts a fresh one.
    pub fn reset(&mut self) {
        self.scan_iter = 0;
    }

    /// Cumulative idle series per cgroup path, descendants folded into their
    /// ancestors. The mount root itself is not reported.
    pub fn result(&self) -> Result<BTreeMap<String, CgroupStat>> {
        memcg::collect(&self.memcg_root, &self.stats)
    }

    /// The inode-keyed accumulators behind [`result`](Self::result).
    pub fn raw_stats(&self) -> &AHashMap<u64, IdleStat> {
        &self.stats
    }
}

/// Classify every PFN in `[lo, hi)` and update ages.
///
/// The walk starts at the preceding 64-PFN boundary because the idle bitmap
/// is only addressable in whole words; PFNs below `lo` are consumed for
/// alignment but never counted. Compound tails reuse the attributes captured
/// at their head, so a huge page is accounted entirely to its head's cgroup
/// and class.
fn count_pages(
    io: &PageIo,
    age: &mut AgeArray,
    stats: &mut AHashMap<u64, IdleStat>,
    bufs: &mut ScanBuffers,
    sampling: u64,
    lo: u64,
    hi: u64,
) -> Result<()> {
    let batch = bufs.flags.len();
    let lo2 = lo & !63;
    let hi2 = (hi + 63) & !63;

    let mut head_cg = 0u64;
    let mut head_lru = false;
    let mut head_anon = false;
    let mut head_unevictable = false;
    let mut head_idle = false;

    let mut buf_index = batch; // empty, forces the first refill
    let mut pfn = lo2;
    while pfn < hi {
        if buf_index >= batch {
            let n = batch.min((hi2 - pfn) as usize);
            io.flags.read_words(pfn, &mut bufs.flags[..n])?;
            io.cgroup.read_words(pfn, &mut bufs.cgroup[..n])?;
            io.idle.read_words(pfn / 64, &mut bufs.idle[..n / 64])?;
            buf_index = 0;
        }

        if pfn >= lo {
            let flags = KPageFlags::from_bits_retain(bufs.flags[buf_index]);
            if !flags.contains(KPageFlags::COMPOUND_TAIL) {
                // ordinary page or compound head
                head_cg = bufs.cgroup[buf_index];
                head_lru = flags.contains(KPageFlags::LRU);
                head_anon = flags.contains(KPageFlags::ANON);
                head_unevictable = flags.contains(KPageFlags::UNEVICTABLE);
                head_idle = (bufs.idle[buf_index / 64] >> (buf_index & 63)) & 1 != 0;
            }

            if head_lru && !head_unevictable {
                let ty = if head_anon { MemType::Anon } else { MemType::File };
                let stat = stats.entry(head_cg).or_default();
                stat.inc_total(ty);
                if head_idle {
                    // bucket at the age the page already had, then grow it
                    let page_age = age[pfn as usize];
                    stat.inc_idle(ty, page_age);
                    age[pfn as usize] = page_age.saturating_add(1);
                } else {
                    age[pfn as usize] = 0;
                }
            }
        }

        buf_index += 1;
        if buf_index >= batch {
            // skip the unsampled batches entirely
            pfn += batch as u64 * (sampling - 1);
        }
        pfn += 1;
    }
    Ok(())
}

/// Set the idle bits across `[lo, hi)`, widened to 64-PFN words with the
/// out-of-range edge bits masked off so neighbors keep their state.
fn mark_idle(io: &PageIo, bufs: &mut ScanBuffers, sampling: u64, lo: u64, hi: u64) -> Result<()> {
    let batch = bufs.flags.len();
    let lo2 = lo & !63;
    let hi2 = (hi + 63) & !63;

    let mut pfn = lo2;
    while pfn < hi {
        let n = batch.min((hi2 - pfn) as usize);
        let nr_words = n / 64;
        // undo the masks a previous burst may have left on the edge words
        bufs.mark[0] = !0;
        bufs.mark[nr_words - 1] = !0;
        if pfn < lo {
            bufs.mark[0] &= !((1u64 << (lo & 63)) - 1);
        }
        if pfn + n as u64 > hi {
            bufs.mark[nr_words - 1] &= (1u64 << (hi & 63)) - 1;
        }
        io.idle.write_words(pfn / 64, &bufs.mark[..nr_words])?;
        pfn += batch as u64 * sampling;
    }
    Ok(())
}
