use std::ops::{Deref, DerefMut};

use serde::ser::{Serialize, SerializeSeq, Serializer};

/// Deepest idle history the per-page age counters can represent. A page idle
/// for this many sweeps or longer stays in the last bucket.
pub const MAX_AGE: usize = 256;

const NR_MEM_TYPES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    Anon,
    File,
}

/// Idle statistics accumulated for one cgroup inode over the current sweep.
///
/// Bucket `i < 255` counts pages that have been idle for exactly `i + 1`
/// consecutive sweeps; bucket 255 counts pages idle for 256 sweeps or more.
#[derive(Clone)]
pub struct IdleStat {
    total: [u64; NR_MEM_TYPES],
    buckets: [[u64; MAX_AGE]; NR_MEM_TYPES],
}

impl Default for IdleStat {
    fn default() -> Self {
        Self {
            total: [0; NR_MEM_TYPES],
            buckets: [[0; MAX_AGE]; NR_MEM_TYPES],
        }
    }
}

impl IdleStat {
    /// Count one LRU, evictable page of the given class.
    pub fn inc_total(&mut self, ty: MemType) {
        self.total[ty as usize] += 1;
    }

    /// Count one idle page at the age it had before this sweep touched it.
    pub fn inc_idle(&mut self, ty: MemType, age: u8) {
        self.buckets[ty as usize][age as usize] += 1;
    }

    pub fn total(&self, ty: MemType) -> u64 {
        self.total[ty as usize]
    }

    pub fn bucket(&self, ty: MemType, age: u8) -> u64 {
        self.buckets[ty as usize][age as usize]
    }

    pub fn merge(&mut self, other: &IdleStat) {
        for ty in 0..NR_MEM_TYPES {
            self.total[ty] += other.total[ty];
            for (mine, theirs) in self.buckets[ty].iter_mut().zip(&other.buckets[ty]) {
                *mine += *theirs;
            }
        }
    }

    /// The canonical cumulative shape: `[total, idle>=1, ..., idle>=256]`,
    /// built by a right-to-left prefix sum over the buckets.
    pub fn series(&self, ty: MemType) -> Series {
        let mut out = [0u64; MAX_AGE + 1];
        out[0] = self.total[ty as usize];
        let mut sum = 0;
        for (i, &count) in self.buckets[ty as usize].iter().enumerate().rev() {
            sum += count;
            out[i + 1] = sum;
        }
        Series(out)
    }
}

/// Cumulative idle series for one memory class; position 0 is the total page
/// count, position `i >= 1` the number of pages idle for at least `i` sweeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Series(pub [u64; MAX_AGE + 1]);

impl Default for Series {
    fn default() -> Self {
        Series([0; MAX_AGE + 1])
    }
}

impl Deref for Series {
    type Target = [u64; MAX_AGE + 1];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Series {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// serde's derived array support stops at 32 elements, so emit the sequence
// by hand
impl Serialize for Series {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for v in &self.0 {
            seq.serialize_element(v)?;
        }
        seq.end()
    }
}

/// Aggregated result for one cgroup path.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CgroupStat {
    pub anon: Series,
    pub file: Series,
}

impl CgroupStat {
    pub(crate) fn from_stat(stat: &IdleStat) -> Self {
        Self {
            anon: stat.series(MemType::Anon),
            file: stat.series(MemType::File),
        }
    }
}
