use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::DirEntryExt;
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::error::{Error, Result};
use crate::stats::{CgroupStat, IdleStat};

/// First mount-table row of type `cgroup` carrying the `memory` controller.
pub fn find_memcg_mount(mounts: &Path) -> Result<PathBuf> {
    let table = fs::read_to_string(mounts)
        .map_err(|e| Error::init(format!("failed to read '{}': {}", mounts.display(), e)))?;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(fstype), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fstype != "cgroup" {
            continue;
        }
        if options.split(',').any(|opt| opt == "memory") {
            return Ok(PathBuf::from(target));
        }
    }
    Err(Error::init(format!(
        "no memory cgroup mount in '{}'",
        mounts.display()
    )))
}

struct Node {
    path: String,
    ino: u64,
    parent: usize,
    stat: IdleStat,
}

/// Walk the memory cgroup tree and fold every directory's inode-keyed stats
/// together with all of its descendants'. The mount root itself aggregates
/// nothing and is dropped from the output; directories whose inodes the sweep
/// never saw still appear, with zeros.
pub(crate) fn collect(
    root: &Path,
    stats: &AHashMap<u64, IdleStat>,
) -> Result<BTreeMap<String, CgroupStat>> {
    // explicit stack; cgroup trees can be arbitrarily deep
    let mut nodes = vec![Node {
        path: "/".to_string(),
        ino: 0,
        parent: 0,
        stat: IdleStat::default(),
    }];
    let mut pending = vec![0usize];

    while let Some(idx) = pending.pop() {
        let dir = if nodes[idx].ino == 0 {
            root.to_path_buf()
        } else {
            root.join(&nodes[idx].path[1..])
        };
        let entries = fs::read_dir(&dir).map_err(|e| Error::read_dir(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::read_dir(&dir, e))?;
            // only cgroup directories are of interest; an entry can also
            // vanish between readdir and stat when a cgroup is removed
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let path = if nodes[idx].ino == 0 {
                format!("/{name}")
            } else {
                format!("{}/{}", nodes[idx].path, name)
            };
            let ino = entry.ino();
            let stat = stats.get(&ino).cloned().unwrap_or_default();
            nodes.push(Node {
                path,
                ino,
                parent: idx,
                stat,
            });
            pending.push(nodes.len() - 1);
        }
    }

    // children always sit after their parent, so one reverse pass folds the
    // tree bottom-up
    for idx in (1..nodes.len()).rev() {
        let parent = nodes[idx].parent;
        if nodes[parent].ino == 0 {
            continue;
        }
        let child = nodes[idx].stat.clone();
        nodes[parent].stat.merge(&child);
    }

    Ok(nodes
        .into_iter()
        .skip(1)
        .map(|n| (n.path, CgroupStat::from_stat(&n.stat)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MemType;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn finds_memory_controller_mount() {
        let dir = tempfile::TempDir::new().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(
            &mounts,
            "sysfs /sys sysfs rw,nosuid 0 0\n\
             cgroup2 /sys/fs/cgroup/unified cgroup2 rw 0 0\n\
             cgroup /sys/fs/cgroup/cpu cgroup rw,cpu,cpuacct 0 0\n\
             cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,memory 0 0\n",
        )
        .unwrap();
        assert_eq!(
            find_memcg_mount(&mounts).unwrap(),
            PathBuf::from("/sys/fs/cgroup/memory")
        );
    }

    #[test]
    fn missing_memory_controller_is_an_init_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "cgroup /sys/fs/cgroup/cpu cgroup rw,cpu 0 0\n").unwrap();
        assert!(matches!(
            find_memcg_mount(&mounts),
            Err(Error::Init(_))
        ));
    }

    fn stat_with(anon_total: u64) -> IdleStat {
        let mut stat = IdleStat::default();
        for _ in 0..anon_total {
            stat.inc_total(MemType::Anon);
        }
        stat
    }

    #[test]
    fn sums_descendants_into_ancestors() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir(root.join("c")).unwrap();

        let ino_b = fs::metadata(root.join("a/b")).unwrap().ino();
        let ino_c = fs::metadata(root.join("c")).unwrap().ino();

        let mut stats = AHashMap::new();
        stats.insert(ino_b, stat_with(2));
        stats.insert(ino_c, stat_with(1));

        let result = collect(root, &stats).unwrap();
        assert_eq!(
            result.keys().collect::<Vec<_>>(),
            ["/a", "/a/b", "/c"]
        );
        // "/a" has no pages of its own but inherits its child's
        assert_eq!(result["/a"].anon[0], 2);
        assert_eq!(result["/a/b"].anon[0], 2);
        assert_eq!(result["/c"].anon[0], 1);
        assert_eq!(result["/c"].file[0], 0);
    }

    #[test]
    fn unseen_directories_report_zeros() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let result = collect(dir.path(), &AHashMap::new()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result["/empty"], CgroupStat::default());
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let gone = dir.path().join("gone");
        assert!(matches!(
            collect(&gone, &AHashMap::new()),
            Err(Error::Io { .. })
        ));
    }
}
