use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Construction-time failure. The scanner is unusable.
    #[error("{0}")]
    Init(String),
    /// A kernel interface transfer failed or came up short. Offsets and
    /// lengths are in bytes.
    #[error("{}", io_desc(.path, .op, .offset, .len, .source))]
    Io {
        path: PathBuf,
        op: IoOp,
        offset: u64,
        len: u64,
        source: io::Error,
    },
    /// A tunable was set out of range.
    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Open,
    Read,
    Write,
    ReadDir,
}

fn io_desc(path: &Path, op: &IoOp, offset: &u64, len: &u64, source: &io::Error) -> String {
    match op {
        IoOp::Open => format!("open '{}' failed: {}", path.display(), source),
        IoOp::ReadDir => format!("read dir '{}' failed: {}", path.display(), source),
        IoOp::Read | IoOp::Write => format!(
            "{} '{}' {}@{} failed: {}",
            op,
            path.display(),
            len,
            offset,
            source
        ),
    }
}

impl Error {
    pub(crate) fn init(msg: impl Into<String>) -> Self {
        Error::Init(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn open(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_owned(),
            op: IoOp::Open,
            offset: 0,
            len: 0,
            source,
        }
    }

    pub(crate) fn transfer(
        path: &Path,
        op: IoOp,
        word_pos: u64,
        nr_words: usize,
        source: io::Error,
    ) -> Self {
        Error::Io {
            path: path.to_owned(),
            op,
            offset: word_pos * 8,
            len: nr_words as u64 * 8,
            source,
        }
    }

    pub(crate) fn read_dir(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_owned(),
            op: IoOp::ReadDir,
            offset: 0,
            len: 0,
            source,
        }
    }
}

impl Display for IoOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoOp::Open => "open",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::ReadDir => "read dir",
        };
        f.write_str(s)
    }
}
