//! Append-only CSV journals.
//!
//! Both the account store and the ledger persist every state change as one
//! row. On open, existing rows are replayed in order; callers fold them into
//! their in-memory state (last row per key wins).
//!
//! A row is written whole or not at all: a failed write is cut back off the
//! end of the file before the error is returned.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, warn};

/// Errors that can occur when reading or appending journal rows
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}: failed to open journal: {source}", path.display())]
    Open { path: PathBuf, source: csv::Error },

    #[error("{}: failed to append row: {source}", path.display())]
    Append { path: PathBuf, source: csv::Error },

    #[error("{}: writer lock poisoned", path.display())]
    Poisoned { path: PathBuf },

    #[error("{}: failed append could not be rolled back", path.display())]
    Damaged { path: PathBuf },
}

/// Where journal bytes go.
trait Sink: Write + Send {
    /// Cut the sink back to `len` bytes.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl Sink for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

struct Tail {
    sink: Box<dyn Sink>,
    /// Bytes known to be written in full.
    len: u64,
    needs_header: bool,
    damaged: bool,
}

/// A typed append-only CSV file.
pub struct Journal<R> {
    path: PathBuf,
    tail: Mutex<Tail>,
    _row: PhantomData<fn(R)>,
}

impl<R> std::fmt::Debug for Journal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("path", &self.path).finish()
    }
}

impl<R: Serialize + DeserializeOwned> Journal<R> {
    /// Open (or create) the journal at `path`, returning it together with
    /// every row already on disk.
    ///
    /// Unparseable rows are skipped with a warning: a torn final line left
    /// by a crash must not keep the service from starting.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<R>), JournalError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let rows = if path.exists() {
            read_rows(&path)?
        } else {
            Vec::new()
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let is_empty = file.metadata().map_err(io_err)?.len() == 0;
        if !is_empty && !ends_with_newline(&path).map_err(io_err)? {
            // terminate a torn row so the next append starts on its own line
            file.write_all(b"\n").map_err(io_err)?;
        }
        let len = file.metadata().map_err(io_err)?.len();

        let journal = Self::with_sink(path, Box::new(file), len);
        Ok((journal, rows))
    }

    fn with_sink(path: PathBuf, sink: Box<dyn Sink>, len: u64) -> Self {
        Self {
            path,
            tail: Mutex::new(Tail {
                sink,
                len,
                needs_header: len == 0,
                damaged: false,
            }),
            _row: PhantomData,
        }
    }

    /// Append one row and flush it to the OS.
    pub fn append(&self, row: &R) -> Result<(), JournalError> {
        let mut tail = self.tail.lock().map_err(|_| JournalError::Poisoned {
            path: self.path.clone(),
        })?;
        if tail.damaged {
            return Err(JournalError::Damaged {
                path: self.path.clone(),
            });
        }

        let bytes = encode(row, tail.needs_header).map_err(|source| JournalError::Append {
            path: self.path.clone(),
            source,
        })?;

        if let Err(source) = write_all(tail.sink.as_mut(), &bytes) {
            let len = tail.len;
            if let Err(e) = tail.sink.truncate(len) {
                error!(
                    path = %self.path.display(),
                    len,
                    reason = %e,
                    "could not roll back failed journal append"
                );
                tail.damaged = true;
            }
            return Err(JournalError::Io {
                path: self.path.clone(),
                source,
            });
        }

        tail.len += bytes.len() as u64;
        tail.needs_header = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One row as CSV bytes, preceded by the header line if `header` is set.
fn encode<R: Serialize>(row: &R, header: bool) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(header)
        .from_writer(Vec::new());
    writer.serialize(row)?;
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

fn write_all(sink: &mut dyn Sink, bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes)?;
    sink.flush()
}

fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn read_rows<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, JournalError> {
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|source| JournalError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let rows = reader
        .into_deserialize::<R>()
        .enumerate()
        .filter_map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            match result {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!(path = %path.display(), line, "skipping unreadable journal row: {e}");
                    None
                }
            }
        })
        .collect();
    Ok(rows)
}
