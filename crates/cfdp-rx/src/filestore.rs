// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Offset-addressed file sink
//!
//! Writable destination of a receive transaction. Two opening modes:
//!
//! - **Final**: the metadata PDU named the destination, write there
//!   directly.
//! - **Temp**: file data arrived before metadata, so bytes accumulate in a
//!   uniquely-named file under the configured temp directory until metadata
//!   names the destination; [`FileSink::move_temp_to_final`] then renames
//!   it (copy-and-unlink when the rename crosses filesystems).
//!
//! Writes are positional and idempotent for identical retransmitted
//! segments. A sink still in temp mode when dropped unlinks its file; a
//! transaction whose metadata never arrives leaves nothing behind.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::pdu::TransactionId;

/// Filestore failure, tagged with the path that failed.
#[derive(Debug)]
pub enum FilestoreError {
    Open { path: PathBuf, source: io::Error },
    Write { path: PathBuf, source: io::Error },
    Read { path: PathBuf, source: io::Error },
    Move { path: PathBuf, source: io::Error },
}

impl fmt::Display for FilestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilestoreError::Open { path, source } => {
                write!(f, "cannot open {}: {source}", path.display())
            }
            FilestoreError::Write { path, source } => {
                write!(f, "cannot write {}: {source}", path.display())
            }
            FilestoreError::Read { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
            FilestoreError::Move { path, source } => {
                write!(f, "cannot move {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FilestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilestoreError::Open { source, .. }
            | FilestoreError::Write { source, .. }
            | FilestoreError::Read { source, .. }
            | FilestoreError::Move { source, .. } => Some(source),
        }
    }
}

/// Open writable file backing one receive transaction.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    path: PathBuf,
    temp: bool,
}

impl FileSink {
    /// Open a uniquely-named temp file for a transaction whose metadata
    /// has not arrived yet.
    ///
    /// The name embeds the transaction id, which is unique among active
    /// transactions on the channel; a stale leftover from an earlier run
    /// is truncated.
    pub fn open_temp(tmp_dir: &Path, id: TransactionId) -> Result<Self, FilestoreError> {
        let path = tmp_dir.join(format!("cfdp_rx_{}_{}.tmp", id.source, id.sequence));
        let file = Self::open_rw(&path)?;
        log::debug!("[sink] txn={id} opened temp {}", path.display());
        Ok(Self {
            file,
            path,
            temp: true,
        })
    }

    /// Open (create or truncate) the final destination file.
    pub fn open_final(path: &Path) -> Result<Self, FilestoreError> {
        let file = Self::open_rw(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            temp: false,
        })
    }

    fn open_rw(path: &Path) -> Result<File, FilestoreError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| FilestoreError::Open {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Move a temp sink to its final destination once metadata named it.
    ///
    /// Prefers an atomic rename; when that fails (typically `EXDEV`, temp
    /// dir on another filesystem) falls back to copy-then-unlink. The sink
    /// is reopened at the final path either way.
    pub fn move_temp_to_final(&mut self, final_path: &Path) -> Result<(), FilestoreError> {
        debug_assert!(self.temp);
        self.file.flush().map_err(|source| FilestoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        if let Err(rename_err) = fs::rename(&self.path, final_path) {
            log::debug!(
                "[sink] rename {} -> {} failed ({rename_err}), copying",
                self.path.display(),
                final_path.display()
            );
            fs::copy(&self.path, final_path).map_err(|source| FilestoreError::Move {
                path: final_path.to_path_buf(),
                source,
            })?;
            if let Err(unlink_err) = fs::remove_file(&self.path) {
                log::warn!(
                    "[sink] leaving stale temp {}: {unlink_err}",
                    self.path.display()
                );
            }
        }
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(final_path)
            .map_err(|source| FilestoreError::Open {
                path: final_path.to_path_buf(),
                source,
            })?;
        self.path = final_path.to_path_buf();
        self.temp = false;
        Ok(())
    }

    /// Write `data` at the absolute byte `offset`.
    ///
    /// Rewriting an already-written range with identical bytes is
    /// idempotent; retransmitted segments may do so freely.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FilestoreError> {
        let map = |source| FilestoreError::Write {
            path: self.path.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(offset)).map_err(map)?;
        self.file.write_all(data).map_err(|source| FilestoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Read up to `buf.len()` bytes at the absolute `offset`.
    ///
    /// Returns the number of bytes read; short reads happen at end of
    /// file. Used by the background checksum pass.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FilestoreError> {
        let map = |source| FilestoreError::Read {
            path: self.path.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(offset)).map_err(map)?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(FilestoreError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(total)
    }

    /// Path the sink is currently writing to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Still accumulating under a temp name (metadata not yet received).
    #[must_use]
    pub fn is_temp(&self) -> bool {
        self.temp
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // A sink that never learned its destination is an orphan.
        if self.temp {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("[sink] orphan temp {} not removed: {e}", self.path.display());
            } else {
                log::debug!("[sink] unlinked orphan temp {}", self.path.display());
            }
        }
    }
}
