// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incremental, line-offset based reads of task logs.
//!
//! The log has a single writer (the execution unit, appending through a shell
//! redirect) and any number of readers. Readers open the file read-only and
//! scan it from the start, so a read costs O(file size) and never blocks the
//! writer.
//!
//! A final line without a trailing newline is returned as-is, flagged as
//! partial: the writer may still be producing it. It is not counted as
//! consumed, so resuming at [`LogSlice::next_offset`] returns it again once it
//! is complete.

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::Result;
use crate::task::TaskKey;
use crate::workspace::WorkspaceManager;

/// Result of one [`LogStore::read_since`] scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSlice {
    /// Requested lines, terminators stripped
    pub lines: Vec<String>,
    /// Lines in the whole file at scan time, a partial last line included
    pub total_lines: usize,
    /// The last returned line had no terminator yet
    pub partial: bool,
}

impl LogSlice {
    /// Returned lines that are complete.
    pub fn complete_lines(&self) -> usize {
        self.lines.len() - usize::from(self.partial)
    }

    /// Offset to resume from after a read starting at `offset`.
    pub fn next_offset(&self, offset: usize) -> usize {
        offset + self.complete_lines()
    }
}

/// Reads task logs out of their workspaces.
#[derive(Debug, Clone)]
pub struct LogStore {
    workspaces: WorkspaceManager,
}

impl LogStore {
    /// Create a log store over a workspace layout.
    pub fn new(workspaces: WorkspaceManager) -> Self {
        Self { workspaces }
    }

    async fn open(&self, key: &TaskKey) -> Result<Option<BufReader<File>>> {
        match File::open(self.workspaces.log_path(key)).await {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return up to `max_lines` lines following the first `offset` lines,
    /// counting the whole file in the same pass.
    ///
    /// A missing log file yields an empty slice. Line terminators are
    /// stripped; invalid UTF-8 is replaced.
    pub async fn read_since(
        &self,
        key: &TaskKey,
        offset: usize,
        max_lines: usize,
    ) -> Result<LogSlice> {
        let mut slice = LogSlice::default();
        let Some(mut reader) = self.open(key).await? else {
            return Ok(slice);
        };

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            if slice.total_lines >= offset && slice.lines.len() < max_lines {
                slice.partial = !buf.ends_with(b"\n");
                slice.lines.push(decode_line(&buf));
            }
            slice.total_lines += 1;
        }
        Ok(slice)
    }

    /// Number of lines currently in the log, counted the same way as
    /// [`read_since`](Self::read_since). Zero when the file does not exist.
    pub async fn line_count(&self, key: &TaskKey) -> Result<usize> {
        let Some(mut reader) = self.open(key).await? else {
            return Ok(0);
        };

        let mut count = 0usize;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(count);
            }
            count += 1;
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
