//! Append-only, indexed, crash-durable byte log.
//!
//! Entries get consecutive indexes starting at 1 and are spread over segment
//! files named after the first index they hold. The log only ever grows at the
//! back and shrinks at the front:
//!
//! - [`DurableLog::append`] writes to the newest segment, starting a new one
//!   once it passes [`LogOptions::segment_max_bytes`].
//! - [`DurableLog::truncate_front`] deletes whole segments below the cut and
//!   rewrites the segment the cut falls into.
//!
//! All operations take an internal lock, so producers appending and a drainer
//! reading or truncating can share one `DurableLog` freely.

mod file_lock;
mod segment;

use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use file_lock::DirLock;
use segment::Segment;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("log is closed")]
    Closed,

    #[error("index {index} is outside the log range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("corrupt log segment {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// A segment that reaches this size is sealed and a new one started.
    pub segment_max_bytes: u64,

    /// Whether `append` waits for the data to reach stable storage.
    pub sync_on_append: bool,

    /// Whether a damaged tail in the newest segment, as left by a crash in the
    /// middle of an append, is cut off on open. Otherwise open fails.
    pub truncate_incomplete_record: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            segment_max_bytes: 20 * 1024 * 1024,
            sync_on_append: true,
            truncate_incomplete_record: true,
        }
    }
}

#[derive(Debug)]
struct LogState {
    /// Full segments, oldest first.
    sealed: Vec<Segment>,
    /// The segment appends go to. May be empty.
    active: Segment,
    _lock: DirLock,
}

impl LogState {
    fn first_index(&self) -> u64 {
        self.sealed.first().unwrap_or(&self.active).first_index()
    }

    fn last_index(&self) -> u64 {
        self.active.next_index() - 1
    }

    fn check_range(&self, index: u64, last: u64) -> Result<(), LogError> {
        let first = self.first_index();
        if index < first || index > last {
            return Err(LogError::OutOfRange { index, first, last });
        }
        Ok(())
    }

    /// Drop everything below `index`. Returns the number of segment files
    /// removed.
    fn truncate_front(&mut self, dir: &Path, index: u64) -> Result<usize, LogError> {
        let active_first = self.active.first_index();

        // Segments to delete, oldest first. The segment a rewrite was copied
        // from always comes last, so an interruption leaves either a
        // contiguous log or an overlap that `drop_stale_segments` resolves.
        let stale: Vec<Segment> = if index >= active_first {
            let replaced = if index == active_first {
                None
            } else if index == self.active.next_index() {
                let fresh = Segment::create(dir, index)?;
                Some(mem::replace(&mut self.active, fresh))
            } else {
                let tail = self.active.rewrite_from(dir, index)?;
                Some(mem::replace(&mut self.active, tail))
            };
            let mut stale: Vec<Segment> = self.sealed.drain(..).collect();
            stale.extend(replaced);
            stale
        } else {
            let pos = self.sealed.partition_point(|s| s.next_index() <= index);
            if self.sealed[pos].first_index() == index {
                self.sealed.drain(..pos).collect()
            } else {
                let tail = self.sealed[pos].rewrite_from(dir, index)?;
                let stale: Vec<Segment> = self.sealed.drain(..=pos).collect();
                self.sealed.insert(0, tail);
                stale
            }
        };

        let removed = stale.len();
        for segment in stale {
            segment.remove()?;
        }
        Ok(removed)
    }
}

/// A write-ahead log stored in a directory this process holds exclusively.
#[derive(Debug)]
pub struct DurableLog {
    dir: PathBuf,
    options: LogOptions,
    state: Mutex<Option<LogState>>,
}

impl DurableLog {
    /// Open the log in `dir`, creating the directory and an empty log if
    /// needed. Fails if another `DurableLog` holds the directory.
    pub fn open(dir: impl Into<PathBuf>, options: LogOptions) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let lock = DirLock::acquire(&dir)?;
        let mut segments = load_segments(&dir, &options)?;
        let active = match segments.pop() {
            Some(segment) => segment,
            None => Segment::create(&dir, 1)?,
        };

        let state = LogState {
            sealed: segments,
            active,
            _lock: lock,
        };

        info!(
            dir = %dir.display(),
            first_index = state.first_index(),
            last_index = state.last_index(),
            segments = state.sealed.len() + 1,
            "durable log opened"
        );

        Ok(Self {
            dir,
            options,
            state: Mutex::new(Some(state)),
        })
    }

    /// Append one entry, returning its index once it is written (and synced,
    /// if `sync_on_append` is set).
    pub fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
        let mut guard = self.state();
        let state = guard.as_mut().ok_or(LogError::Closed)?;

        if !state.active.is_empty() && state.active.size() >= self.options.segment_max_bytes {
            let fresh = Segment::create(&self.dir, state.active.next_index())?;
            debug!(first_index = fresh.first_index(), "starting new log segment");
            let sealed = mem::replace(&mut state.active, fresh);
            state.sealed.push(sealed);
        }

        let index = state.active.next_index();
        state.active.append(payload, self.options.sync_on_append)?;
        Ok(index)
    }

    pub fn read(&self, index: u64) -> Result<Bytes, LogError> {
        let guard = self.state();
        let state = guard.as_ref().ok_or(LogError::Closed)?;
        state.check_range(index, state.last_index())?;

        if index >= state.active.first_index() {
            return state.active.read(index);
        }
        let pos = state.sealed.partition_point(|s| s.next_index() <= index);
        state.sealed[pos].read(index)
    }

    /// Index of the oldest entry still in the log. For an empty log this is
    /// `last_index() + 1`.
    pub fn first_index(&self) -> Result<u64, LogError> {
        let guard = self.state();
        let state = guard.as_ref().ok_or(LogError::Closed)?;
        Ok(state.first_index())
    }

    /// Index of the newest entry, or `first_index() - 1` when the log is
    /// empty.
    pub fn last_index(&self) -> Result<u64, LogError> {
        let guard = self.state();
        let state = guard.as_ref().ok_or(LogError::Closed)?;
        Ok(state.last_index())
    }

    /// Remove every entry below `index`, which must lie in
    /// `first_index()..=last_index() + 1`. Passing `last_index() + 1` empties
    /// the log while keeping its numbering.
    pub fn truncate_front(&self, index: u64) -> Result<(), LogError> {
        let mut guard = self.state();
        let state = guard.as_mut().ok_or(LogError::Closed)?;
        state.check_range(index, state.last_index() + 1)?;

        if index == state.first_index() {
            return Ok(());
        }

        let removed = state.truncate_front(&self.dir, index)?;
        debug!(index, removed_segments = removed, "truncated log front");
        Ok(())
    }

    /// Sync and release the log. Every later call on this log returns
    /// [`LogError::Closed`].
    pub fn close(&self) -> Result<(), LogError> {
        let state = self.state().take().ok_or(LogError::Closed)?;
        state.active.sync()?;
        drop(state);
        info!(dir = %self.dir.display(), "durable log closed");
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, Option<LogState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Open every segment in `dir`, oldest first. Only the newest one may be
/// repaired.
fn load_segments(dir: &Path, options: &LogOptions) -> Result<Vec<Segment>, LogError> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".tmp") {
            warn!(path = %path.display(), "removing unfinished segment rewrite");
            fs::remove_file(&path)?;
            continue;
        }
        if let Some(first_index) = segment::parse_file_name(name) {
            found.push((first_index, path));
        }
    }
    found.sort_unstable_by_key(|(first_index, _)| *first_index);

    let newest = found.len().saturating_sub(1);
    let mut segments = Vec::with_capacity(found.len());
    for (pos, (first_index, path)) in found.into_iter().enumerate() {
        let repair = pos == newest && options.truncate_incomplete_record;
        segments.push(Segment::open(path, first_index, repair)?);
    }

    drop_stale_segments(&mut segments)?;
    Ok(segments)
}

/// Keep the longest contiguous run of segments ending at the newest one.
///
/// Anything before a gap or an overlap was already cut off by a
/// `truncate_front` that did not get to delete it.
fn drop_stale_segments(segments: &mut Vec<Segment>) -> Result<(), LogError> {
    let Some(mut keep_from) = segments.len().checked_sub(1) else {
        return Ok(());
    };
    while keep_from > 0
        && segments[keep_from - 1].next_index() == segments[keep_from].first_index()
    {
        keep_from -= 1;
    }

    for stale in segments.drain(..keep_from) {
        warn!(
            path = %stale.path().display(),
            "removing segment left behind by an interrupted truncation"
        );
        stale.remove()?;
    }
    Ok(())
}
