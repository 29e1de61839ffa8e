//! Journal-backed disk cache with bounded size.
//!
//! Each entry owns a fixed number of files (`values_per_entry`, usually 1)
//! named `<key>.<index>` in the cache directory. Writes go to
//! `<key>.<index>.tmp` and are renamed into place on commit, so readers only
//! ever see committed bytes. The journal (see [`super::journal`]) is the
//! source of truth for which entries are valid; the in-memory index is
//! rebuilt from it on open.
//!
//! ### Crash safety
//!
//! `DIRTY` is appended and flushed before an editor is handed out; `CLEAN`
//! and `REMOVE` are flushed as part of the operation that writes them. `READ`
//! lines are buffered until [`DiskCache::flush`]. A journal whose header does
//! not match, or which holds a malformed line, is discarded together with
//! every file in the directory.
//!
//! A commit links each value it replaces to `<key>.<index>.bak` before
//! renaming the new one into place, and drops the links once `CLEAN` is on
//! disk. If a rename or the `CLEAN` append fails, the links are moved back.
//! On open, an edit left open by a crash is settled the same way: a
//! previously committed entry keeps its last committed values, and an
//! entry that was never committed is dropped.
//!
//! ### Eviction
//!
//! When the committed total exceeds `max_size`, entries are removed oldest
//! first by journal order, where a `READ` counts as a fresh mention.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::journal::{self, Header, JOURNAL_FILE, JOURNAL_FILE_BACKUP, JOURNAL_FILE_TMP, Record};
use crate::Error;

/// Redundant journal lines tolerated before the journal is compacted.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug)]
struct Entry {
    /// Committed length of each value; meaningful only when `readable`.
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once.
    readable: bool,
    /// Id of the editor currently writing this entry, if any.
    editor: Option<u64>,
    /// Bumped on every successful commit; lets snapshots detect staleness.
    sequence_number: u64,
}

impl Entry {
    fn new(values_per_entry: usize) -> Self {
        Self { lengths: vec![0; values_per_entry], readable: false, editor: None, sequence_number: 0 }
    }
}

struct State {
    /// `None` once the cache has been closed.
    journal: Option<BufWriter<File>>,
    /// Iteration order is journal order: most recently mentioned first.
    entries: LruCache<String, Entry>,
    size: u64,
    max_size: u64,
    redundant_op_count: usize,
    next_sequence_number: u64,
    next_editor_id: u64,
}

impl State {
    fn journal(&mut self) -> Result<&mut BufWriter<File>, Error> {
        self.journal.as_mut().ok_or(Error::Closed)
    }

    fn append(&mut self, record: &Record) -> Result<(), Error> {
        let journal = self.journal()?;
        writeln!(journal, "{record}")?;
        Ok(())
    }

    fn append_and_flush(&mut self, record: &Record) -> Result<(), Error> {
        let journal = self.journal()?;
        writeln!(journal, "{record}")?;
        journal.flush()?;
        Ok(())
    }

    fn compaction_required(&self) -> bool {
        self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD && self.redundant_op_count >= self.entries.len()
    }
}

struct Shared {
    directory: PathBuf,
    header: Header,
    state: Mutex<State>,
}

impl Shared {
    fn clean_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}"))
    }

    fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}.tmp"))
    }

    /// Link to a committed value kept while a commit replaces it.
    fn backup_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}.bak"))
    }

    fn values_per_entry(&self) -> usize {
        self.header.values_per_entry
    }
}

/// Files touched by a commit in progress.
struct Promotion {
    lengths: Vec<u64>,
    /// Indices whose previous committed value is linked at `<key>.<i>.bak`.
    backed_up: Vec<usize>,
    /// Indices whose written value has been renamed into place.
    promoted: Vec<usize>,
}

/// Bounded, crash-recoverable key to blob store.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct DiskCache {
    shared: Arc<Shared>,
}

impl DiskCache {
    /// Open the cache in `directory`, creating it if needed.
    ///
    /// An existing journal is replayed if its header matches `app_version`
    /// and `values_per_entry`; otherwise the directory is wiped and the cache
    /// starts empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a zero `values_per_entry` or
    /// `max_size`, and `Error::Io` if the directory cannot be prepared.
    pub fn open(
        directory: impl AsRef<Path>, app_version: u32, values_per_entry: usize, max_size: u64,
    ) -> Result<Self, Error> {
        if values_per_entry == 0 {
            return Err(Error::InvalidConfig("values_per_entry must be greater than 0".into()));
        }
        if max_size == 0 {
            return Err(Error::InvalidConfig("disk cache max_size must be greater than 0".into()));
        }

        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        restore_backup(&directory)?;

        let header = Header { app_version, values_per_entry };
        let journal_path = directory.join(JOURNAL_FILE);

        if journal_path.exists() {
            match replay(&journal_path, header) {
                Ok(replayed) => {
                    let cache = Self::with_state(directory, header, replayed.entries, max_size);
                    cache.process_replayed(replayed.line_count, replayed.truncated_tail)?;
                    return Ok(cache);
                }
                Err(e) => {
                    tracing::warn!(directory = %directory.display(), error = %e, "discarding disk cache");
                    fs::remove_dir_all(&directory)?;
                    fs::create_dir_all(&directory)?;
                }
            }
        }

        let cache = Self::with_state(directory, header, LruCache::unbounded(), max_size);
        {
            let mut state = cache.shared.state.lock();
            cache.rebuild_journal(&mut state)?;
        }
        tracing::info!(directory = %cache.directory().display(), "created empty disk cache");
        Ok(cache)
    }

    fn with_state(directory: PathBuf, header: Header, entries: LruCache<String, Entry>, max_size: u64) -> Self {
        let state = State {
            journal: None,
            entries,
            size: 0,
            max_size,
            redundant_op_count: 0,
            next_sequence_number: 1,
            next_editor_id: 0,
        };
        Self { shared: Arc::new(Shared { directory, header, state: Mutex::new(state) }) }
    }

    /// Settle edits the previous process left open, total up sizes, and
    /// attach the journal.
    ///
    /// An entry committed before the interrupted edit keeps its last
    /// committed values; one that was never committed is dropped.
    fn process_replayed(&self, line_count: usize, truncated_tail: bool) -> Result<(), Error> {
        delete_if_exists(&self.shared.directory.join(JOURNAL_FILE_TMP))?;

        let mut state = self.shared.state.lock();
        let interrupted: Vec<(String, bool)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.editor.is_some())
            .map(|(key, entry)| (key.clone(), entry.readable))
            .collect();
        let mut dropped = 0;
        for (key, readable) in &interrupted {
            for index in 0..self.shared.values_per_entry() {
                delete_if_exists(&self.shared.dirty_file(key, index))?;
                let backup = self.shared.backup_file(key, index);
                if *readable {
                    if backup.exists() {
                        fs::rename(&backup, self.shared.clean_file(key, index))?;
                    }
                } else {
                    delete_if_exists(&self.shared.clean_file(key, index))?;
                    delete_if_exists(&backup)?;
                }
            }
            if *readable {
                if let Some(entry) = state.entries.peek_mut(key) {
                    entry.editor = None;
                }
            } else {
                state.entries.pop(key);
                dropped += 1;
            }
        }
        delete_stale_backups(&self.shared.directory)?;

        state.size = state.entries.iter().map(|(_, entry)| entry.lengths.iter().sum::<u64>()).sum();
        state.redundant_op_count = line_count.saturating_sub(state.entries.len());

        if truncated_tail || !interrupted.is_empty() {
            tracing::warn!(
                directory = %self.directory().display(),
                truncated_tail,
                interrupted = interrupted.len(),
                "journal left unfinished; compacting"
            );
            self.rebuild_journal(&mut state)?;
        } else {
            let file = OpenOptions::new().append(true).open(self.shared.directory.join(JOURNAL_FILE))?;
            state.journal = Some(BufWriter::new(file));
        }

        tracing::info!(
            directory = %self.directory().display(),
            entries = state.entries.len(),
            size = state.size,
            dropped,
            "opened disk cache"
        );
        Ok(())
    }

    /// Snapshot of the committed values for `key`.
    ///
    /// Returns `None` if the entry is unknown, has never been committed, or
    /// its files have gone missing. A `READ` line is buffered on a hit.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>, Error> {
        journal::validate_key(key)?;
        let mut state = self.shared.state.lock();
        state.journal()?;

        let Some(entry) = state.entries.get(key) else {
            return Ok(None);
        };
        if !entry.readable {
            return Ok(None);
        }
        let lengths = entry.lengths.clone();
        let sequence_number = entry.sequence_number;

        let mut files = Vec::with_capacity(lengths.len());
        for index in 0..self.shared.values_per_entry() {
            match File::open(self.shared.clean_file(key, index)) {
                Ok(file) => files.push(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(key, index, "committed file missing; dropping entry");
                    self.remove_locked(&mut state, key)?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.redundant_op_count += 1;
        if let Err(e) = state.append(&Record::Read(key.to_string())) {
            tracing::warn!(key, error = %e, "failed to record read");
        }
        if state.compaction_required()
            && let Err(e) = self.rebuild_journal(&mut state)
        {
            tracing::warn!(error = %e, "journal compaction failed");
        }

        Ok(Some(Snapshot { cache: self.clone(), key: key.to_string(), sequence_number, files, lengths }))
    }

    /// Begin writing `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EditConflict` if another editor is open for `key`.
    pub fn edit(&self, key: &str) -> Result<Editor, Error> {
        self.edit_at(key, None)
    }

    fn edit_at(&self, key: &str, expected_sequence: Option<u64>) -> Result<Editor, Error> {
        journal::validate_key(key)?;
        let mut state = self.shared.state.lock();
        state.journal()?;

        let existing = state.entries.peek(key);
        if let Some(expected) = expected_sequence
            && existing.is_none_or(|entry| entry.sequence_number != expected)
        {
            return Err(Error::StaleSnapshot(key.to_string()));
        }
        if existing.is_some_and(|entry| entry.editor.is_some()) {
            return Err(Error::EditConflict(key.to_string()));
        }

        let created = existing.is_none();
        let id = state.next_editor_id;
        state.next_editor_id += 1;
        if created {
            state.entries.put(key.to_string(), Entry::new(self.shared.values_per_entry()));
        }
        if let Some(entry) = state.entries.get_mut(key) {
            entry.editor = Some(id);
        }

        if let Err(e) = state.append_and_flush(&Record::Dirty(key.to_string())) {
            if created {
                state.entries.pop(key);
            } else if let Some(entry) = state.entries.peek_mut(key) {
                entry.editor = None;
            }
            return Err(e);
        }

        Ok(Editor {
            cache: self.clone(),
            key: key.to_string(),
            id,
            written: vec![false; self.shared.values_per_entry()],
            done: false,
        })
    }

    /// Remove `key` and its files.
    ///
    /// Returns false if the entry is absent or currently being edited.
    pub fn remove(&self, key: &str) -> Result<bool, Error> {
        journal::validate_key(key)?;
        let mut state = self.shared.state.lock();
        state.journal()?;
        self.remove_locked(&mut state, key)
    }

    fn remove_locked(&self, state: &mut State, key: &str) -> Result<bool, Error> {
        let Some(entry) = state.entries.peek(key) else {
            return Ok(false);
        };
        if entry.editor.is_some() {
            return Ok(false);
        }

        for index in 0..self.shared.values_per_entry() {
            delete_if_exists(&self.shared.clean_file(key, index))?;
        }
        if let Some(entry) = state.entries.pop(key) {
            state.size -= entry.lengths.iter().sum::<u64>();
        }
        state.redundant_op_count += 1;
        state.append_and_flush(&Record::Remove(key.to_string()))?;

        if state.compaction_required() {
            self.rebuild_journal(state)?;
        }
        Ok(true)
    }

    /// Finish an edit. Called exactly once per editor.
    ///
    /// A commit that fails at any step restores the previously committed
    /// values and journals the entry as if the edit had been aborted.
    fn complete_edit(&self, editor: &Editor, success: bool) -> Result<(), Error> {
        let key = editor.key.as_str();
        let mut state = self.shared.state.lock();

        let (readable, old_lengths) = match state.entries.peek(key) {
            Some(entry) if entry.editor == Some(editor.id) => (entry.readable, entry.lengths.clone()),
            _ if state.journal.is_none() => return Err(Error::Closed),
            _ => return Err(Error::EditConflict(format!("editor for {key} is no longer current"))),
        };

        if !success {
            self.delete_dirty_files(key);
            return self.restore_previous(&mut state, key, readable, &old_lengths);
        }

        let promotion = match self.promote(editor, readable, &old_lengths) {
            Ok(promotion) => promotion,
            Err(e) => {
                self.delete_dirty_files(key);
                if let Err(journal_error) = self.restore_previous(&mut state, key, readable, &old_lengths) {
                    tracing::warn!(key, error = %journal_error, "failed to journal aborted commit");
                }
                return Err(e);
            }
        };

        state.redundant_op_count += 1;
        if let Err(e) = state.append_and_flush(&Record::Clean(key.to_string(), promotion.lengths.clone())) {
            tracing::warn!(key, error = %e, "journal append failed; rolling back commit");
            self.roll_back_files(key, &promotion);
            if let Err(journal_error) = self.restore_previous(&mut state, key, readable, &old_lengths) {
                tracing::warn!(key, error = %journal_error, "failed to journal aborted commit");
            }
            return Err(e);
        }

        let old_total: u64 = if readable { old_lengths.iter().sum() } else { 0 };
        let sequence_number = state.next_sequence_number;
        state.next_sequence_number += 1;
        state.size = state.size + promotion.lengths.iter().sum::<u64>() - old_total;
        if let Some(entry) = state.entries.peek_mut(key) {
            entry.editor = None;
            entry.readable = true;
            entry.sequence_number = sequence_number;
            entry.lengths.clone_from(&promotion.lengths);
        }
        self.discard_backups(key, &promotion.backed_up);

        // The entry is committed from here on; housekeeping failures are not commit failures.
        if state.size > state.max_size
            && let Err(e) = self.trim_to_size(&mut state)
        {
            tracing::warn!(key, error = %e, "eviction after commit failed");
        }
        if state.compaction_required()
            && let Err(e) = self.rebuild_journal(&mut state)
        {
            tracing::warn!(key, error = %e, "journal compaction after commit failed");
        }
        Ok(())
    }

    /// Put the entry back the way it was before the edit and journal it.
    fn restore_previous(&self, state: &mut State, key: &str, readable: bool, old_lengths: &[u64]) -> Result<(), Error> {
        state.redundant_op_count += 1;
        let record = if readable {
            if let Some(entry) = state.entries.peek_mut(key) {
                entry.editor = None;
            }
            Record::Clean(key.to_string(), old_lengths.to_vec())
        } else {
            state.entries.pop(key);
            Record::Remove(key.to_string())
        };
        state.append_and_flush(&record)?;

        if state.compaction_required() {
            self.rebuild_journal(state)?;
        }
        Ok(())
    }

    /// Move the written values into place, keeping a link to each committed
    /// value they replace.
    fn promote(&self, editor: &Editor, readable: bool, old_lengths: &[u64]) -> Result<Promotion, Error> {
        let mut promotion = Promotion { lengths: old_lengths.to_vec(), backed_up: Vec::new(), promoted: Vec::new() };
        self.collect_dirty_lengths(editor, readable, &mut promotion.lengths)?;

        let key = editor.key.as_str();
        let written: Vec<usize> = (0..self.shared.values_per_entry()).filter(|&index| editor.written[index]).collect();
        if let Err(e) = self.swap_in(key, readable, &written, &mut promotion) {
            self.roll_back_files(key, &promotion);
            return Err(e.into());
        }
        Ok(promotion)
    }

    fn swap_in(&self, key: &str, readable: bool, written: &[usize], promotion: &mut Promotion) -> io::Result<()> {
        if readable {
            for &index in written {
                let backup = self.shared.backup_file(key, index);
                delete_if_exists(&backup)?;
                match link_or_copy(&self.shared.clean_file(key, index), &backup) {
                    Ok(()) => promotion.backed_up.push(index),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        for &index in written {
            fs::rename(self.shared.dirty_file(key, index), self.shared.clean_file(key, index))?;
            promotion.promoted.push(index);
        }
        Ok(())
    }

    /// Undo a partial or unjournaled promotion.
    fn roll_back_files(&self, key: &str, promotion: &Promotion) {
        for &index in &promotion.promoted {
            if promotion.backed_up.contains(&index) {
                continue;
            }
            if let Err(e) = delete_if_exists(&self.shared.clean_file(key, index)) {
                tracing::warn!(key, index, error = %e, "failed to delete unpublished value");
            }
        }
        for &index in &promotion.backed_up {
            if let Err(e) = fs::rename(self.shared.backup_file(key, index), self.shared.clean_file(key, index)) {
                tracing::warn!(key, index, error = %e, "failed to restore committed value");
            }
        }
    }

    fn discard_backups(&self, key: &str, indices: &[usize]) {
        for &index in indices {
            if let Err(e) = delete_if_exists(&self.shared.backup_file(key, index)) {
                tracing::warn!(key, index, error = %e, "failed to delete replaced value");
            }
        }
    }

    /// Validate that an edit produced every value it must, and measure them.
    fn collect_dirty_lengths(&self, editor: &Editor, readable: bool, lengths: &mut [u64]) -> Result<(), Error> {
        for (index, length) in lengths.iter_mut().enumerate() {
            if !editor.written[index] {
                if readable {
                    continue;
                }
                return Err(Error::MissingValue { key: editor.key.clone(), index });
            }
            match fs::metadata(self.shared.dirty_file(&editor.key, index)) {
                Ok(meta) => *length = meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::MissingValue { key: editor.key.clone(), index });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn delete_dirty_files(&self, key: &str) {
        for index in 0..self.shared.values_per_entry() {
            if let Err(e) = delete_if_exists(&self.shared.dirty_file(key, index)) {
                tracing::warn!(key, index, error = %e, "failed to delete partial write");
            }
        }
    }

    /// Evict oldest entries not being edited until the size fits.
    fn trim_to_size(&self, state: &mut State) -> Result<(), Error> {
        while state.size > state.max_size {
            let victim = state.entries.iter().rev().find(|(_, entry)| entry.editor.is_none()).map(|(key, _)| key.clone());
            let Some(key) = victim else {
                tracing::warn!(size = state.size, max_size = state.max_size, "every entry is being edited; cannot trim");
                break;
            };
            tracing::debug!(key = %key, "evicting disk entry");
            self.remove_locked(state, &key)?;
        }
        Ok(())
    }

    /// Write a compact journal to `journal.tmp` and swap it into place.
    fn rebuild_journal(&self, state: &mut State) -> Result<(), Error> {
        if let Some(journal) = state.journal.as_mut() {
            journal.flush()?;
        }

        let directory = &self.shared.directory;
        let tmp_path = directory.join(JOURNAL_FILE_TMP);
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            self.shared.header.write_to(&mut out)?;
            for (key, entry) in state.entries.iter().rev() {
                if entry.readable {
                    writeln!(out, "{}", Record::Clean(key.clone(), entry.lengths.clone()))?;
                }
                if entry.editor.is_some() {
                    writeln!(out, "{}", Record::Dirty(key.clone()))?;
                }
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        let journal_path = directory.join(JOURNAL_FILE);
        let backup_path = directory.join(JOURNAL_FILE_BACKUP);
        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&tmp_path, &journal_path)?;
        delete_if_exists(&backup_path)?;

        let file = OpenOptions::new().append(true).open(&journal_path)?;
        state.journal = Some(BufWriter::new(file));
        state.redundant_op_count = 0;
        tracing::debug!(entries = state.entries.len(), "rebuilt journal");
        Ok(())
    }

    /// Force buffered journal lines to durable storage.
    pub fn flush(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        self.trim_to_size(&mut state)?;
        let journal = state.journal()?;
        journal.flush()?;
        journal.get_ref().sync_data()?;
        Ok(())
    }

    /// Abort in-flight edits, flush the journal and detach it.
    ///
    /// Further operations return `Error::Closed`. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }

        let editing: Vec<String> =
            state.entries.iter().filter(|(_, entry)| entry.editor.is_some()).map(|(key, _)| key.clone()).collect();
        for key in editing {
            self.delete_dirty_files(&key);
            let record = match state.entries.peek_mut(&key) {
                Some(entry) if entry.readable => {
                    entry.editor = None;
                    Record::Clean(key.clone(), entry.lengths.clone())
                }
                _ => {
                    state.entries.pop(&key);
                    Record::Remove(key.clone())
                }
            };
            state.append(&record)?;
        }

        self.trim_to_size(&mut state)?;
        if let Some(mut journal) = state.journal.take() {
            journal.flush()?;
            journal.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Close the cache and delete its directory with everything in it.
    pub fn delete(&self) -> Result<(), Error> {
        self.close()?;
        match fs::remove_dir_all(&self.shared.directory) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Total bytes of committed values.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.shared.state.lock().max_size
    }

    /// Change the size budget, evicting immediately if it shrank.
    pub fn set_max_size(&self, max_size: u64) -> Result<(), Error> {
        if max_size == 0 {
            return Err(Error::InvalidConfig("disk cache max_size must be greater than 0".into()));
        }
        let mut state = self.shared.state.lock();
        state.max_size = max_size;
        if state.journal.is_some() {
            self.trim_to_size(&mut state)?;
        }
        Ok(())
    }

    /// Number of indexed entries, including ones whose first edit is open.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().journal.is_none()
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn values_per_entry(&self) -> usize {
        self.shared.values_per_entry()
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DiskCache")
            .field("directory", &self.shared.directory)
            .field("entries", &state.entries.len())
            .field("size", &state.size)
            .field("max_size", &state.max_size)
            .finish()
    }
}

fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn link_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    if fs::hard_link(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map(|_| ())
}

/// Remove `.bak` links left by a commit that finished before a crash.
fn delete_stale_backups(directory: &Path) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().is_some_and(|extension| extension == "bak") {
            delete_if_exists(&path)?;
        }
    }
    Ok(())
}

/// If a compaction was interrupted, keep whichever journal is complete.
fn restore_backup(directory: &Path) -> io::Result<()> {
    let backup = directory.join(JOURNAL_FILE_BACKUP);
    if !backup.exists() {
        return Ok(());
    }
    let journal = directory.join(JOURNAL_FILE);
    if journal.exists() { fs::remove_file(backup) } else { fs::rename(backup, journal) }
}

struct Replayed {
    entries: LruCache<String, Entry>,
    line_count: usize,
    truncated_tail: bool,
}

/// Rebuild the entry index from the journal at `path`.
fn replay(path: &Path, header: Header) -> Result<Replayed, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    header.expect_from(&mut reader)?;

    let mut entries: LruCache<String, Entry> = LruCache::unbounded();
    let mut line_count = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(Replayed { entries, line_count, truncated_tail: false });
        }
        let Some(body) = line.strip_suffix('\n') else {
            // A crash mid-append; the operation never completed.
            return Ok(Replayed { entries, line_count, truncated_tail: true });
        };

        let record = Record::parse(body)?;
        tracing::trace!(key = record.key(), "replaying journal line");
        line_count += 1;
        match record {
            Record::Dirty(key) => {
                if entries.get_mut(&key).is_none() {
                    entries.put(key.clone(), Entry::new(header.values_per_entry));
                }
                if let Some(entry) = entries.get_mut(&key) {
                    entry.editor = Some(u64::MAX);
                }
            }
            Record::Clean(key, lengths) => {
                if lengths.len() != header.values_per_entry {
                    return Err(Error::JournalCorrupt(format!("unexpected journal line: {body}")));
                }
                if entries.get_mut(&key).is_none() {
                    entries.put(key.clone(), Entry::new(header.values_per_entry));
                }
                if let Some(entry) = entries.get_mut(&key) {
                    entry.readable = true;
                    entry.editor = None;
                    entry.lengths = lengths;
                }
            }
            Record::Read(key) => {
                entries.get_mut(&key);
            }
            Record::Remove(key) => {
                entries.pop(&key);
            }
        }
    }
}

/// Read handles to the committed values of one entry.
///
/// The files were opened when the snapshot was taken; later commits or
/// removals of the same key do not change what this snapshot reads.
pub struct Snapshot {
    cache: DiskCache,
    key: String,
    sequence_number: u64,
    files: Vec<File>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Committed byte length of value `index`.
    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// Stream value `index`.
    pub fn reader(&mut self, index: usize) -> &mut File {
        &mut self.files[index]
    }

    /// Read value `index` fully into memory.
    pub fn read_to_vec(&mut self, index: usize) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.lengths[index] as usize);
        self.files[index].read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Edit this entry, unless it was committed again since this snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::StaleSnapshot` if the entry changed or was removed.
    pub fn edit(&self) -> Result<Editor, Error> {
        self.cache.edit_at(&self.key, Some(self.sequence_number))
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("key", &self.key).field("lengths", &self.lengths).finish()
    }
}

/// Write handle for one entry. Must be committed or aborted; dropping an
/// uncommitted editor aborts it.
pub struct Editor {
    cache: DiskCache,
    key: String,
    id: u64,
    written: Vec<bool>,
    done: bool,
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replace value `index` with `bytes`.
    pub fn set(&mut self, index: usize, bytes: &[u8]) -> Result<(), Error> {
        let mut out = self.writer(index)?;
        out.write_all(bytes)?;
        out.flush()?;
        Ok(())
    }

    /// Sink for value `index`. Bytes become visible only on commit.
    pub fn writer(&mut self, index: usize) -> Result<BufWriter<File>, Error> {
        self.check_index(index)?;
        let file = File::create(self.cache.shared.dirty_file(&self.key, index))?;
        self.written[index] = true;
        Ok(BufWriter::new(file))
    }

    /// Last committed bytes of value `index`, if the entry was committed.
    pub fn read_committed(&self, index: usize) -> Result<Option<Vec<u8>>, Error> {
        self.check_index(index)?;
        {
            let state = self.cache.shared.state.lock();
            match state.entries.peek(&self.key) {
                Some(entry) if entry.editor == Some(self.id) && entry.readable => {}
                Some(entry) if entry.editor == Some(self.id) => return Ok(None),
                _ => return Err(Error::EditConflict(format!("editor for {} is no longer current", self.key))),
            }
        }
        match fs::read(self.cache.shared.clean_file(&self.key, index)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish the written values.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingValue` if a never-committed entry lacks a value
    /// for some index, or `Error::Io` if the files or the journal could not
    /// be updated. In every error case the edit is aborted and the previously
    /// committed values, if any, stay readable. `Ok` means the values are
    /// committed even if eviction or compaction afterwards failed; those
    /// failures are logged.
    pub fn commit(mut self) -> Result<(), Error> {
        self.done = true;
        self.cache.complete_edit(&self, true)
    }

    /// Discard the written values.
    pub fn abort(mut self) -> Result<(), Error> {
        self.done = true;
        self.cache.complete_edit(&self, false)
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index >= self.written.len() {
            return Err(Error::InvalidConfig(format!(
                "value index {index} out of range for {} values per entry",
                self.written.len()
            )));
        }
        Ok(())
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            if let Err(e) = self.cache.complete_edit(self, false) {
                tracing::debug!(key = %self.key, error = %e, "abort on drop failed");
            }
        }
    }
}
