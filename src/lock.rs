//! Replica-aware readers/writer locks over chunked storage.
//!
//! Every chunk operation locks the logical chunk key plus one key per replica
//! copy, always in sorted key order, and releases them in that same order.
//! Sorting is what keeps overlapping callers from waiting on each other in a
//! cycle.

use crate::{log, message::ParticipantId, replication::ReplicationDirectory};
use color_print::cformat;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::Notify;

/// Composite lock key: `"<replica>:<chunk>"` for a replica copy, `"<chunk>"` for the logical chunk.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkKey(String);

impl ChunkKey {
    pub fn logical(chunk: &str) -> Self {
        Self(chunk.to_string())
    }

    pub fn replica(replica: &str, chunk: &str) -> Self {
        Self(format!("{replica}:{chunk}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a non-blocking write acquisition was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum LockBusy {
    #[error("being written")]
    BeingWritten,
    #[error("being read")]
    BeingRead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkLockState {
    pub readers: usize,
    pub writer_active: bool,
    pub waiting_writers: usize,
}

/// Writer-preferring readers/writer lock for one [`ChunkKey`].
#[derive(Debug)]
pub struct ChunkLock {
    key: ChunkKey,
    state: Mutex<ChunkLockState>,
    changed: Notify,
}

// Withdraws a writer's waiting mark if its acquisition future is dropped.
struct PendingWriter<'a> {
    lock: &'a ChunkLock,
    granted: bool,
}

impl Drop for PendingWriter<'_> {
    fn drop(&mut self) {
        if !self.granted {
            self.lock.state.lock().waiting_writers -= 1;
            self.lock.changed.notify_waiters();
        }
    }
}

impl ChunkLock {
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            state: Mutex::new(ChunkLockState::default()),
            changed: Notify::new(),
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn snapshot(&self) -> ChunkLockState {
        *self.state.lock()
    }

    async fn wait_until(&self, mut ready: impl FnMut(&mut ChunkLockState) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = ready(&mut *self.state.lock());
            if done {
                return;
            }
            notified.await;
        }
    }

    pub async fn acquire_read(&self, who: &ParticipantId) {
        self.wait_until(|state| {
            if state.writer_active || state.waiting_writers > 0 {
                return false;
            }
            state.readers += 1;
            true
        })
        .await;

        log::debug(&cformat!(
            "<bold>{who}</bold> acquired READ on <bold>{}</bold>.",
            self.key
        ));
    }

    /// Returns `false` (and changes nothing) if no reader was holding the lock.
    pub fn release_read(&self, who: &ParticipantId) -> bool {
        let mut state = self.state.lock();
        if state.readers == 0 {
            log::warn(&cformat!(
                "<bold>{who}</bold> released READ on <bold>{}</bold> but no reader holds it.",
                self.key
            ));
            return false;
        }

        state.readers -= 1;
        let drained = state.readers == 0;
        drop(state);

        log::debug(&cformat!(
            "<bold>{who}</bold> released READ on <bold>{}</bold>.",
            self.key
        ));
        if drained {
            self.changed.notify_waiters();
        }
        true
    }

    pub async fn acquire_write(&self, who: &ParticipantId) {
        self.state.lock().waiting_writers += 1;
        let mut pending = PendingWriter {
            lock: self,
            granted: false,
        };

        self.wait_until(|state| {
            if state.writer_active || state.readers > 0 {
                return false;
            }
            state.waiting_writers -= 1;
            state.writer_active = true;
            true
        })
        .await;
        pending.granted = true;

        log::debug(&cformat!(
            "<bold>{who}</bold> acquired WRITE on <bold>{}</bold>.",
            self.key
        ));
    }

    /// Takes the write lock only if it is free right now.
    pub fn try_acquire_write(&self, who: &ParticipantId) -> Result<(), LockBusy> {
        let mut state = self.state.lock();
        if state.writer_active {
            return Err(LockBusy::BeingWritten);
        }
        if state.readers > 0 {
            return Err(LockBusy::BeingRead);
        }
        state.writer_active = true;
        drop(state);

        log::debug(&cformat!(
            "<bold>{who}</bold> acquired WRITE on <bold>{}</bold> without waiting.",
            self.key
        ));
        Ok(())
    }

    /// Returns `false` (and changes nothing) if no writer was active.
    pub fn release_write(&self, who: &ParticipantId) -> bool {
        let mut state = self.state.lock();
        if !state.writer_active {
            log::warn(&cformat!(
                "<bold>{who}</bold> released WRITE on <bold>{}</bold> but no writer is active.",
                self.key
            ));
            return false;
        }
        state.writer_active = false;
        drop(state);

        log::debug(&cformat!(
            "<bold>{who}</bold> released WRITE on <bold>{}</bold>.",
            self.key
        ));
        self.changed.notify_waiters();
        true
    }
}

// Gives back the keys a multi-key acquisition already took if it is dropped
// before taking the rest.
struct PartialAcquisition<'a> {
    manager: &'a ChunkLockManager,
    mode: LockMode,
    who: &'a ParticipantId,
    taken: Vec<ChunkKey>,
}

impl Drop for PartialAcquisition<'_> {
    fn drop(&mut self) {
        if self.taken.is_empty() {
            return;
        }
        log::warn(&cformat!(
            "<bold>{}</bold> abandoned a {:?} acquisition; releasing {} key(s).",
            self.who,
            self.mode,
            self.taken.len()
        ));
        self.manager.release_keys(&self.taken, self.mode, self.who);
    }
}

type HeldSets = BTreeMap<(ParticipantId, String, bool), Vec<Vec<ChunkKey>>>;

/// Lock table for every chunk key, plus the replica directory that decides
/// which keys a chunk operation must hold.
#[derive(Debug, Default)]
pub struct ChunkLockManager {
    directory: RwLock<Arc<ReplicationDirectory>>,
    locks: Mutex<BTreeMap<ChunkKey, Arc<ChunkLock>>>,
    // key sets handed out per (who, chunk, is_write), so a release undoes
    // exactly what was acquired even if the directory changed in between
    held: Mutex<HeldSets>,
}

impl ChunkLockManager {
    pub fn new(directory: ReplicationDirectory) -> Self {
        let manager = Self::default();
        manager.set_directory(directory);
        manager
    }

    pub fn set_directory(&self, directory: ReplicationDirectory) {
        let keys: usize = directory
            .chunk_ids()
            .map(|chunk| directory.replicas_of(chunk).len() + 1)
            .sum();
        *self.directory.write() = Arc::new(directory);
        log::info(&cformat!(
            "Lock manager now covers <bold>{keys}</bold> chunk lock key(s)."
        ));
    }

    pub fn directory(&self) -> Arc<ReplicationDirectory> {
        Arc::clone(&self.directory.read())
    }

    /// Sorted key set guarding `chunk`: each replica copy plus the logical key.
    ///
    /// Without replica metadata only the logical key is returned.
    pub fn lock_keys(&self, chunk: &str) -> Vec<ChunkKey> {
        let directory = self.directory();
        let mut keys: Vec<ChunkKey> = directory
            .replicas_of(chunk)
            .into_iter()
            .map(|(replica, _)| ChunkKey::replica(replica, chunk))
            .collect();
        keys.push(ChunkKey::logical(chunk));
        keys.sort();
        keys
    }

    /// The lock for `key`, created on first reference.
    pub fn lock(&self, key: &ChunkKey) -> Arc<ChunkLock> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ChunkLock::new(key.clone()))),
        )
    }

    pub fn snapshot(&self, key: &ChunkKey) -> ChunkLockState {
        self.lock(key).snapshot()
    }

    /// Acquires every key in `keys` in sorted order and returns that order.
    ///
    /// Dropping the future part way releases the keys taken so far.
    pub async fn acquire_keys(
        &self,
        keys: impl IntoIterator<Item = ChunkKey>,
        mode: LockMode,
        who: &ParticipantId,
    ) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut partial = PartialAcquisition {
            manager: self,
            mode,
            who,
            taken: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let lock = self.lock(&key);
            match mode {
                LockMode::Read => lock.acquire_read(who).await,
                LockMode::Write => lock.acquire_write(who).await,
            }
            partial.taken.push(key);
        }
        std::mem::take(&mut partial.taken)
    }

    /// Releases `keys` in the order given (the order they were acquired in).
    pub fn release_keys(&self, keys: &[ChunkKey], mode: LockMode, who: &ParticipantId) {
        for key in keys {
            let lock = self.lock(key);
            match mode {
                LockMode::Read => lock.release_read(who),
                LockMode::Write => lock.release_write(who),
            };
        }
    }

    pub async fn acquire_read(&self, chunk: &str, who: &ParticipantId) -> Vec<ChunkKey> {
        self.acquire_chunk(chunk, LockMode::Read, who).await
    }

    pub fn release_read(&self, chunk: &str, who: &ParticipantId) {
        self.release_chunk(chunk, LockMode::Read, who);
    }

    pub async fn acquire_write(&self, chunk: &str, who: &ParticipantId) -> Vec<ChunkKey> {
        self.acquire_chunk(chunk, LockMode::Write, who).await
    }

    pub fn release_write(&self, chunk: &str, who: &ParticipantId) {
        self.release_chunk(chunk, LockMode::Write, who);
    }

    /// All-or-nothing write acquisition that never waits.
    ///
    /// On refusal any key already taken is released again and the first
    /// obstacle is reported.
    pub fn try_acquire_write(&self, chunk: &str, who: &ParticipantId) -> Result<Vec<ChunkKey>, LockBusy> {
        let keys = self.lock_keys(chunk);
        let mut taken: Vec<ChunkKey> = Vec::with_capacity(keys.len());

        for key in &keys {
            if let Err(busy) = self.lock(key).try_acquire_write(who) {
                self.release_keys(&taken, LockMode::Write, who);
                log::info(&cformat!(
                    "<bold>{who}</bold> cannot write <bold>{chunk}</bold> yet: {busy}."
                ));
                return Err(busy);
            }
            taken.push(key.clone());
        }

        self.remember(chunk, LockMode::Write, who, taken.clone());
        Ok(taken)
    }

    async fn acquire_chunk(&self, chunk: &str, mode: LockMode, who: &ParticipantId) -> Vec<ChunkKey> {
        let keys = self.acquire_keys(self.lock_keys(chunk), mode, who).await;
        log::info(&cformat!(
            "<bold>{who}</bold> holds {mode:?} on <bold>{chunk}</bold> ({} key(s)).",
            keys.len()
        ));
        self.remember(chunk, mode, who, keys.clone());
        keys
    }

    /// Whether `who` currently holds `chunk` in `mode` through this manager.
    pub fn holds(&self, chunk: &str, who: &ParticipantId, mode: LockMode) -> bool {
        self.held
            .lock()
            .get(&(who.clone(), chunk.to_string(), mode == LockMode::Write))
            .is_some_and(|sets| !sets.is_empty())
    }

    fn release_chunk(&self, chunk: &str, mode: LockMode, who: &ParticipantId) {
        let remembered = self
            .held
            .lock()
            .get_mut(&(who.clone(), chunk.to_string(), mode == LockMode::Write))
            .and_then(Vec::pop);

        let Some(keys) = remembered else {
            log::warn(&cformat!(
                "<bold>{who}</bold> released {mode:?} on <bold>{chunk}</bold> without holding it."
            ));
            return;
        };
        self.release_keys(&keys, mode, who);
        log::info(&cformat!(
            "<bold>{who}</bold> released {mode:?} on <bold>{chunk}</bold>."
        ));
    }

    fn remember(&self, chunk: &str, mode: LockMode, who: &ParticipantId, keys: Vec<ChunkKey>) {
        self.held
            .lock()
            .entry((who.clone(), chunk.to_string(), mode == LockMode::Write))
            .or_default()
            .push(keys);
    }
}
