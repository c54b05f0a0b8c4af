//! Replica directory and the replicated result table built on top of it.

use crate::{
    error::{Result, StoreError},
    lock::ChunkLockManager,
    log,
    message::{ParticipantId, Record},
    store::{Fields, RecordStore},
};
use color_print::cformat;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Chunk used for records no chunk map claims.
pub const UNASSIGNED_CHUNK: &str = "unassigned";

pub type ChunkMap = BTreeMap<String, Vec<ParticipantId>>;

/// `chunk1 -> [1, 2, 3]`, `chunk2 -> [4, 5]`.
pub fn default_chunk_map() -> ChunkMap {
    BTreeMap::from([
        ("chunk1".to_string(), ["1", "2", "3"].map(ParticipantId::from).to_vec()),
        ("chunk2".to_string(), ["4", "5"].map(ParticipantId::from).to_vec()),
    ])
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub owners: Vec<ParticipantId>,
}

/// Where one replica keeps its copy of one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub path: String,
    #[serde(default)]
    pub rows: usize,
}

impl ReplicaLocation {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rows: 0,
        }
    }
}

/// Per chunk its owning ids, per replica the location of each chunk copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationDirectory {
    #[serde(default)]
    pub replication_factor: usize,
    #[serde(default)]
    pub chunks: BTreeMap<String, ChunkInfo>,
    #[serde(default)]
    pub replicas: BTreeMap<String, BTreeMap<String, ReplicaLocation>>,
}

impl ReplicationDirectory {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| StoreError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Like [`Self::load`], but a missing file is an empty directory.
    pub fn load_or_empty(path: &Path) -> Result<Self, StoreError> {
        match fs::metadata(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            _ => Self::load(path),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let location = path.display().to_string();
        let text = serde_json::to_string_pretty(self).map_err(|source| StoreError::Encode {
            location: location.clone(),
            source,
        })?;
        fs::write(path, text).map_err(|source| StoreError::Write { location, source })
    }

    pub fn add_chunk(&mut self, chunk: &str, owners: impl IntoIterator<Item = ParticipantId>) {
        self.chunks.insert(
            chunk.to_string(),
            ChunkInfo {
                owners: owners.into_iter().collect(),
            },
        );
    }

    pub fn add_replica(&mut self, replica: &str, chunk: &str, location: ReplicaLocation) {
        self.replicas
            .entry(replica.to_string())
            .or_default()
            .insert(chunk.to_string(), location);
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.chunks.keys().map(String::as_str)
    }

    pub fn owners(&self, chunk: &str) -> &[ParticipantId] {
        self.chunks
            .get(chunk)
            .map(|info| info.owners.as_slice())
            .unwrap_or_default()
    }

    pub fn chunk_for(&self, participant: &ParticipantId) -> Option<&str> {
        self.chunks
            .iter()
            .find(|(_, info)| info.owners.contains(participant))
            .map(|(chunk, _)| chunk.as_str())
    }

    /// Every replica holding a copy of `chunk`, ordered by replica id.
    pub fn replicas_of(&self, chunk: &str) -> Vec<(&str, &ReplicaLocation)> {
        self.replicas
            .iter()
            .filter_map(|(replica, chunks)| chunks.get(chunk).map(|loc| (replica.as_str(), loc)))
            .collect()
    }

    /// Writes `factor` copies of every chunk in `chunk_map` under `dir` as
    /// `replica_<n>_<chunk>.json` and returns the directory describing them.
    pub fn provision(
        factor: usize,
        chunk_map: &ChunkMap,
        store: &dyn RecordStore,
        dir: &Path,
    ) -> Result<Self, StoreError> {
        let rows = store.read_all()?;
        let header = store.header()?;
        let mut directory = Self {
            replication_factor: factor,
            ..Self::default()
        };

        for (chunk, owners) in chunk_map {
            directory.add_chunk(chunk, owners.iter().cloned());
            let subset: Vec<Record> = rows
                .iter()
                .filter(|row| owners.contains(&row.id))
                .cloned()
                .collect();

            for n in 1..=factor {
                let path: PathBuf = dir.join(format!("replica_{n}_{chunk}.json"));
                let path = path.display().to_string();
                store.write_subset(&path, &header, &subset)?;
                directory.add_replica(
                    &format!("replica_{n}"),
                    chunk,
                    ReplicaLocation {
                        path,
                        rows: subset.len(),
                    },
                );
            }
        }

        log::info(&cformat!(
            "Provisioned <bold>{factor}</bold> replica(s) of <bold>{}</bold> chunk(s).",
            chunk_map.len()
        ));
        Ok(directory)
    }
}

/// The authoritative store plus its replica copies, guarded by chunk locks.
#[derive(Clone)]
pub struct ReplicatedTable {
    store: Arc<dyn RecordStore>,
    locks: Arc<ChunkLockManager>,
}

impl std::fmt::Debug for ReplicatedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTable")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl ReplicatedTable {
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<ChunkLockManager>) -> Self {
        Self { store, locks }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<ChunkLockManager> {
        &self.locks
    }

    /// Chunk that owns `id`: the installed directory first, then the default map.
    pub fn chunk_of(&self, id: &ParticipantId) -> String {
        if let Some(chunk) = self.locks.directory().chunk_for(id) {
            return chunk.to_string();
        }
        default_chunk_map()
            .into_iter()
            .find(|(_, owners)| owners.contains(id))
            .map(|(chunk, _)| chunk)
            .unwrap_or_else(|| UNASSIGNED_CHUNK.to_string())
    }

    /// Reads `id` under the chunk's read locks.
    pub async fn read_record(&self, who: &ParticipantId, id: &ParticipantId) -> Result<Option<Record>> {
        let chunk = self.chunk_of(id);
        self.locks.acquire_read(&chunk, who).await;
        let record = self.read_locked(&chunk, id);
        self.locks.release_read(&chunk, who);
        record
    }

    /// Reads from the first replica copy, or the authoritative store if the
    /// chunk has none or the copy is unreadable. The caller holds a read set.
    pub fn read_locked(&self, chunk: &str, id: &ParticipantId) -> Result<Option<Record>> {
        let directory = self.locks.directory();
        if let Some((replica, location)) = directory.replicas_of(chunk).first() {
            match self.store.read_location(&location.path) {
                Ok(table) => return Ok(table.rows.into_iter().find(|row| &row.id == id)),
                Err(e) => log::warn(&cformat!(
                    "Copy of <bold>{chunk}</bold> on <bold>{replica}</bold> unreadable ({e}), using the authoritative table."
                )),
            }
        }
        Ok(self.store.read(id)?)
    }

    /// Write-then-propagate under the chunk's write set; the set is released
    /// whether or not the store accepted the write.
    pub async fn write_record(&self, who: &ParticipantId, id: &ParticipantId, fields: &Fields) -> Result<()> {
        let chunk = self.chunk_of(id);
        self.locks.acquire_write(&chunk, who).await;
        let written = self.update_locked(&chunk, id, fields);
        self.locks.release_write(&chunk, who);
        written
    }

    /// Upserts into the authoritative store and refreshes every copy of
    /// `chunk`. The caller holds the chunk's write set.
    pub fn update_locked(&self, chunk: &str, id: &ParticipantId, fields: &Fields) -> Result<()> {
        self.store.upsert(id, fields)?;
        log::info(&cformat!(
            "Updated <bold>{id}</bold> in the authoritative table."
        ));
        self.propagate(chunk)
    }

    /// Copies the chunk's current rows into every replica location.
    pub fn propagate(&self, chunk: &str) -> Result<()> {
        let directory = self.locks.directory();
        let replicas = directory.replicas_of(chunk);
        if replicas.is_empty() {
            return Ok(());
        }

        let owners = directory.owners(chunk);
        let header = self.store.header()?;
        let rows: Vec<Record> = self
            .store
            .read_all()?
            .into_iter()
            .filter(|row| owners.contains(&row.id))
            .collect();

        for (replica, location) in &replicas {
            self.store.write_subset(&location.path, &header, &rows)?;
            log::debug(&cformat!(
                "Refreshed <bold>{chunk}</bold> on <bold>{replica}</bold>."
            ));
        }
        Ok(())
    }

    /// Builds replica copies, persists the directory at `metadata` and installs it.
    pub fn provision(
        &self,
        factor: usize,
        chunk_map: &ChunkMap,
        dir: &Path,
        metadata: &Path,
    ) -> Result<ReplicationDirectory> {
        let directory = ReplicationDirectory::provision(factor, chunk_map, self.store.as_ref(), dir)?;
        directory.save(metadata)?;
        log::info(&cformat!(
            "Replication directory written to <bold>{}</bold>.",
            metadata.display()
        ));
        self.locks.set_directory(directory.clone());
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileStore, MemoryStore};

    fn seeded() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            (1..=5).map(|n| Record::new(n.to_string().into()).with_field("isa", 0)),
        ))
    }

    fn isa(value: i64) -> Fields {
        Fields::from([("isa".to_string(), value.to_string())])
    }

    #[test]
    fn provisioning_splits_rows_by_chunk() {
        let store = seeded();
        let dir = Path::new("replicas");
        let directory =
            ReplicationDirectory::provision(2, &default_chunk_map(), store.as_ref(), dir).unwrap();

        assert_eq!(directory.replication_factor, 2);
        assert_eq!(directory.chunk_for(&"4".into()), Some("chunk2"));
        let copies = directory.replicas_of("chunk1");
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].0, "replica_1");
        assert_eq!(copies[0].1.rows, 3);

        let table = store.read_location(&copies[1].1.path).unwrap();
        let ids: Vec<&str> = table.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn writes_reach_every_copy_and_release_the_chunk() {
        let store = seeded();
        let locks = Arc::new(ChunkLockManager::default());
        let table = ReplicatedTable::new(store.clone(), locks.clone());
        let meta = tempfile::tempdir().unwrap();
        table
            .provision(2, &default_chunk_map(), Path::new("r"), &meta.path().join("meta.json"))
            .unwrap();

        table.write_record(&"server".into(), &"2".into(), &isa(17)).await.unwrap();

        for (_, location) in locks.directory().replicas_of("chunk1") {
            let copy = store.read_location(&location.path).unwrap();
            let row = copy.rows.iter().find(|r| r.id.as_str() == "2").unwrap();
            assert_eq!(row.field("isa"), Some("17"));
        }
        for key in locks.lock_keys("chunk1") {
            assert!(!locks.snapshot(&key).writer_active);
        }
        let read = table.read_record(&"2".into(), &"2".into()).await.unwrap();
        assert_eq!(read.unwrap().field("isa"), Some("17"));
    }

    #[tokio::test]
    async fn store_failures_reach_the_caller_and_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        fs::write(&path, "garbage").unwrap();

        let locks = Arc::new(ChunkLockManager::default());
        let table = ReplicatedTable::new(Arc::new(JsonFileStore::new(&path)), locks.clone());
        let result = table.write_record(&"1".into(), &"1".into(), &isa(3)).await;

        assert!(matches!(result, Err(crate::error::Error::Store(_))));
        assert!(!locks.snapshot(&crate::lock::ChunkKey::logical("chunk1")).writer_active);
    }

    #[test]
    fn directory_survives_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replication_metadata.json");
        assert_eq!(
            ReplicationDirectory::load_or_empty(&path).unwrap(),
            ReplicationDirectory::default()
        );

        let mut directory = ReplicationDirectory::default();
        directory.add_chunk("chunk1", ["1".into()]);
        directory.add_replica("replica_1", "chunk1", ReplicaLocation::new("a.json"));
        directory.save(&path).unwrap();
        assert_eq!(ReplicationDirectory::load(&path).unwrap(), directory);
    }

    #[test]
    fn unclaimed_ids_use_the_unassigned_chunk() {
        let table = ReplicatedTable::new(seeded(), Arc::new(ChunkLockManager::default()));
        assert_eq!(table.chunk_of(&"3".into()), "chunk1");
        assert_eq!(table.chunk_of(&"42".into()), UNASSIGNED_CHUNK);
    }
}
