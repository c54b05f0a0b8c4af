//! The tabular result store the coordination layer reads and writes.
//!
//! The store format is not the coordinator's concern; [`RecordStore`] is the
//! whole contract. [`MemoryStore`] backs in-process clusters and tests,
//! [`JsonFileStore`] keeps one JSON table per file.

use crate::{
    error::StoreError,
    log,
    message::{ParticipantId, Record},
};
use color_print::cformat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

pub type Fields = BTreeMap<String, String>;

/// A header plus its rows, as written to a replica location.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn from_rows(rows: Vec<Record>) -> Self {
        Self {
            header: header_of(&rows),
            rows,
        }
    }
}

/// `id` followed by every field name that appears in `rows`, sorted.
pub fn header_of(rows: &[Record]) -> Vec<String> {
    let names: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.fields.keys().map(String::as_str))
        .collect();
    std::iter::once("id")
        .chain(names)
        .map(str::to_string)
        .collect()
}

pub trait RecordStore: Send + Sync {
    fn read_all(&self) -> Result<Vec<Record>, StoreError>;

    fn read(&self, id: &ParticipantId) -> Result<Option<Record>, StoreError> {
        Ok(self.read_all()?.into_iter().find(|row| &row.id == id))
    }

    /// Inserts the row or overwrites the named fields of the existing one.
    fn upsert(&self, id: &ParticipantId, fields: &Fields) -> Result<(), StoreError>;

    fn write_subset(&self, location: &str, header: &[String], rows: &[Record]) -> Result<(), StoreError>;

    fn read_location(&self, location: &str) -> Result<Table, StoreError>;

    fn header(&self) -> Result<Vec<String>, StoreError> {
        Ok(header_of(&self.read_all()?))
    }
}

fn merge(rows: &mut Vec<Record>, id: &ParticipantId, fields: &Fields) {
    match rows.iter_mut().find(|row| &row.id == id) {
        Some(row) => row.fields.extend(fields.clone()),
        None => {
            rows.push(Record {
                id: id.clone(),
                fields: fields.clone(),
            });
            rows.sort_by(|a, b| a.id.cmp(&b.id));
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Record>>,
    locations: Mutex<BTreeMap<String, Table>>,
}

impl MemoryStore {
    pub fn new(rows: impl IntoIterator<Item = Record>) -> Self {
        let mut rows: Vec<Record> = rows.into_iter().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            rows: Mutex::new(rows),
            locations: Mutex::new(BTreeMap::new()),
        }
    }
}

impl RecordStore for MemoryStore {
    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.rows.lock().clone())
    }

    fn upsert(&self, id: &ParticipantId, fields: &Fields) -> Result<(), StoreError> {
        merge(&mut self.rows.lock(), id, fields);
        Ok(())
    }

    fn write_subset(&self, location: &str, header: &[String], rows: &[Record]) -> Result<(), StoreError> {
        self.locations.lock().insert(
            location.to_string(),
            Table {
                header: header.to_vec(),
                rows: rows.to_vec(),
            },
        );
        Ok(())
    }

    fn read_location(&self, location: &str) -> Result<Table, StoreError> {
        self.locations
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| StoreError::Unreadable {
                path: PathBuf::from(location),
                reason: "no such location".to_string(),
            })
    }
}

/// Authoritative table in one JSON file; each location is another JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // serialises read-modify-write cycles on the authoritative file
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Table, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Table::default()),
            Err(e) => {
                return Err(StoreError::Unreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        serde_json::from_str(&text).map_err(|e| StoreError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn save(location: &Path, table: &Table) -> Result<(), StoreError> {
        let display = location.display().to_string();
        let text = serde_json::to_string_pretty(table).map_err(|source| StoreError::Encode {
            location: display.clone(),
            source,
        })?;
        fs::write(location, text).map_err(|source| StoreError::Write {
            location: display,
            source,
        })
    }
}

impl RecordStore for JsonFileStore {
    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        let _guard = self.guard.lock();
        Ok(Self::load(&self.path)?.rows)
    }

    fn upsert(&self, id: &ParticipantId, fields: &Fields) -> Result<(), StoreError> {
        let _guard = self.guard.lock();
        let mut table = Self::load(&self.path)?;
        merge(&mut table.rows, id, fields);
        table.header = header_of(&table.rows);
        Self::save(&self.path, &table)?;

        log::debug(&cformat!(
            "Stored <bold>{id}</bold> in <bold>{}</bold>.",
            self.path.display()
        ));
        Ok(())
    }

    fn write_subset(&self, location: &str, header: &[String], rows: &[Record]) -> Result<(), StoreError> {
        let table = Table {
            header: header.to_vec(),
            rows: rows.to_vec(),
        };
        Self::save(Path::new(location), &table)?;
        log::debug(&cformat!(
            "Wrote <bold>{}</bold> row(s) to <bold>{location}</bold>.",
            rows.len()
        ));
        Ok(())
    }

    fn read_location(&self, location: &str) -> Result<Table, StoreError> {
        let path = Path::new(location);
        if !path.exists() {
            return Err(StoreError::Unreadable {
                path: path.to_path_buf(),
                reason: "no such file".to_string(),
            });
        }
        Self::load(path)
    }
}
