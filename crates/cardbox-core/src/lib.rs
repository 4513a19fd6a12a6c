use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CardboxError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("required field is empty: {0}")]
    EmptyRequiredField(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("no record is currently loaded")]
    NoCurrentRecord,
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileId(pub i64);

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory snapshot of one contact record. Empty strings stand for absent
/// date fields.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub filename: String,
    pub display_name: String,
    pub birthday: String,
    pub anniversary: String,
    pub optional_field_count: usize,
}

/// Field values to apply to the currently loaded record. A blank display
/// name keeps the existing one; blank dates clear the fields.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FieldEdits {
    pub display_name: String,
    pub birthday: String,
    pub anniversary: String,
}

/// One parsed record, owned by the controller while it is current.
///
/// Date accessors return the engine's display form; the empty string means
/// the field is absent.
pub trait RecordHandle {
    /// Check the record against the format's structural rules.
    ///
    /// # Errors
    /// Returns [`CardboxError::Validation`] when the record is malformed.
    fn validate(&self) -> Result<(), CardboxError>;

    fn display_name(&self) -> String;
    fn birthday(&self) -> String;
    fn anniversary(&self) -> String;
    fn optional_field_count(&self) -> usize;

    /// # Errors
    /// Returns [`CardboxError::Validation`] when the value is rejected.
    fn set_display_name(&mut self, value: &str) -> Result<(), CardboxError>;

    /// # Errors
    /// Returns [`CardboxError::Validation`] when the value is rejected.
    fn set_birthday(&mut self, value: &str) -> Result<(), CardboxError>;

    /// # Errors
    /// Returns [`CardboxError::Validation`] when the value is rejected.
    fn set_anniversary(&mut self, value: &str) -> Result<(), CardboxError>;

    /// Write the record to `path` in its on-disk format.
    ///
    /// # Errors
    /// Returns [`CardboxError::Io`] when the file cannot be written.
    fn serialize(&self, path: &Path) -> Result<(), CardboxError>;
}

/// Record format engine: parsing, fresh records, and the candidate filter
/// used by the directory scan.
pub trait RecordEngine {
    type Handle: RecordHandle;

    /// Parse one record file.
    ///
    /// # Errors
    /// Returns [`CardboxError::Parse`] when the file cannot be read or is
    /// not structurally well formed.
    fn parse(&self, path: &Path) -> Result<Self::Handle, CardboxError>;

    /// Fresh record with no fields set. It fails validation until a display
    /// name is assigned.
    fn new_record(&self) -> Self::Handle;

    /// Whether `path` qualifies as a scan candidate by naming convention.
    /// Qualifying does not imply the file parses or validates.
    fn is_record_file(&self, path: &Path) -> bool;
}

/// Relational mirror of file and contact metadata.
pub trait MirrorStore {
    /// Insert a file row, or return the existing row's id unchanged. An
    /// existing row keeps both its creation time and its last-modified time.
    ///
    /// # Errors
    /// Returns [`CardboxError::Store`] when the write fails.
    fn upsert_file(
        &mut self,
        file_name: &str,
        creation_time: OffsetDateTime,
        last_modified: OffsetDateTime,
    ) -> Result<FileId, CardboxError>;

    /// Refresh the last-modified time of an existing file row.
    ///
    /// # Errors
    /// Returns [`CardboxError::Store`] when the row is missing or the write
    /// fails.
    fn touch_file(
        &mut self,
        file_id: FileId,
        last_modified: OffsetDateTime,
    ) -> Result<(), CardboxError>;

    /// Insert or update the single contact row owned by `file_id`. Dates
    /// arrive as engine display strings; empty means absent.
    ///
    /// # Errors
    /// Returns [`CardboxError::Store`] when the write fails.
    fn upsert_contact(
        &mut self,
        name: &str,
        birthday: &str,
        anniversary: &str,
        file_id: FileId,
    ) -> Result<ContactId, CardboxError>;
}

struct LoadedRecord<H> {
    handle: H,
    snapshot: Record,
}

/// Single authority over which records exist in the storage directory,
/// which one is current, and the alignment of the relational mirror.
///
/// At most one record is current at a time; replacing it drops the
/// previously held handle.
pub struct RecordController<E: RecordEngine, S: MirrorStore> {
    engine: E,
    store: S,
    dir: PathBuf,
    known_files: Vec<String>,
    current: Option<LoadedRecord<E::Handle>>,
}

impl<E: RecordEngine, S: MirrorStore> RecordController<E, S> {
    pub fn new(engine: E, store: S, dir: &Path) -> Self {
        Self {
            engine,
            store,
            dir: dir.to_path_buf(),
            known_files: Vec::new(),
            current: None,
        }
    }

    /// Walk the storage directory, mirror every valid record, and replace
    /// the known-file list with the valid set.
    ///
    /// A file counts as valid only when it both parses and validates.
    /// Invalid files are an expected steady-state condition: they are
    /// skipped with a debug-level diagnostic, never surfaced as errors.
    /// Re-scanning an unchanged directory produces the same set and no
    /// duplicate mirror rows.
    ///
    /// # Errors
    /// Returns [`CardboxError::Io`] when the directory cannot be read and
    /// [`CardboxError::Store`] when a mirror write fails.
    pub fn scan_and_sync(&mut self) -> Result<Vec<String>, CardboxError> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            CardboxError::Io(format!(
                "failed to read storage directory {}: {err}",
                self.dir.display()
            ))
        })?;

        let mut valid = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| CardboxError::Io(format!("failed to read directory entry: {err}")))?;
            let path = entry.path();
            if !path.is_file() || !self.engine.is_record_file(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()).map(str::to_string)
            else {
                tracing::debug!("skipping {}: file name is not valid UTF-8", path.display());
                continue;
            };

            let handle = match self.engine.parse(&path) {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::debug!("skipping {}: {}", name, err);
                    continue;
                }
            };
            if let Err(err) = handle.validate() {
                tracing::debug!("skipping {}: {}", name, err);
                continue;
            }
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => OffsetDateTime::from(modified),
                Err(err) => {
                    tracing::debug!("skipping {}: {}", name, err);
                    continue;
                }
            };

            let file_id = self.store.upsert_file(&name, OffsetDateTime::now_utc(), modified)?;
            self.store.touch_file(file_id, modified)?;
            self.store.upsert_contact(
                &handle.display_name(),
                &handle.birthday(),
                &handle.anniversary(),
                file_id,
            )?;
            valid.push(name);
        }

        self.known_files.clone_from(&valid);
        Ok(valid)
    }

    /// Parse and validate one named record, make it current, and mirror it.
    ///
    /// Unlike the scan, a failure here is a definitive answer: the error is
    /// surfaced, the current record is cleared, and the mirror is left
    /// untouched.
    ///
    /// # Errors
    /// Returns [`CardboxError::Parse`] or [`CardboxError::Validation`] for a
    /// bad file, and [`CardboxError::Store`] when a mirror write fails.
    pub fn load_record(&mut self, filename: &str) -> Result<Record, CardboxError> {
        let path = self.dir.join(filename);
        let handle = match self.engine.parse(&path) {
            Ok(handle) => handle,
            Err(err) => {
                self.current = None;
                return Err(err);
            }
        };
        if let Err(err) = handle.validate() {
            self.current = None;
            return Err(err);
        }

        let snapshot = snapshot_of(filename, &handle);
        self.current = Some(LoadedRecord { handle, snapshot: snapshot.clone() });

        let now = OffsetDateTime::now_utc();
        let file_id = self.store.upsert_file(filename, now, now)?;
        self.store.upsert_contact(
            &snapshot.display_name,
            &snapshot.birthday,
            &snapshot.anniversary,
            file_id,
        )?;

        Ok(snapshot)
    }

    /// Create a fresh record with the given display name, persist it, make
    /// it current, and mirror it with both date fields absent.
    ///
    /// Fails with zero side effects: no file is written and no mirror row
    /// is created unless every step up to the storage write succeeds.
    ///
    /// # Errors
    /// Returns [`CardboxError::EmptyRequiredField`] for a blank filename or
    /// display name, [`CardboxError::Validation`] when the engine rejects
    /// the record, [`CardboxError::Io`] when the write fails, and
    /// [`CardboxError::Store`] when a mirror write fails.
    pub fn create_record(
        &mut self,
        filename: &str,
        display_name: &str,
    ) -> Result<Record, CardboxError> {
        if filename.trim().is_empty() {
            return Err(CardboxError::EmptyRequiredField("filename".to_string()));
        }
        if display_name.trim().is_empty() {
            return Err(CardboxError::EmptyRequiredField("display name".to_string()));
        }

        let mut handle = self.engine.new_record();
        handle.set_display_name(display_name)?;
        handle.validate()?;
        handle.serialize(&self.dir.join(filename))?;

        let snapshot = snapshot_of(filename, &handle);
        if !self.known_files.iter().any(|known| known == filename) {
            self.known_files.push(filename.to_string());
        }
        self.current = Some(LoadedRecord { handle, snapshot: snapshot.clone() });

        let now = OffsetDateTime::now_utc();
        let file_id = self.store.upsert_file(filename, now, now)?;
        self.store.upsert_contact(&snapshot.display_name, "", "", file_id)?;

        Ok(snapshot)
    }

    /// Apply field edits to the current record, persist it, and reload it
    /// from storage so the snapshot and mirror reflect what was written.
    ///
    /// When the storage write fails, the in-memory snapshot still carries
    /// the caller's edits and the error is reported; persisted state then
    /// lags the displayed state until a later update succeeds.
    ///
    /// # Errors
    /// Returns [`CardboxError::NoCurrentRecord`] when nothing is loaded,
    /// [`CardboxError::Io`] when the write fails, and any load error from
    /// the reload that follows a successful write.
    pub fn update_record(
        &mut self,
        filename: &str,
        edits: &FieldEdits,
    ) -> Result<Record, CardboxError> {
        let Some(mut loaded) = self.current.take() else {
            return Err(CardboxError::NoCurrentRecord);
        };

        let written = apply_edits(&mut loaded.handle, edits)
            .and_then(|()| loaded.handle.serialize(&self.dir.join(filename)));

        match written {
            Ok(()) => self.load_record(filename),
            Err(err) => {
                loaded.snapshot = snapshot_of(filename, &loaded.handle);
                self.current = Some(loaded);
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn current_record(&self) -> Option<&Record> {
        self.current.as_ref().map(|loaded| &loaded.snapshot)
    }

    /// Filenames from the last scan plus records created since.
    #[must_use]
    pub fn known_files(&self) -> &[String] {
        &self.known_files
    }

    /// End the session, releasing the store to the caller for closing.
    #[must_use]
    pub fn shutdown(self) -> S {
        self.store
    }
}

fn apply_edits<H: RecordHandle>(handle: &mut H, edits: &FieldEdits) -> Result<(), CardboxError> {
    if !edits.display_name.trim().is_empty() {
        handle.set_display_name(&edits.display_name)?;
    }
    handle.set_birthday(&edits.birthday)?;
    handle.set_anniversary(&edits.anniversary)?;
    Ok(())
}

fn snapshot_of<H: RecordHandle>(filename: &str, handle: &H) -> Record {
    Record {
        filename: filename.to_string(),
        display_name: handle.display_name(),
        birthday: handle.birthday(),
        anniversary: handle.anniversary(),
        optional_field_count: handle.optional_field_count(),
    }
}
