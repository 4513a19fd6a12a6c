use std::fmt::{Display, Formatter};
use std::path::Path;

use cardbox_core::{CardboxError, ContactId, FileId, MirrorStore};
use rusqlite::{params, Connection, OptionalExtension};
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

const CREATE_MIRROR_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS file (
  file_id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_name TEXT NOT NULL UNIQUE,
  last_modified TEXT,
  creation_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contact (
  contact_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  birthday TEXT,
  anniversary TEXT,
  file_id INTEGER NOT NULL,
  FOREIGN KEY (file_id) REFERENCES file(file_id) ON DELETE CASCADE
);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp format error: {0}")]
    TimestampFormat(#[from] time::error::Format),
    #[error("no file row with id {0}")]
    MissingFile(FileId),
}

impl From<StoreError> for CardboxError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// One `contact` row, shaped for the contact listing output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContactRow {
    pub contact_id: ContactId,
    pub name: String,
    pub birthday: Option<String>,
    pub anniversary: Option<String>,
    pub file_id: FileId,
}

impl Display for ContactRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} | {} | {} | {}",
            self.contact_id,
            self.name,
            self.birthday.as_deref().unwrap_or("NULL"),
            self.anniversary.as_deref().unwrap_or("NULL"),
            self.file_id
        )
    }
}

/// One row of the June birthday listing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JuneBirthdayRow {
    pub name: String,
    pub birthday: String,
}

impl Display for JuneBirthdayRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} | {}", self.name, self.birthday)
    }
}

/// SQLite-backed mirror of the record directory. One instance owns the
/// connection for a whole controller session.
pub struct SqliteMirror {
    conn: Connection,
}

impl SqliteMirror {
    /// Open the mirror database, configure runtime pragmas, and ensure the
    /// `file` and `contact` tables exist.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(CREATE_MIRROR_SCHEMA_SQL)?;

        Ok(Self { conn })
    }

    /// Insert a file row, or return the existing row's id with its recorded
    /// times left untouched.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn upsert_file(
        &mut self,
        file_name: &str,
        creation_time: OffsetDateTime,
        last_modified: OffsetDateTime,
    ) -> Result<FileId, StoreError> {
        let existing = self
            .conn
            .query_row(
                "SELECT file_id FROM file WHERE file_name = ?1",
                params![file_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        if let Some(file_id) = existing {
            return Ok(FileId(file_id));
        }

        self.conn.execute(
            "INSERT INTO file(file_name, last_modified, creation_time) VALUES (?1, ?2, ?3)",
            params![
                file_name,
                sql_datetime(last_modified)?,
                sql_datetime(creation_time)?,
            ],
        )?;
        Ok(FileId(self.conn.last_insert_rowid()))
    }

    /// Refresh the last-modified time of an existing file row.
    ///
    /// # Errors
    /// Returns an error when the update fails or no row has `file_id`.
    pub fn touch_file(
        &mut self,
        file_id: FileId,
        last_modified: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE file SET last_modified = ?1 WHERE file_id = ?2",
            params![sql_datetime(last_modified)?, file_id.0],
        )?;
        if updated == 0 {
            return Err(StoreError::MissingFile(file_id));
        }
        Ok(())
    }

    /// Insert the contact row owned by `file_id`, or update it in place when
    /// one already exists. Blank names are stored as `Unknown`; dates that do
    /// not normalize to a SQL datetime are stored as NULL.
    ///
    /// # Errors
    /// Returns an error when the lookup or write fails.
    pub fn upsert_contact(
        &mut self,
        name: &str,
        birthday: &str,
        anniversary: &str,
        file_id: FileId,
    ) -> Result<ContactId, StoreError> {
        let name = if name.trim().is_empty() { "Unknown" } else { name };
        let birthday = mirror_datetime(birthday);
        let anniversary = mirror_datetime(anniversary);

        let existing = self
            .conn
            .query_row(
                "SELECT contact_id FROM contact WHERE file_id = ?1",
                params![file_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        if let Some(contact_id) = existing {
            self.conn.execute(
                "UPDATE contact SET name = ?1, birthday = ?2, anniversary = ?3
                 WHERE contact_id = ?4",
                params![name, birthday, anniversary, contact_id],
            )?;
            return Ok(ContactId(contact_id));
        }

        self.conn.execute(
            "INSERT INTO contact(name, birthday, anniversary, file_id) VALUES (?1, ?2, ?3, ?4)",
            params![name, birthday, anniversary, file_id.0],
        )?;
        Ok(ContactId(self.conn.last_insert_rowid()))
    }

    /// Load every contact row in id order, ready for the listing output.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn all_contacts(&self) -> Result<Vec<ContactRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id, name, birthday, anniversary, file_id
             FROM contact
             ORDER BY contact_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(ContactRow {
                contact_id: ContactId(row.get(0)?),
                name: row.get(1)?,
                birthday: row.get(2)?,
                anniversary: row.get(3)?,
                file_id: FileId(row.get(4)?),
            });
        }
        Ok(contacts)
    }

    /// List contacts born in June, ordered by their age at the owning file's
    /// last-modified time, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn june_birthdays(&self) -> Result<Vec<JuneBirthdayRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.name, strftime('%Y-%m-%d', c.birthday)
             FROM contact c
             JOIN file f ON f.file_id = c.file_id
             WHERE strftime('%m', c.birthday) = '06'
             ORDER BY CAST(strftime('%Y', f.last_modified) AS INTEGER)
                      - CAST(strftime('%Y', c.birthday) AS INTEGER)
                      - (strftime('%m-%d', f.last_modified) < strftime('%m-%d', c.birthday))
                      DESC",
        )?;

        let mut rows = stmt.query([])?;
        let mut birthdays = Vec::new();
        while let Some(row) = rows.next()? {
            birthdays.push(JuneBirthdayRow {
                name: row.get(0)?,
                birthday: row.get(1)?,
            });
        }
        Ok(birthdays)
    }

    /// Close the underlying connection.
    ///
    /// # Errors
    /// Returns the final `SQLite` error when the close fails.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }
}

impl MirrorStore for SqliteMirror {
    fn upsert_file(
        &mut self,
        file_name: &str,
        creation_time: OffsetDateTime,
        last_modified: OffsetDateTime,
    ) -> Result<FileId, CardboxError> {
        Ok(SqliteMirror::upsert_file(
            self,
            file_name,
            creation_time,
            last_modified,
        )?)
    }

    fn touch_file(
        &mut self,
        file_id: FileId,
        last_modified: OffsetDateTime,
    ) -> Result<(), CardboxError> {
        Ok(SqliteMirror::touch_file(self, file_id, last_modified)?)
    }

    fn upsert_contact(
        &mut self,
        name: &str,
        birthday: &str,
        anniversary: &str,
        file_id: FileId,
    ) -> Result<ContactId, CardboxError> {
        Ok(SqliteMirror::upsert_contact(
            self,
            name,
            birthday,
            anniversary,
            file_id,
        )?)
    }
}

fn sql_datetime(value: OffsetDateTime) -> Result<String, StoreError> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(value.format(format)?)
}

/// Normalizes an engine-supplied date to the SQL datetime shape. Compact
/// vCard timestamps (`YYYYMMDD[Thhmmss][Z]`) and dashed `YYYY-MM-DD` forms
/// (with an optional ` HH:MM:SS`) all mirror as `YYYY-MM-DD HH:MM:SS`;
/// free-text and impossible calendar dates mirror as NULL.
fn mirror_datetime(raw: &str) -> Option<String> {
    let body = raw.strip_suffix('Z').unwrap_or(raw);

    let compact = format_description!("[year][month][day][hour][minute][second]");
    let sql = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

    let parsed = match body.split_once('T') {
        Some((date, time)) => PrimitiveDateTime::parse(&format!("{date}{time}"), compact),
        None if body.contains('-') => PrimitiveDateTime::parse(body, sql).or_else(|_| {
            Date::parse(body, format_description!("[year]-[month]-[day]")).map(Date::midnight)
        }),
        None => PrimitiveDateTime::parse(&format!("{body}000000"), compact),
    }
    .ok()?;

    parsed.format(sql).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use time::macros::datetime;

    fn mirror() -> Result<SqliteMirror, StoreError> {
        SqliteMirror::open(Path::new(":memory:"))
    }

    fn contact_count(store: &SqliteMirror) -> Result<i64, StoreError> {
        Ok(store
            .conn
            .query_row("SELECT COUNT(*) FROM contact", [], |row| {
                row.get::<_, i64>(0)
            })?)
    }

    // Test IDs: TSTR-001
    #[test]
    fn upsert_file_returns_the_existing_row_untouched() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let first = store.upsert_file(
            "alice.vcf",
            datetime!(2026-01-02 03:04:05 UTC),
            datetime!(2026-01-02 03:04:05 UTC),
        )?;
        let second = store.upsert_file(
            "alice.vcf",
            datetime!(2026-07-08 09:10:11 UTC),
            datetime!(2026-07-08 09:10:11 UTC),
        )?;
        assert_eq!(first, second);

        let (creation, modified) = store.conn.query_row(
            "SELECT creation_time, last_modified FROM file WHERE file_id = ?1",
            params![first.0],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        assert_eq!(creation, "2026-01-02 03:04:05");
        assert_eq!(modified, "2026-01-02 03:04:05");
        Ok(())
    }

    // Test IDs: TSTR-002
    #[test]
    fn distinct_file_names_get_distinct_rows() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let now = datetime!(2026-01-02 03:04:05 UTC);
        let alice = store.upsert_file("alice.vcf", now, now)?;
        let bob = store.upsert_file("bob.vcf", now, now)?;
        assert_ne!(alice, bob);
        Ok(())
    }

    // Test IDs: TSTR-003
    #[test]
    fn touch_file_updates_only_the_modified_time() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let file_id = store.upsert_file(
            "alice.vcf",
            datetime!(2026-01-02 03:04:05 UTC),
            datetime!(2026-01-02 03:04:05 UTC),
        )?;
        store.touch_file(file_id, datetime!(2026-07-08 09:10:11 UTC))?;

        let (creation, modified) = store.conn.query_row(
            "SELECT creation_time, last_modified FROM file WHERE file_id = ?1",
            params![file_id.0],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        assert_eq!(creation, "2026-01-02 03:04:05");
        assert_eq!(modified, "2026-07-08 09:10:11");
        Ok(())
    }

    // Test IDs: TSTR-004
    #[test]
    fn touching_a_missing_file_row_fails() -> Result<(), StoreError> {
        let mut store = mirror()?;
        match store.touch_file(FileId(999), datetime!(2026-01-02 03:04:05 UTC)) {
            Ok(()) => panic!("touching a missing row must fail"),
            Err(err) => assert!(matches!(err, StoreError::MissingFile(FileId(999)))),
        }
        Ok(())
    }

    // Test IDs: TSTR-005
    #[test]
    fn upsert_contact_updates_the_existing_row_in_place() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let now = datetime!(2026-01-02 03:04:05 UTC);
        let file_id = store.upsert_file("alice.vcf", now, now)?;

        let first = store.upsert_contact("Alice Example", "19900601", "", file_id)?;
        let second = store.upsert_contact("Alice Q. Example", "19900601", "20150810", file_id)?;
        assert_eq!(first, second);
        assert_eq!(contact_count(&store)?, 1);

        let rows = store.all_contacts()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Alice Q. Example");
        assert_eq!(rows[0].anniversary.as_deref(), Some("2015-08-10 00:00:00"));
        Ok(())
    }

    // Test IDs: TSTR-006
    #[test]
    fn blank_names_are_stored_as_unknown() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let now = datetime!(2026-01-02 03:04:05 UTC);
        let file_id = store.upsert_file("mystery.vcf", now, now)?;
        store.upsert_contact("  ", "", "", file_id)?;

        let rows = store.all_contacts()?;
        assert_eq!(rows[0].name, "Unknown");
        Ok(())
    }

    // Test IDs: TSTR-007
    #[test]
    fn dates_mirror_as_sql_datetimes_or_null() {
        assert_eq!(
            mirror_datetime("19960415T231000Z").as_deref(),
            Some("1996-04-15 23:10:00")
        );
        assert_eq!(
            mirror_datetime("19960415T231000").as_deref(),
            Some("1996-04-15 23:10:00")
        );
        assert_eq!(
            mirror_datetime("20090808").as_deref(),
            Some("2009-08-08 00:00:00")
        );
        assert_eq!(
            mirror_datetime("1990-06-15").as_deref(),
            Some("1990-06-15 00:00:00")
        );
        assert_eq!(
            mirror_datetime("1990-06-15 12:30:00").as_deref(),
            Some("1990-06-15 12:30:00")
        );
        assert_eq!(mirror_datetime("circa 1960"), None);
        assert_eq!(mirror_datetime(""), None);
        assert_eq!(mirror_datetime("19960231"), None);
        assert_eq!(mirror_datetime("1990-02-31"), None);
        assert_eq!(mirror_datetime("T231000"), None);
    }

    // Test IDs: TSTR-008
    #[test]
    fn contact_rows_render_for_the_listing() -> Result<(), StoreError> {
        let mut store = mirror()?;
        let now = datetime!(2026-01-02 03:04:05 UTC);
        let alice = store.upsert_file("alice.vcf", now, now)?;
        store.upsert_contact("Alice Example", "20080605T120000", "circa 1990", alice)?;
        let bob = store.upsert_file("bob.vcf", now, now)?;
        store.upsert_contact("Bob Example", "", "", bob)?;

        let listed: Vec<String> = store
            .all_contacts()?
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            listed,
            [
                "1 | Alice Example | 2008-06-05 12:00:00 | NULL | 1",
                "2 | Bob Example | NULL | NULL | 2",
            ]
        );
        Ok(())
    }

    // Test IDs: TSTR-009
    #[test]
    fn june_birthdays_order_by_age_at_last_modified() -> Result<(), StoreError> {
        let mut store = mirror()?;

        let elder = store.upsert_file(
            "elder.vcf",
            datetime!(2020-08-01 00:00:00 UTC),
            datetime!(2020-08-01 00:00:00 UTC),
        )?;
        store.upsert_contact("Elder June", "19600605", "", elder)?;

        // Born later in June than the file was touched, so one year younger.
        let pending = store.upsert_file(
            "pending.vcf",
            datetime!(2020-06-01 00:00:00 UTC),
            datetime!(2020-06-01 00:00:00 UTC),
        )?;
        store.upsert_contact("Pending June", "19900615", "", pending)?;

        let recent = store.upsert_file(
            "recent.vcf",
            datetime!(2020-06-02 00:00:00 UTC),
            datetime!(2020-06-02 00:00:00 UTC),
        )?;
        store.upsert_contact("Recent June", "19950601", "", recent)?;

        let excluded = store.upsert_file(
            "excluded.vcf",
            datetime!(2020-08-01 00:00:00 UTC),
            datetime!(2020-08-01 00:00:00 UTC),
        )?;
        store.upsert_contact("May Person", "19500505", "", excluded)?;

        let textual = store.upsert_file(
            "textual.vcf",
            datetime!(2020-08-01 00:00:00 UTC),
            datetime!(2020-08-01 00:00:00 UTC),
        )?;
        store.upsert_contact("Text Date", "circa 1960", "", textual)?;

        let listed: Vec<String> = store
            .june_birthdays()?
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            listed,
            [
                "Elder June | 1960-06-05",
                "Pending June | 1990-06-15",
                "Recent June | 1995-06-01",
            ]
        );
        Ok(())
    }

    // Test IDs: TSTR-010
    #[test]
    fn store_failures_surface_as_cardbox_errors() -> Result<(), StoreError> {
        let mut store = mirror()?;
        store.conn.execute("DROP TABLE contact", [])?;

        match MirrorStore::upsert_contact(&mut store, "Alice Example", "", "", FileId(1)) {
            Ok(id) => panic!("upsert into a dropped table must fail, got {id}"),
            Err(CardboxError::Store(message)) => assert!(message.contains("SQLite error")),
            Err(other) => panic!("unexpected error variant: {other}"),
        }
        Ok(())
    }

    // Test IDs: TSTR-011
    #[test]
    fn close_releases_the_connection() -> Result<(), StoreError> {
        let store = mirror()?;
        store.close()
    }
}
