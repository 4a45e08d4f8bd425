use super::models::*;
use super::sqlite::Database;
use rusqlite::{params, OptionalExtension, Result, Row};
use std::path::PathBuf;
use tracing::debug;

/// Columns and joins resolving a `dwi` row up to its subject. Callers
/// select `DWI_CONTEXT_COLUMNS` and read them with `dwi_context_from_row`.
pub(crate) const DWI_CONTEXT_COLUMNS: &str =
    "dwi.id, subject.id, session_date.scan_date, session_num.num, qqc.rawdata_dir, dwi.output_dir";

pub(crate) const DWI_CONTEXT_JOINS: &str = "JOIN qqc ON qqc.id = dwi.qqc_id \
     JOIN session_num ON session_num.id = qqc.session_num_id \
     JOIN session_date ON session_date.id = session_num.session_date_id \
     JOIN subject ON subject.id = session_date.subject_id";

/// Read a `DwiContext` from six columns starting at `offset`.
pub(crate) fn dwi_context_from_row(row: &Row<'_>, offset: usize) -> Result<DwiContext> {
    Ok(DwiContext {
        dwi_id: row.get(offset)?,
        subject_id: row.get(offset + 1)?,
        scan_date: row.get(offset + 2)?,
        num: row.get(offset + 3)?,
        rawdata_dir: PathBuf::from(row.get::<_, String>(offset + 4)?),
        output_dir: PathBuf::from(row.get::<_, String>(offset + 5)?),
    })
}

fn scan_from_row(row: &Row<'_>, direction: Direction) -> Result<DwiScan> {
    Ok(DwiScan {
        id: row.get(0)?,
        dwi_id: row.get(1)?,
        direction,
        run: row.get(2)?,
        filename: row.get(3)?,
        to_be_used: row.get(4)?,
    })
}

impl Database {
    // ── Subject ──────────────────────────────────────────────────

    pub fn list_subjects(&self) -> Result<Vec<Subject>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id, site, network, source_dir FROM subject ORDER BY id")?;
        let subjects = stmt
            .query_map([], |row| {
                Ok(Subject {
                    id: row.get(0)?,
                    site: row.get(1)?,
                    network: row.get(2)?,
                    source_dir: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(subjects)
    }

    pub fn insert_subject(&self, subject: &Subject) -> Result<()> {
        self.connection().execute(
            "INSERT INTO subject (id, site, network, source_dir) VALUES (?1, ?2, ?3, ?4)",
            params![subject.id, subject.site, subject.network, subject.source_dir],
        )?;
        debug!("Inserted subject {}", subject.id);
        Ok(())
    }

    /// Delete a subject; everything it owns cascades with it.
    pub fn delete_subject(&self, subject_id: &str) -> Result<usize> {
        self.connection()
            .execute("DELETE FROM subject WHERE id = ?1", params![subject_id])
    }

    // ── MriZip ───────────────────────────────────────────────────

    pub fn list_mri_zips(&self, subject_id: &str) -> Result<Vec<MriZip>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, subject_id, filename, modified_at, wrong_format, removed \
             FROM mri_zip WHERE subject_id = ?1 ORDER BY filename",
        )?;
        let zips = stmt
            .query_map(params![subject_id], mri_zip_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(zips)
    }

    /// Archives that can be expanded into sessions.
    pub fn list_valid_mri_zips(&self) -> Result<Vec<MriZip>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, subject_id, filename, modified_at, wrong_format, removed \
             FROM mri_zip WHERE wrong_format = 0 AND removed = 0 \
             ORDER BY subject_id, filename",
        )?;
        let zips = stmt
            .query_map([], mri_zip_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(zips)
    }

    pub fn insert_mri_zip(
        &self,
        subject_id: &str,
        filename: &str,
        modified_at: i64,
        wrong_format: bool,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO mri_zip (subject_id, filename, modified_at, wrong_format, removed) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![subject_id, filename, modified_at, wrong_format],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn set_mri_zip_removed(&self, zip_id: i64, removed: bool) -> Result<()> {
        self.connection().execute(
            "UPDATE mri_zip SET removed = ?1 WHERE id = ?2",
            params![removed, zip_id],
        )?;
        Ok(())
    }

    pub fn delete_mri_zip(&self, zip_id: i64) -> Result<()> {
        self.connection()
            .execute("DELETE FROM mri_zip WHERE id = ?1", params![zip_id])?;
        Ok(())
    }

    /// True if a session date was created from this archive.
    pub fn mri_zip_has_session(&self, zip_id: i64) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM session_date WHERE mri_zip_id = ?1",
            params![zip_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── SessionDate / SessionNum ─────────────────────────────────

    /// Returns the session date id and whether it was inserted.
    pub fn find_or_create_session_date(
        &self,
        subject_id: &str,
        scan_date: &str,
        mri_zip_id: i64,
    ) -> Result<(i64, bool)> {
        let existing: Option<i64> = self
            .connection()
            .query_row(
                "SELECT id FROM session_date WHERE subject_id = ?1 AND scan_date = ?2",
                params![subject_id, scan_date],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => Ok((id, false)),
            None => {
                self.connection().execute(
                    "INSERT INTO session_date (subject_id, scan_date, mri_zip_id) \
                     VALUES (?1, ?2, ?3)",
                    params![subject_id, scan_date, mri_zip_id],
                )?;
                Ok((self.connection().last_insert_rowid(), true))
            }
        }
    }

    pub fn find_or_create_session_num(&self, session_date_id: i64, num: i64) -> Result<(i64, bool)> {
        let existing: Option<i64> = self
            .connection()
            .query_row(
                "SELECT id FROM session_num WHERE session_date_id = ?1 AND num = ?2",
                params![session_date_id, num],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => Ok((id, false)),
            None => {
                self.connection().execute(
                    "INSERT INTO session_num (session_date_id, num) VALUES (?1, ?2)",
                    params![session_date_id, num],
                )?;
                Ok((self.connection().last_insert_rowid(), true))
            }
        }
    }

    // ── Qqc ──────────────────────────────────────────────────────

    pub fn find_qqc_by_session_num(&self, session_num_id: i64) -> Result<Option<i64>> {
        self.connection()
            .query_row(
                "SELECT id FROM qqc WHERE session_num_id = ?1",
                params![session_num_id],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn insert_qqc(
        &self,
        session_num_id: i64,
        source_dir: &str,
        rawdata_dir: &str,
        derivative_dir: &str,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO qqc (session_num_id, source_dir, rawdata_dir, derivative_dir) \
             VALUES (?1, ?2, ?3, ?4)",
            params![session_num_id, source_dir, rawdata_dir, derivative_dir],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn list_qqc_contexts(&self) -> Result<Vec<QqcContext>> {
        let mut stmt = self.connection().prepare(
            "SELECT qqc.id, qqc.session_num_id, qqc.source_dir, qqc.rawdata_dir, \
                    qqc.derivative_dir, qqc.qqc_executed, qqc.qqc_completed, \
                    qqc.run_sheet_exists, subject.id, subject.source_dir, \
                    session_date.scan_date, session_num.num \
             FROM qqc \
             JOIN session_num ON session_num.id = qqc.session_num_id \
             JOIN session_date ON session_date.id = session_num.session_date_id \
             JOIN subject ON subject.id = session_date.subject_id \
             ORDER BY subject.id, session_date.scan_date, session_num.num",
        )?;
        let contexts = stmt
            .query_map([], |row| {
                Ok(QqcContext {
                    qqc: Qqc {
                        id: row.get(0)?,
                        session_num_id: row.get(1)?,
                        source_dir: row.get(2)?,
                        rawdata_dir: row.get(3)?,
                        derivative_dir: row.get(4)?,
                        qqc_executed: row.get(5)?,
                        qqc_completed: row.get(6)?,
                        run_sheet_exists: row.get(7)?,
                    },
                    subject_id: row.get(8)?,
                    subject_source_dir: row.get(9)?,
                    scan_date: row.get(10)?,
                    num: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(contexts)
    }

    pub fn update_qqc_flags(
        &self,
        qqc_id: i64,
        executed: bool,
        completed: bool,
        run_sheet_exists: bool,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE qqc SET qqc_executed = ?1, qqc_completed = ?2, run_sheet_exists = ?3 \
             WHERE id = ?4",
            params![executed, completed, run_sheet_exists, qqc_id],
        )?;
        Ok(())
    }

    // ── Dwi ──────────────────────────────────────────────────────

    pub fn find_dwi_by_qqc(&self, qqc_id: i64) -> Result<Option<Dwi>> {
        self.connection()
            .query_row(
                "SELECT id, qqc_id, output_dir, full_data, extra_data FROM dwi WHERE qqc_id = ?1",
                params![qqc_id],
                dwi_from_row,
            )
            .optional()
    }

    pub fn get_dwi(&self, dwi_id: i64) -> Result<Dwi> {
        self.connection().query_row(
            "SELECT id, qqc_id, output_dir, full_data, extra_data FROM dwi WHERE id = ?1",
            params![dwi_id],
            dwi_from_row,
        )
    }

    pub fn insert_dwi(&self, qqc_id: i64, output_dir: &str) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO dwi (qqc_id, output_dir) VALUES (?1, ?2)",
            params![qqc_id, output_dir],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn set_dwi_flags(&self, dwi_id: i64, full_data: bool, extra_data: bool) -> Result<()> {
        self.connection().execute(
            "UPDATE dwi SET full_data = ?1, extra_data = ?2 WHERE id = ?3",
            params![full_data, extra_data, dwi_id],
        )?;
        Ok(())
    }

    // ── DwiAP / DwiPA ────────────────────────────────────────────

    pub fn list_scans(&self, dwi_id: i64, direction: Direction) -> Result<Vec<DwiScan>> {
        let sql = format!(
            "SELECT id, dwi_id, run, filename, to_be_used FROM {} \
             WHERE dwi_id = ?1 ORDER BY run, filename",
            direction.table()
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let scans = stmt
            .query_map(params![dwi_id], |row| scan_from_row(row, direction))?
            .collect::<Result<Vec<_>>>()?;
        Ok(scans)
    }

    /// Every `to_be_used` scan of a Dwi, AP runs first.
    pub fn list_usable_scans(&self, dwi_id: i64) -> Result<Vec<DwiScan>> {
        let mut scans = self.list_scans(dwi_id, Direction::Ap)?;
        scans.extend(self.list_scans(dwi_id, Direction::Pa)?);
        scans.retain(|scan| scan.to_be_used);
        Ok(scans)
    }

    pub fn find_scan(
        &self,
        dwi_id: i64,
        direction: Direction,
        run: i64,
        filename: &str,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE dwi_id = ?1 AND run = ?2 AND filename = ?3",
            direction.table()
        );
        self.connection()
            .query_row(&sql, params![dwi_id, run, filename], |row| row.get(0))
            .optional()
    }

    pub fn insert_scan(
        &self,
        dwi_id: i64,
        direction: Direction,
        run: i64,
        filename: &str,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (dwi_id, run, filename, to_be_used) VALUES (?1, ?2, ?3, 0)",
            direction.table()
        );
        self.connection()
            .execute(&sql, params![dwi_id, run, filename])?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn set_scan_to_be_used(&self, direction: Direction, scan_id: i64, to_be_used: bool) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET to_be_used = ?1 WHERE id = ?2",
            direction.table()
        );
        self.connection().execute(&sql, params![to_be_used, scan_id])?;
        Ok(())
    }
}

fn mri_zip_from_row(row: &Row<'_>) -> Result<MriZip> {
    Ok(MriZip {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        filename: row.get(2)?,
        modified_at: row.get(3)?,
        wrong_format: row.get(4)?,
        removed: row.get(5)?,
    })
}

fn dwi_from_row(row: &Row<'_>) -> Result<Dwi> {
    Ok(Dwi {
        id: row.get(0)?,
        qqc_id: row.get(1)?,
        output_dir: row.get(2)?,
        full_data: row.get(3)?,
        extra_data: row.get(4)?,
    })
}
