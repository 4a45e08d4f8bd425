use rusqlite::{Connection, Result};
use tracing::debug;

const SCHEMA_VERSION: i64 = 1;

/// Tables in child-to-parent order, so deletes never trip a foreign key.
const TABLES: &[&str] = &[
    "dwi_skeletonization",
    "dwi_freewater",
    "dwi_cnn_masking",
    "dwi_eddy",
    "dwi_topup",
    "dwi_pa_denoise",
    "dwi_ap_denoise",
    "dwi_pa_unring",
    "dwi_ap_unring",
    "dwi_pa",
    "dwi_ap",
    "dwi",
    "qqc",
    "session_num",
    "session_date",
    "mri_zip",
    "subject",
];

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, foreign keys on)");
        Ok(())
    }

    /// Create any missing tables. Tracking rows are a cache of the
    /// filesystem, so an older schema is dropped and rebuilt.
    fn migrate_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version != 0 && version < SCHEMA_VERSION {
            debug!(
                "Schema version {} < {}, dropping all tables and recreating",
                version, SCHEMA_VERSION
            );
            self.drop_tables()?;
        }

        self.conn.execute_batch(include_str!("schema.sql"))?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn truncate_all(&self) -> Result<()> {
        let sql: String = TABLES
            .iter()
            .map(|table| format!("DELETE FROM {};", table))
            .collect::<Vec<_>>()
            .join("\n");
        self.conn.execute_batch(&sql)?;
        debug!("All tables truncated");
        Ok(())
    }

    /// Drop every table and recreate the empty schema.
    pub fn drop_all(&self) -> Result<()> {
        self.drop_tables()?;
        self.conn.execute_batch(include_str!("schema.sql"))?;
        debug!("All tables dropped and recreated");
        Ok(())
    }

    fn drop_tables(&self) -> Result<()> {
        let sql: String = TABLES
            .iter()
            .map(|table| format!("DROP TABLE IF EXISTS {};", table))
            .collect::<Vec<_>>()
            .join("\n");
        self.conn.execute_batch(&sql)
    }
}
