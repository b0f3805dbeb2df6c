use crate::db::models::{
    AnalysisResult, AnalysisStatus, DbFirmwareAnalysis, DbFirmwareFile, DbLabel, DbVulnerability,
    NewAnalysis,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::EmbarkError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

pub type SqlitePool = Pool<Sqlite>;

/// Summary columns of `result`, in bind order.
const RESULT_FIELDS: [&str; 33] = [
    "emba_command",
    "architecture_verified",
    "os_verified",
    "files",
    "directories",
    "entropy_value",
    "shell_scripts",
    "shell_script_vulns",
    "kernel_modules",
    "kernel_modules_lic",
    "interesting_files",
    "post_files",
    "canary",
    "canary_per",
    "relro",
    "relro_per",
    "no_exec",
    "no_exec_per",
    "pie",
    "pie_per",
    "stripped",
    "stripped_per",
    "bins_checked",
    "strcpy",
    "strcpy_bin",
    "versions_identified",
    "cve_high",
    "cve_medium",
    "cve_low",
    "exploits",
    "metasploit_modules",
    "certificates",
    "certificates_outdated",
];

const ANALYSIS_COLUMNS: &str = r#"id, firmware_id, firmware_name, version, vendor, device, notes,
    firmware_architecture, user_emulation_test, system_emulation_test, scan_modules,
    path_to_logs, start_date, end_date, status, zip_file"#;

#[derive(Clone)]
pub struct EmbarkStorage {
    pool: SqlitePool,
}

impl EmbarkStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, EmbarkError> {
        let connect_opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(&self) -> Result<(), EmbarkError> {
        // sqlx::query runs a single statement at a time
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- firmware files ----

    pub async fn insert_firmware_file(
        &self,
        file_name: &str,
        path: &str,
    ) -> Result<DbFirmwareFile, EmbarkError> {
        let upload_date = Utc::now();
        let id = sqlx::query("INSERT INTO firmware_file (file_name, path, upload_date) VALUES (?, ?, ?)")
            .bind(file_name)
            .bind(path)
            .bind(upload_date)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(DbFirmwareFile {
            id,
            file_name: file_name.to_string(),
            path: path.to_string(),
            upload_date,
        })
    }

    pub async fn get_firmware_file(&self, id: i64) -> Result<Option<DbFirmwareFile>, EmbarkError> {
        let file = sqlx::query_as::<_, DbFirmwareFile>(
            "SELECT id, file_name, path, upload_date FROM firmware_file WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    pub async fn find_firmware_file(
        &self,
        file_name: &str,
    ) -> Result<Option<DbFirmwareFile>, EmbarkError> {
        let file = sqlx::query_as::<_, DbFirmwareFile>(
            "SELECT id, file_name, path, upload_date FROM firmware_file WHERE file_name = ?",
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    pub async fn list_firmware_files(&self) -> Result<Vec<DbFirmwareFile>, EmbarkError> {
        let files = sqlx::query_as::<_, DbFirmwareFile>(
            "SELECT id, file_name, path, upload_date FROM firmware_file ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Returns false when no row matched.
    pub async fn delete_firmware_file(&self, id: i64) -> Result<bool, EmbarkError> {
        let done = sqlx::query("DELETE FROM firmware_file WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ---- analyses ----

    pub async fn create_analysis(&self, new: NewAnalysis) -> Result<i64, EmbarkError> {
        let scan_modules = serde_json::to_string(&new.scan_modules)?;
        let id = sqlx::query(
            r#"
            INSERT INTO firmware_analysis (
                firmware_id, firmware_name, version, vendor, device, notes,
                firmware_architecture, user_emulation_test, system_emulation_test,
                scan_modules, start_date, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.firmware_id)
        .bind(new.firmware_name)
        .bind(new.version)
        .bind(new.vendor)
        .bind(new.device)
        .bind(new.notes)
        .bind(new.firmware_architecture)
        .bind(new.user_emulation_test)
        .bind(new.system_emulation_test)
        .bind(scan_modules)
        .bind(Utc::now())
        .bind(AnalysisStatus::Pending.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_analysis(&self, id: i64) -> Result<Option<DbFirmwareAnalysis>, EmbarkError> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM firmware_analysis WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_analysis).transpose()
    }

    pub async fn list_analyses(&self) -> Result<Vec<DbFirmwareAnalysis>, EmbarkError> {
        let rows = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM firmware_analysis ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_analysis).collect()
    }

    pub async fn list_analyses_by_status(
        &self,
        statuses: &[AnalysisStatus],
    ) -> Result<Vec<DbFirmwareAnalysis>, EmbarkError> {
        let mut out = Vec::new();
        for analysis in self.list_analyses().await? {
            if statuses.contains(&analysis.status) {
                out.push(analysis);
            }
        }
        Ok(out)
    }

    pub async fn count_analyses(&self) -> Result<i64, EmbarkError> {
        let rec: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM firmware_analysis")
            .fetch_one(&self.pool)
            .await?;
        Ok(rec.0)
    }

    /// Update status; terminal states also stamp `end_date`.
    pub async fn set_status(&self, id: i64, status: AnalysisStatus) -> Result<(), EmbarkError> {
        let end_date: Option<DateTime<Utc>> = status.is_terminal().then(Utc::now);
        sqlx::query("UPDATE firmware_analysis SET status = ?, end_date = COALESCE(?, end_date) WHERE id = ?")
            .bind(status.as_str())
            .bind(end_date)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_path_to_logs(&self, id: i64, path: &str) -> Result<(), EmbarkError> {
        sqlx::query("UPDATE firmware_analysis SET path_to_logs = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_zip_file(&self, id: i64, path: &str) -> Result<(), EmbarkError> {
        sqlx::query("UPDATE firmware_analysis SET zip_file = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- labels ----

    /// Insert or fetch a label by name.
    pub async fn upsert_label(&self, label_name: &str) -> Result<DbLabel, EmbarkError> {
        sqlx::query("INSERT INTO label (label_name) VALUES (?) ON CONFLICT(label_name) DO NOTHING")
            .bind(label_name)
            .execute(&self.pool)
            .await?;
        let label = sqlx::query_as::<_, DbLabel>(
            "SELECT id, label_name FROM label WHERE label_name = ?",
        )
        .bind(label_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(label)
    }

    pub async fn get_label(&self, id: i64) -> Result<Option<DbLabel>, EmbarkError> {
        let label = sqlx::query_as::<_, DbLabel>("SELECT id, label_name FROM label WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(label)
    }

    pub async fn add_label(&self, analysis_id: i64, label_id: i64) -> Result<(), EmbarkError> {
        sqlx::query(
            "INSERT OR IGNORE INTO analysis_label (analysis_id, label_id) VALUES (?, ?)",
        )
        .bind(analysis_id)
        .bind(label_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn labels_for(&self, analysis_id: i64) -> Result<Vec<DbLabel>, EmbarkError> {
        let labels = sqlx::query_as::<_, DbLabel>(
            r#"SELECT l.id, l.label_name FROM label l
               JOIN analysis_label al ON al.label_id = l.id
               WHERE al.analysis_id = ? ORDER BY l.label_name"#,
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(labels)
    }

    // ---- results ----

    /// Create or update the summary of `result.firmware_analysis_id`.
    /// Keyed by analysis id; the first existing row is the one updated.
    pub async fn upsert_result(&self, result: &AnalysisResult) -> Result<AnalysisResult, EmbarkError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM result WHERE firmware_analysis_id = ? ORDER BY id LIMIT 1",
        )
        .bind(result.firmware_analysis_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some((id,)) => {
                let assignments = RESULT_FIELDS
                    .iter()
                    .map(|f| format!("{f} = ?"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("UPDATE result SET {assignments} WHERE id = ?");
                Self::bind_result_fields(sqlx::query(&sql), result)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let placeholders = vec!["?"; RESULT_FIELDS.len()].join(", ");
                let sql = format!(
                    "INSERT INTO result (firmware_analysis_id, {}) VALUES (?, {placeholders})",
                    RESULT_FIELDS.join(", ")
                );
                Self::bind_result_fields(
                    sqlx::query(&sql).bind(result.firmware_analysis_id),
                    result,
                )
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            }
        };
        tx.commit().await?;

        Ok(AnalysisResult {
            id,
            ..result.clone()
        })
    }

    /// Fetch the summary of an analysis, creating an empty one if none exists.
    pub async fn get_or_create_result(&self, analysis_id: i64) -> Result<AnalysisResult, EmbarkError> {
        if let Some(existing) = self.result_for_analysis(analysis_id).await? {
            return Ok(existing);
        }
        self.upsert_result(&AnalysisResult::empty(analysis_id)).await
    }

    pub async fn result_for_analysis(
        &self,
        analysis_id: i64,
    ) -> Result<Option<AnalysisResult>, EmbarkError> {
        let result = sqlx::query_as::<_, AnalysisResult>(
            "SELECT * FROM result WHERE firmware_analysis_id = ? ORDER BY id LIMIT 1",
        )
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    pub async fn list_results(&self) -> Result<Vec<AnalysisResult>, EmbarkError> {
        let results = sqlx::query_as::<_, AnalysisResult>("SELECT * FROM result ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(results)
    }

    fn bind_result_fields<'q>(
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        r: &AnalysisResult,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(r.emba_command.clone())
            .bind(r.architecture_verified.clone())
            .bind(r.os_verified.clone())
            .bind(r.files)
            .bind(r.directories)
            .bind(r.entropy_value)
            .bind(r.shell_scripts)
            .bind(r.shell_script_vulns)
            .bind(r.kernel_modules)
            .bind(r.kernel_modules_lic)
            .bind(r.interesting_files)
            .bind(r.post_files)
            .bind(r.canary)
            .bind(r.canary_per)
            .bind(r.relro)
            .bind(r.relro_per)
            .bind(r.no_exec)
            .bind(r.no_exec_per)
            .bind(r.pie)
            .bind(r.pie_per)
            .bind(r.stripped)
            .bind(r.stripped_per)
            .bind(r.bins_checked)
            .bind(r.strcpy)
            .bind(r.strcpy_bin.clone())
            .bind(r.versions_identified)
            .bind(r.cve_high)
            .bind(r.cve_medium)
            .bind(r.cve_low)
            .bind(r.exploits)
            .bind(r.metasploit_modules)
            .bind(r.certificates)
            .bind(r.certificates_outdated)
    }

    // ---- vulnerabilities ----

    /// Upsert by unique CVE id. Returns the row id.
    pub async fn upsert_vulnerability(&self, cve: &str, info: &Value) -> Result<i64, EmbarkError> {
        let info_json = serde_json::to_string(info)?;
        sqlx::query(
            r#"
            INSERT INTO vulnerability (cve, info) VALUES (?, ?)
            ON CONFLICT(cve) DO UPDATE SET info = excluded.info
            "#,
        )
        .bind(cve)
        .bind(info_json)
        .execute(&self.pool)
        .await?;

        let rec: (i64,) = sqlx::query_as("SELECT id FROM vulnerability WHERE cve = ?")
            .bind(cve)
            .fetch_one(&self.pool)
            .await?;
        Ok(rec.0)
    }

    pub async fn link_vulnerability(
        &self,
        result_id: i64,
        vulnerability_id: i64,
    ) -> Result<(), EmbarkError> {
        sqlx::query(
            "INSERT OR IGNORE INTO result_vulnerability (result_id, vulnerability_id) VALUES (?, ?)",
        )
        .bind(result_id)
        .bind(vulnerability_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn vulnerabilities_for_result(
        &self,
        result_id: i64,
    ) -> Result<Vec<DbVulnerability>, EmbarkError> {
        let vulns = sqlx::query_as::<_, DbVulnerability>(
            r#"SELECT v.id, v.cve, v.info FROM vulnerability v
               JOIN result_vulnerability rv ON rv.vulnerability_id = v.id
               WHERE rv.result_id = ? ORDER BY v.cve"#,
        )
        .bind(result_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(vulns)
    }

    fn row_to_analysis(row: SqliteRow) -> Result<DbFirmwareAnalysis, EmbarkError> {
        let scan_modules_json: String = row.try_get("scan_modules")?;
        let status_str: String = row.try_get("status")?;

        let scan_modules: Vec<String> = serde_json::from_str(&scan_modules_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let status = AnalysisStatus::from_str(&status_str)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(DbFirmwareAnalysis {
            id: row.try_get("id")?,
            firmware_id: row.try_get("firmware_id")?,
            firmware_name: row.try_get("firmware_name")?,
            version: row.try_get("version")?,
            vendor: row.try_get("vendor")?,
            device: row.try_get("device")?,
            notes: row.try_get("notes")?,
            firmware_architecture: row.try_get("firmware_architecture")?,
            user_emulation_test: row.try_get("user_emulation_test")?,
            system_emulation_test: row.try_get("system_emulation_test")?,
            scan_modules,
            path_to_logs: row.try_get("path_to_logs")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            status,
            zip_file: row.try_get("zip_file")?,
        })
    }
}
