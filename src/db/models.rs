use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbFirmwareFile {
    pub id: i64,
    pub file_name: String,
    pub path: String,
    pub upload_date: DateTime<Utc>,
}

/// Lifecycle of one EMBA run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Stopped,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Terminal states carry an `end_date`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown analysis status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbFirmwareAnalysis {
    pub id: i64,
    pub firmware_id: Option<i64>,
    pub firmware_name: String,
    pub version: String,
    pub vendor: String,
    pub device: String,
    pub notes: String,
    pub firmware_architecture: Option<String>,
    pub user_emulation_test: bool,
    pub system_emulation_test: bool,
    pub scan_modules: Vec<String>,
    pub path_to_logs: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: AnalysisStatus,
    pub zip_file: Option<String>,
}

/// Insert payload for a new analysis; the row starts out `pending`.
#[derive(Debug, Clone, Default)]
pub struct NewAnalysis {
    pub firmware_id: Option<i64>,
    pub firmware_name: String,
    pub version: String,
    pub vendor: String,
    pub device: String,
    pub notes: String,
    pub firmware_architecture: Option<String>,
    pub user_emulation_test: bool,
    pub system_emulation_test: bool,
    pub scan_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct DbLabel {
    pub id: i64,
    pub label_name: String,
}

/// Summary row imported from `f50_base_aggregator.csv`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, FromRow)]
pub struct AnalysisResult {
    pub id: i64,
    pub firmware_analysis_id: i64,
    pub emba_command: String,
    pub architecture_verified: String,
    pub os_verified: String,
    pub files: i64,
    pub directories: i64,
    pub entropy_value: f64,
    pub shell_scripts: i64,
    pub shell_script_vulns: i64,
    pub kernel_modules: i64,
    pub kernel_modules_lic: i64,
    pub interesting_files: i64,
    pub post_files: i64,
    pub canary: i64,
    pub canary_per: i64,
    pub relro: i64,
    pub relro_per: i64,
    pub no_exec: i64,
    pub no_exec_per: i64,
    pub pie: i64,
    pub pie_per: i64,
    pub stripped: i64,
    pub stripped_per: i64,
    pub bins_checked: i64,
    pub strcpy: i64,
    pub strcpy_bin: String,
    pub versions_identified: i64,
    pub cve_high: i64,
    pub cve_medium: i64,
    pub cve_low: i64,
    pub exploits: i64,
    pub metasploit_modules: i64,
    pub certificates: i64,
    pub certificates_outdated: i64,
}

impl AnalysisResult {
    /// Empty summary bound to an analysis, as created by the f20 import.
    pub fn empty(firmware_analysis_id: i64) -> Self {
        Self {
            firmware_analysis_id,
            strcpy_bin: "{}".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbVulnerability {
    pub id: i64,
    pub cve: String,
    /// JSON object with the per-CVE f20 columns.
    pub info: String,
}
