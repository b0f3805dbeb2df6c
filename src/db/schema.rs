//! SQL DDL for initializing the EMBArk database.
//! SQLite-first design; statements are split on `;` and run one by one.

/// SQLite schema with:
/// - `firmware_file`: uploaded images, `file_name` UNIQUE
/// - `firmware_analysis`: one EMBA run, `scan_modules` as JSON text
/// - `label` / `analysis_label`: many-to-many tags on analyses
/// - `result`: flat summary scalars, several rows per analysis allowed
/// - `vulnerability` / `result_vulnerability`: CVEs keyed by `cve` UNIQUE
/// - timestamps stored as RFC3339 text
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS firmware_file (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL,
    upload_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS firmware_analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    firmware_id INTEGER NULL REFERENCES firmware_file(id) ON DELETE SET NULL,
    firmware_name TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    vendor TEXT NOT NULL DEFAULT '',
    device TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    firmware_architecture TEXT NULL,
    user_emulation_test INTEGER NOT NULL DEFAULT 0,
    system_emulation_test INTEGER NOT NULL DEFAULT 0,
    scan_modules TEXT NOT NULL DEFAULT '[]', -- JSON array
    path_to_logs TEXT NOT NULL DEFAULT '',
    start_date TEXT NOT NULL,
    end_date TEXT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    zip_file TEXT NULL
);

CREATE INDEX IF NOT EXISTS idx_firmware_analysis_status ON firmware_analysis(status);

CREATE TABLE IF NOT EXISTS label (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS analysis_label (
    analysis_id INTEGER NOT NULL REFERENCES firmware_analysis(id) ON DELETE CASCADE,
    label_id INTEGER NOT NULL REFERENCES label(id) ON DELETE CASCADE,
    PRIMARY KEY (analysis_id, label_id)
);

CREATE TABLE IF NOT EXISTS result (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    firmware_analysis_id INTEGER NOT NULL REFERENCES firmware_analysis(id) ON DELETE CASCADE,
    emba_command TEXT NOT NULL DEFAULT '',
    architecture_verified TEXT NOT NULL DEFAULT '',
    os_verified TEXT NOT NULL DEFAULT '',
    files INTEGER NOT NULL DEFAULT 0,
    directories INTEGER NOT NULL DEFAULT 0,
    entropy_value REAL NOT NULL DEFAULT 0,
    shell_scripts INTEGER NOT NULL DEFAULT 0,
    shell_script_vulns INTEGER NOT NULL DEFAULT 0,
    kernel_modules INTEGER NOT NULL DEFAULT 0,
    kernel_modules_lic INTEGER NOT NULL DEFAULT 0,
    interesting_files INTEGER NOT NULL DEFAULT 0,
    post_files INTEGER NOT NULL DEFAULT 0,
    canary INTEGER NOT NULL DEFAULT 0,
    canary_per INTEGER NOT NULL DEFAULT 0,
    relro INTEGER NOT NULL DEFAULT 0,
    relro_per INTEGER NOT NULL DEFAULT 0,
    no_exec INTEGER NOT NULL DEFAULT 0,
    no_exec_per INTEGER NOT NULL DEFAULT 0,
    pie INTEGER NOT NULL DEFAULT 0,
    pie_per INTEGER NOT NULL DEFAULT 0,
    stripped INTEGER NOT NULL DEFAULT 0,
    stripped_per INTEGER NOT NULL DEFAULT 0,
    bins_checked INTEGER NOT NULL DEFAULT 0,
    strcpy INTEGER NOT NULL DEFAULT 0,
    strcpy_bin TEXT NOT NULL DEFAULT '{}', -- JSON object
    versions_identified INTEGER NOT NULL DEFAULT 0,
    cve_high INTEGER NOT NULL DEFAULT 0,
    cve_medium INTEGER NOT NULL DEFAULT 0,
    cve_low INTEGER NOT NULL DEFAULT 0,
    exploits INTEGER NOT NULL DEFAULT 0,
    metasploit_modules INTEGER NOT NULL DEFAULT 0,
    certificates INTEGER NOT NULL DEFAULT 0,
    certificates_outdated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_result_analysis ON result(firmware_analysis_id);

CREATE TABLE IF NOT EXISTS vulnerability (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cve TEXT NOT NULL UNIQUE,
    info TEXT NOT NULL DEFAULT '{}' -- JSON object
);

CREATE TABLE IF NOT EXISTS result_vulnerability (
    result_id INTEGER NOT NULL REFERENCES result(id) ON DELETE CASCADE,
    vulnerability_id INTEGER NOT NULL REFERENCES vulnerability(id) ON DELETE CASCADE,
    PRIMARY KEY (result_id, vulnerability_id)
);
"#;
