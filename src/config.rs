use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Process-wide configuration, resolved once from defaults and `EMBARK_*` env vars.
pub static CONFIG: LazyLock<Config> = LazyLock::new(|| match Config::load() {
    Ok(cfg) => cfg,
    Err(e) => {
        eprintln!("invalid EMBARK_* configuration, falling back to defaults: {e}");
        Config::default()
    }
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub loglevel: String,
    pub listen_addr: String,

    /// Shared key required by the login route; empty locks every route.
    pub embark_key: String,
    /// Path of the login route.
    pub login_url: String,
    /// Secret used to derive the private cookie key; must be at least 64 bytes.
    pub cookie_secret: String,
    pub insecure_cookie: bool,
    pub login_per_minute: u32,

    /// Root of the EMBA log directories, one per analysis id.
    pub log_root: PathBuf,
    /// Where uploaded firmware files are stored.
    pub upload_root: PathBuf,
    /// Where firmware is copied before an analysis starts.
    pub active_root: PathBuf,
    /// EMBA entry script; analyses stay pending while unset.
    pub emba_script: Option<PathBuf>,

    pub body_limit_mb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:embark.sqlite".to_string(),
            loglevel: "info".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            embark_key: String::new(),
            login_url: "/".to_string(),
            cookie_secret: String::new(),
            insecure_cookie: false,
            login_per_minute: 10,
            log_root: PathBuf::from("emba_logs"),
            upload_root: PathBuf::from("uploadedFirmwareImages"),
            active_root: PathBuf::from("uploadedFirmwareImages/active"),
            emba_script: None,
            body_limit_mb: 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed("EMBARK_"))
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Directory EMBA writes the logs of one analysis to.
    pub fn analysis_log_dir(&self, analysis_id: i64) -> PathBuf {
        self.log_root.join(analysis_id.to_string())
    }

    /// Directory holding the aggregated CSV files of one analysis.
    pub fn csv_log_dir(&self, analysis_id: i64) -> PathBuf {
        self.analysis_log_dir(analysis_id)
            .join("emba_logs")
            .join("csv_logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("EMBARK_EMBARK_KEY", "s3cret");
            jail.set_env("EMBARK_BODY_LIMIT_MB", "2");
            jail.set_env("EMBARK_EMBA_SCRIPT", "/opt/emba/emba");

            let cfg = Config::load()?;
            assert_eq!(cfg.embark_key, "s3cret");
            assert_eq!(cfg.body_limit(), 2 * 1024 * 1024);
            assert_eq!(cfg.emba_script, Some(PathBuf::from("/opt/emba/emba")));
            assert_eq!(cfg.login_url, "/");
            Ok(())
        });
    }

    #[test]
    fn no_default_key() {
        assert!(Config::default().embark_key.is_empty());
    }

    #[test]
    fn csv_log_dir_layout() {
        let cfg = Config {
            log_root: PathBuf::from("/var/emba"),
            ..Config::default()
        };
        assert_eq!(
            cfg.csv_log_dir(7),
            PathBuf::from("/var/emba/7/emba_logs/csv_logs")
        );
    }
}
