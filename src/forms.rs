//! Request payloads accepted by the dashboard routes and their validation.

use crate::db::NewAnalysis;
use crate::error::EmbarkError;
use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

const MAX_TEXT: usize = 127;
const MAX_NOTES: usize = 1024;

/// EMBA module identifiers such as `s20`, `f50` or `p02`.
static MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]\d{2}$").expect("static regex"));

static ARCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,16}$").expect("static regex"));

fn bounded(field: &str, value: &str, max: usize) -> Result<String, EmbarkError> {
    let value = value.trim();
    if value.chars().count() > max {
        return Err(EmbarkError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(value.to_string())
}

fn positive_id(field: &str, id: i64) -> Result<i64, EmbarkError> {
    if id <= 0 {
        return Err(EmbarkError::Validation(format!("{field} must be a valid id")));
    }
    Ok(id)
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub key: String,
}

/// Options for starting an EMBA run on an uploaded firmware file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FirmwareAnalysisForm {
    pub firmware: i64,
    pub version: String,
    pub vendor: String,
    pub device: String,
    pub notes: String,
    pub firmware_architecture: Option<String>,
    pub user_emulation_test: bool,
    pub system_emulation_test: bool,
    pub scan_modules: Vec<String>,
}

impl FirmwareAnalysisForm {
    /// Validate and convert; `firmware_name` is filled from the referenced file.
    pub fn validate(self, firmware_name: &str) -> Result<NewAnalysis, EmbarkError> {
        let firmware = positive_id("firmware", self.firmware)?;

        let firmware_architecture = match self.firmware_architecture.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(arch) if ARCH_RE.is_match(arch) => Some(arch.to_string()),
            Some(arch) => {
                return Err(EmbarkError::Validation(format!(
                    "invalid firmware architecture `{arch}`"
                )));
            }
        };

        let mut scan_modules = Vec::with_capacity(self.scan_modules.len());
        for module in &self.scan_modules {
            let module = module.trim().to_ascii_lowercase();
            if !MODULE_RE.is_match(&module) {
                return Err(EmbarkError::Validation(format!(
                    "invalid scan module `{module}`"
                )));
            }
            if !scan_modules.contains(&module) {
                scan_modules.push(module);
            }
        }

        Ok(NewAnalysis {
            firmware_id: Some(firmware),
            firmware_name: firmware_name.to_string(),
            version: bounded("version", &self.version, MAX_TEXT)?,
            vendor: bounded("vendor", &self.vendor, MAX_TEXT)?,
            device: bounded("device", &self.device, MAX_TEXT)?,
            notes: bounded("notes", &self.notes, MAX_NOTES)?,
            firmware_architecture,
            user_emulation_test: self.user_emulation_test,
            system_emulation_test: self.system_emulation_test,
            scan_modules,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteFirmwareForm {
    pub firmware: i64,
}

impl DeleteFirmwareForm {
    pub fn validate(&self) -> Result<i64, EmbarkError> {
        positive_id("firmware", self.firmware)
    }
}

#[derive(Debug, Deserialize)]
pub struct StopAnalysisForm {
    pub analysis: i64,
}

impl StopAnalysisForm {
    pub fn validate(&self) -> Result<i64, EmbarkError> {
        positive_id("analysis", self.analysis)
    }
}

#[derive(Debug, Deserialize)]
pub struct LabelSelectForm {
    pub label: i64,
}

impl LabelSelectForm {
    pub fn validate(&self) -> Result<i64, EmbarkError> {
        positive_id("label", self.label)
    }
}

#[derive(Debug, Deserialize)]
pub struct LabelForm {
    pub label_name: String,
}

impl LabelForm {
    pub fn validate(&self) -> Result<String, EmbarkError> {
        let name = bounded("label_name", &self.label_name, MAX_TEXT)?;
        if name.is_empty() {
            return Err(EmbarkError::Validation("label_name must not be empty".into()));
        }
        Ok(name)
    }
}

/// Date filter used by the tracker views, `YYYY-MM-DD`.
#[derive(Debug, Deserialize)]
pub struct TimeForm {
    pub date: String,
}

impl TimeForm {
    pub fn validate(&self) -> Result<NaiveDate, EmbarkError> {
        NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d")
            .map_err(|e| EmbarkError::Validation(format!("invalid date `{}`: {e}", self.date)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> FirmwareAnalysisForm {
        FirmwareAnalysisForm {
            firmware: 4,
            version: " 1.0.2 ".into(),
            vendor: "ACME".into(),
            device: "router".into(),
            scan_modules: vec!["S20".into(), "f50".into(), "s20".into()],
            ..FirmwareAnalysisForm::default()
        }
    }

    #[test]
    fn analysis_form_normalizes_fields() {
        let new = form().validate("fw.bin").unwrap();
        assert_eq!(new.firmware_id, Some(4));
        assert_eq!(new.firmware_name, "fw.bin");
        assert_eq!(new.version, "1.0.2");
        assert_eq!(new.scan_modules, vec!["s20".to_string(), "f50".to_string()]);
        assert!(new.firmware_architecture.is_none());
    }

    #[test]
    fn analysis_form_rejects_bad_input() {
        let bad_module = FirmwareAnalysisForm {
            scan_modules: vec!["s20; rm -rf /".into()],
            ..form()
        };
        assert!(matches!(bad_module.validate("fw"), Err(EmbarkError::Validation(_))));

        let bad_arch = FirmwareAnalysisForm {
            firmware_architecture: Some("MIPS -x".into()),
            ..form()
        };
        assert!(bad_arch.validate("fw").is_err());

        let no_firmware = FirmwareAnalysisForm {
            firmware: 0,
            ..form()
        };
        assert!(no_firmware.validate("fw").is_err());

        let long_vendor = FirmwareAnalysisForm {
            vendor: "v".repeat(MAX_TEXT + 1),
            ..form()
        };
        assert!(long_vendor.validate("fw").is_err());
    }

    #[test]
    fn analysis_form_accepts_architecture() {
        let arm = FirmwareAnalysisForm {
            firmware_architecture: Some("ARM64".into()),
            ..form()
        };
        assert_eq!(
            arm.validate("fw").unwrap().firmware_architecture.as_deref(),
            Some("ARM64")
        );
    }

    #[test]
    fn small_forms() {
        assert_eq!(DeleteFirmwareForm { firmware: 3 }.validate().unwrap(), 3);
        assert!(StopAnalysisForm { analysis: -1 }.validate().is_err());
        assert_eq!(LabelSelectForm { label: 9 }.validate().unwrap(), 9);
        assert!(LabelForm { label_name: "  ".into() }.validate().is_err());
        assert_eq!(
            TimeForm { date: "2024-02-29".into() }.validate().unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert!(TimeForm { date: "2023-02-29".into() }.validate().is_err());
    }
}
