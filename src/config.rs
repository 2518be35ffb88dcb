//! Job configuration: source/target column layouts, key naming and bucket roots.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_META_KEY: &str = "meta_file.csv";
pub const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub first_extract_date: NaiveDate,
    pub columns: Vec<String>,
    pub col_date: String,
    pub col_isin: String,
    pub col_time: String,
    pub col_start_price: String,
    pub col_min_price: String,
    pub col_max_price: String,
    pub col_traded_vol: String,
    pub date_format: String,
    pub time_format: String,
    pub key_prefix_format: String,
    pub delimiter: char,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            first_extract_date: NaiveDate::from_ymd_opt(2022, 1, 3)
                .unwrap_or(NaiveDate::MIN),
            columns: [
                "ISIN",
                "Date",
                "Time",
                "StartPrice",
                "MaxPrice",
                "MinPrice",
                "EndPrice",
                "TradedVolume",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            col_date: "Date".to_string(),
            col_isin: "ISIN".to_string(),
            col_time: "Time".to_string(),
            col_start_price: "StartPrice".to_string(),
            col_min_price: "MinPrice".to_string(),
            col_max_price: "MaxPrice".to_string(),
            col_traded_vol: "TradedVolume".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            time_format: "%H:%M".to_string(),
            key_prefix_format: "%Y-%m-%d/".to_string(),
            delimiter: ',',
        }
    }
}

impl SourceConfig {
    pub fn key_prefix(&self, date: NaiveDate) -> String {
        date.format(&self.key_prefix_format).to_string()
    }

    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match u8::try_from(self.delimiter) {
            Ok(byte) if byte.is_ascii() => Ok(byte),
            _ => Err(ConfigError::Invalid(format!(
                "source delimiter '{}' must be ASCII",
                self.delimiter
            ))),
        }
    }

    fn required_columns(&self) -> [&str; 7] {
        [
            self.col_isin.as_str(),
            self.col_date.as_str(),
            self.col_time.as_str(),
            self.col_start_price.as_str(),
            self.col_min_price.as_str(),
            self.col_max_price.as_str(),
            self.col_traded_vol.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub col_isin: String,
    pub col_date: String,
    pub col_opening_price: String,
    pub col_closing_price: String,
    pub col_min_price: String,
    pub col_max_price: String,
    pub col_traded_vol: String,
    pub col_change_prev_close: String,
    pub key_prefix: String,
    pub key_date_format: String,
    pub key_extension: String,
    pub date_format: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            col_isin: "isin".to_string(),
            col_date: "date".to_string(),
            col_opening_price: "opening_price_eur".to_string(),
            col_closing_price: "closing_price_eur".to_string(),
            col_min_price: "minimum_price_eur".to_string(),
            col_max_price: "maximum_price_eur".to_string(),
            col_traded_vol: "daily_traded_volume".to_string(),
            col_change_prev_close: "change_prev_closing_%".to_string(),
            key_prefix: "report1/xetra_daily_report1_".to_string(),
            key_date_format: "%Y%m%d_%H%M%S".to_string(),
            key_extension: "csv".to_string(),
            date_format: "%Y-%m-%d".to_string(),
        }
    }
}

impl TargetConfig {
    pub fn columns(&self) -> [&str; 8] {
        [
            self.col_isin.as_str(),
            self.col_date.as_str(),
            self.col_opening_price.as_str(),
            self.col_closing_price.as_str(),
            self.col_min_price.as_str(),
            self.col_max_price.as_str(),
            self.col_traded_vol.as_str(),
            self.col_change_prev_close.as_str(),
        ]
    }

    pub fn report_key<T: chrono::TimeZone>(&self, run_at: &chrono::DateTime<T>) -> String
    where
        T::Offset: std::fmt::Display,
    {
        format!(
            "{}{}.{}",
            self.key_prefix,
            run_at.format(&self.key_date_format),
            self.key_extension
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub meta_key: String,
    pub timezone: String,
    pub source: SourceConfig,
    pub target: TargetConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("data/xetra/source"),
            target_root: PathBuf::from("data/xetra/target"),
            meta_key: DEFAULT_META_KEY.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            source: SourceConfig::default(),
            target: TargetConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
    #[error("unknown time zone: {0}")]
    InvalidTimeZone(String),
    #[error("source column '{0}' is not listed in source columns")]
    MissingSourceColumn(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl JobConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimeZone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;

        for column in self.source.required_columns() {
            if !self.source.columns.iter().any(|listed| listed == column) {
                return Err(ConfigError::MissingSourceColumn(column.to_string()));
            }
        }
        self.source.delimiter_byte()?;
        if self.target.key_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target key_prefix must not be empty".to_string(),
            ));
        }
        if self.meta_key.trim().is_empty() {
            return Err(ConfigError::Invalid("meta_key must not be empty".to_string()));
        }
        if self.target.key_prefix.starts_with(&self.meta_key) {
            return Err(ConfigError::Invalid(
                "target key_prefix must not collide with meta_key".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn job_config_from_env() -> Result<JobConfig, ConfigError> {
    let mut config = match non_empty_var("XETRA_CONFIG") {
        Some(path) => JobConfig::from_json_file(Path::new(&path))?,
        None => JobConfig::default(),
    };

    if let Some(root) = non_empty_var("XETRA_SOURCE_ROOT") {
        config.source_root = PathBuf::from(root);
    }
    if let Some(root) = non_empty_var("XETRA_TARGET_ROOT") {
        config.target_root = PathBuf::from(root);
    }
    if let Some(key) = non_empty_var("XETRA_META_KEY") {
        config.meta_key = key;
    }
    if let Some(timezone) = non_empty_var("XETRA_TIMEZONE") {
        config.timezone = timezone;
    }
    if let Some(raw) = non_empty_var("XETRA_FIRST_EXTRACT_DATE") {
        config.source.first_extract_date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| ConfigError::InvalidEnv {
                var: "XETRA_FIRST_EXTRACT_DATE",
                value: raw.clone(),
            })?;
    }

    config.validate()?;
    Ok(config)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Mutex, OnceLock};

    const ENV_VARS: [&str; 6] = [
        "XETRA_CONFIG",
        "XETRA_SOURCE_ROOT",
        "XETRA_TARGET_ROOT",
        "XETRA_META_KEY",
        "XETRA_TIMEZONE",
        "XETRA_FIRST_EXTRACT_DATE",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(&str, Option<String>)> = ENV_VARS
            .iter()
            .map(|key| (*key, env::var(key).ok()))
            .collect();

        for key in ENV_VARS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_describe_xetra_layout() {
        let cfg = JobConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.source.columns.len(), 8);
        assert_eq!(
            cfg.source.key_prefix(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()),
            "2024-03-04/"
        );
        assert_eq!(cfg.target.columns()[7], "change_prev_closing_%");
    }

    #[test]
    fn report_key_uses_prefix_timestamp_and_extension() {
        let target = TargetConfig::default();
        let run_at = chrono::Utc.with_ymd_and_hms(2024, 3, 5, 6, 7, 8).unwrap();
        assert_eq!(
            target.report_key(&run_at),
            "report1/xetra_daily_report1_20240305_060708.csv"
        );
    }

    #[test]
    fn partial_json_is_filled_with_defaults() {
        let cfg: JobConfig = serde_json::from_str(
            r#"{"meta_key":"meta/processed.csv","source":{"first_extract_date":"2024-02-01"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.meta_key, "meta/processed.csv");
        assert_eq!(
            cfg.source.first_extract_date,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
        assert_eq!(cfg.source.col_isin, "ISIN");
        assert_eq!(cfg.target, TargetConfig::default());
    }

    #[test]
    fn validation_rejects_unknown_timezone_and_unlisted_columns() {
        let mut cfg = JobConfig {
            timezone: "Mars/Olympus".to_string(),
            ..JobConfig::default()
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::InvalidTimeZone(_)
        ));

        cfg.timezone = DEFAULT_TIMEZONE.to_string();
        cfg.source.columns.retain(|column| column != "TradedVolume");
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::MissingSourceColumn(column) if column == "TradedVolume"
        ));
    }

    #[test]
    fn non_ascii_delimiter_is_rejected() {
        let source = SourceConfig {
            delimiter: '§',
            ..SourceConfig::default()
        };
        assert!(matches!(
            source.delimiter_byte().unwrap_err(),
            ConfigError::Invalid(_)
        ));

        let cfg = JobConfig {
            source,
            ..JobConfig::default()
        };
        assert!(matches!(cfg.validate().unwrap_err(), ConfigError::Invalid(_)));
        assert_eq!(SourceConfig::default().delimiter_byte().unwrap(), b',');
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, r#"{"source_root":"/from/file","timezone":"UTC"}"#).unwrap();
        let path_text = path.to_string_lossy().to_string();

        let cfg = with_env_vars(
            &[
                ("XETRA_CONFIG", path_text.as_str()),
                ("XETRA_TARGET_ROOT", "/from/env"),
                ("XETRA_FIRST_EXTRACT_DATE", "2024-03-01"),
            ],
            job_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.source_root, PathBuf::from("/from/file"));
        assert_eq!(cfg.target_root, PathBuf::from("/from/env"));
        assert_eq!(cfg.timezone, "UTC");
        assert_eq!(
            cfg.source.first_extract_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn malformed_env_date_is_reported() {
        let err = with_env_vars(
            &[("XETRA_FIRST_EXTRACT_DATE", "03/01/2024")],
            job_config_from_env,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "XETRA_FIRST_EXTRACT_DATE",
                ..
            }
        ));
    }
}
