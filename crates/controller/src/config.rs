//! TOML config file loading and validation, plus environment overrides for
//! deployment details.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::num::NonZeroU32;
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;

use crate::schedule::DailySchedule;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub irrigation: IrrigationSection,
    pub web: WebSection,
    pub fertilizer: Vec<FertilizerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IrrigationSection {
    /// Node under which the pump, schedule and mode keys live.
    pub root: String,
    pub pump_key: String,
    pub schedule_key: String,
    pub mode_key: String,
    pub daily_targets: Vec<String>,
    pub default_duration_min: u32,
    /// Site offset, e.g. `"+07:00"`.
    pub utc_offset: String,
    pub poll_interval_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FertilizerEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub dry_alert_threshold: f64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: "https://simosachi-kambing-default-rtdb.firebaseio.com".to_string(),
            auth_token: None,
            timeout_sec: 10,
        }
    }
}

impl Default for IrrigationSection {
    fn default() -> Self {
        Self {
            root: "PompaPenyiramanAir".to_string(),
            pump_key: "pompa".to_string(),
            schedule_key: "WaktuPenyiraman".to_string(),
            mode_key: "Mode".to_string(),
            daily_targets: vec!["07:00".into(), "12:00".into(), "17:00".into()],
            default_duration_min: 1,
            utc_offset: "+07:00".to_string(),
            poll_interval_sec: 60,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Channels used when the config file lists none.
pub fn default_fertilizer_channels() -> Vec<FertilizerEntry> {
    vec![
        FertilizerEntry {
            id: "sapi".to_string(),
            name: "Pupuk Sapi".to_string(),
            path: "pupukData/pupukSapi".to_string(),
            dry_alert_threshold: 50.0,
        },
        FertilizerEntry {
            id: "sacha-inchi".to_string(),
            name: "Pupuk Sacha Inchi".to_string(),
            path: "pupuk/pupukSachaInchi".to_string(),
            dry_alert_threshold: 70.0,
        },
    ]
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl StoreSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl IrrigationSection {
    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.root.trim_matches('/'), key)
    }

    pub fn pump_path(&self) -> String {
        self.path(&self.pump_key)
    }

    pub fn schedule_path(&self) -> String {
        self.path(&self.schedule_key)
    }

    pub fn mode_path(&self) -> String {
        self.path(&self.mode_key)
    }

    pub fn schedule(&self) -> Result<DailySchedule> {
        DailySchedule::parse(&self.daily_targets).context("irrigation.daily_targets")
    }

    pub fn offset(&self) -> Result<UtcOffset> {
        UtcOffset::parse(
            &self.utc_offset,
            format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
        )
        .with_context(|| format!("irrigation.utc_offset '{}'", self.utc_offset))
    }

    pub fn default_duration(&self) -> Result<NonZeroU32> {
        NonZeroU32::new(self.default_duration_min)
            .context("irrigation.default_duration_min must be positive")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_store(&mut errors);
        self.validate_irrigation(&mut errors);
        self.validate_fertilizer(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_store(&self, errors: &mut Vec<String>) {
        let url = self.store.base_url.trim();
        if url.is_empty() {
            errors.push("store: base_url is empty".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!("store: base_url '{url}' must start with http:// or https://"));
        }
        if self.store.timeout_sec == 0 {
            errors.push("store: timeout_sec must be positive".to_string());
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let irr = &self.irrigation;

        for (name, key) in [
            ("pump_key", &irr.pump_key),
            ("schedule_key", &irr.schedule_key),
            ("mode_key", &irr.mode_key),
        ] {
            if key.trim().is_empty() {
                errors.push(format!("irrigation: {name} is empty"));
            }
        }

        if let Err(e) = irr.schedule() {
            errors.push(format!("irrigation: {:#}", e));
        }
        if irr.default_duration_min == 0 {
            errors.push("irrigation: default_duration_min must be positive, got 0".to_string());
        }
        if irr.offset().is_err() {
            errors.push(format!(
                "irrigation: utc_offset '{}' is not of the form +HH:MM",
                irr.utc_offset
            ));
        }
        if irr.poll_interval_sec == 0 {
            errors.push("irrigation: poll_interval_sec must be positive, got 0".to_string());
        }
    }

    fn validate_fertilizer(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, f) in self.fertilizer.iter().enumerate() {
            let ctx = || {
                if f.id.is_empty() {
                    format!("fertilizer[{i}]")
                } else {
                    format!("fertilizer '{}'", f.id)
                }
            };

            if f.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&f.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if f.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if f.path.trim_matches('/').is_empty() {
                errors.push(format!("{}: path is empty", ctx()));
            }
            if !(0.0..=100.0).contains(&f.dry_alert_threshold) {
                errors.push(format!(
                    "{}: dry_alert_threshold {} out of range [0, 100]",
                    ctx(),
                    f.dry_alert_threshold
                ));
            }
        }
    }

    /// Apply `STORE_URL`, `STORE_AUTH` and `WEB_PORT` if set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("STORE_URL") {
            self.store.base_url = url;
        }
        if let Ok(token) = env::var("STORE_AUTH") {
            self.store.auth_token = Some(token);
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// "all defaults".
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "config file not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };

    if config.fertilizer.is_empty() {
        config.fertilizer = default_fertilizer_channels();
    }
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        store = %config.store.base_url,
        targets = ?config.irrigation.daily_targets,
        fertilizer_channels = config.fertilizer.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
