use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to write settings file {0}: {1}")]
    Write(String, std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown preset '{0}', expected 'standard' or 'relaxed'")]
    UnknownPreset(String),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every tunable of the scheduler in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Minimum time between motion samples.
    pub sample_interval_ms: u64,
    /// Side length of the motion grid.
    pub grid_size: u32,
    /// Luminance-difference-to-score multiplier.
    pub sensitivity: f64,
    /// Scores at or above this count as stable (0–100).
    pub stability_threshold: f64,
    /// Unbroken stability needed before locking.
    pub lock_duration_ms: u64,
    /// Minimum time between dispatches.
    pub cooldown_ms: u64,
    /// Unanswered requests are abandoned after this long.
    pub failsafe_timeout_ms: u64,
    /// Width of the frame sent for analysis.
    pub analysis_width: u32,
    pub jpeg_quality: u8,
    pub max_payload_bytes: usize,
    /// Scheduling loop cadence.
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl SchedulerConfig {
    /// Quick lock for handheld use.
    pub fn standard() -> Self {
        Self {
            sample_interval_ms: 100,
            grid_size: 32,
            sensitivity: 4.0,
            stability_threshold: 75.0,
            lock_duration_ms: 300,
            cooldown_ms: 1500,
            failsafe_timeout_ms: 8000,
            analysis_width: 1024,
            jpeg_quality: 75,
            max_payload_bytes: 512 * 1024,
            tick_interval_ms: 16,
        }
    }

    /// Tolerates more jitter but waits longer and fires less often.
    pub fn relaxed() -> Self {
        Self {
            sensitivity: 2.5,
            stability_threshold: 70.0,
            lock_duration_ms: 500,
            cooldown_ms: 3000,
            analysis_width: 768,
            ..Self::standard()
        }
    }

    pub fn preset(name: &str) -> Result<Self, SettingsError> {
        match name.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::standard()),
            "relaxed" => Ok(Self::relaxed()),
            other => Err(SettingsError::UnknownPreset(other.to_string())),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn failsafe_timeout(&self) -> Duration {
        Duration::from_millis(self.failsafe_timeout_ms)
    }

    /// Hard limit on a single provider call. An abandoned request may still
    /// answer late until this elapses.
    pub fn request_timeout(&self) -> Duration {
        self.failsafe_timeout().saturating_mul(2)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
            SettingsError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.sample_interval_ms == 0 {
            return Err(invalid("sampleIntervalMs", "must be greater than zero"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tickIntervalMs", "must be greater than zero"));
        }
        if self.grid_size == 0 {
            return Err(invalid("gridSize", "must be greater than zero"));
        }
        if !(self.sensitivity > 0.0) {
            return Err(invalid("sensitivity", "must be positive"));
        }
        if !(self.stability_threshold > 0.0 && self.stability_threshold <= 100.0) {
            return Err(invalid("stabilityThreshold", "must be in (0, 100]"));
        }
        if self.failsafe_timeout_ms == 0 {
            return Err(invalid("failsafeTimeoutMs", "must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid("jpegQuality", "must be in 1..=100"));
        }
        if self.analysis_width == 0 {
            return Err(invalid("analysisWidth", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Per-field overrides applied on top of a preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failsafe_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_payload_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
}

impl SchedulerOverrides {
    fn apply(&self, mut base: SchedulerConfig) -> SchedulerConfig {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { base.$field = v; })*
            };
        }
        take!(
            sample_interval_ms,
            grid_size,
            sensitivity,
            stability_threshold,
            lock_duration_ms,
            cooldown_ms,
            failsafe_timeout_ms,
            analysis_width,
            jpeg_quality,
            max_payload_bytes,
            tick_interval_ms
        );
        base
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vision_deployment")]
    pub vision_deployment: String,
    #[serde(default)]
    pub use_bearer: bool,
    #[serde(default = "default_vision_prompt")]
    pub vision_prompt: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub scheduler: SchedulerOverrides,
}

fn default_vision_deployment() -> String {
    "gpt-4o".into()
}

fn default_vision_prompt() -> String {
    "You are looking through a steadied handheld camera. Describe hazards and anything that \
     needs the operator's attention. Be specific and brief."
        .into()
}

fn default_preset() -> String {
    "standard".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            vision_deployment: default_vision_deployment(),
            use_bearer: false,
            vision_prompt: default_vision_prompt(),
            preset: default_preset(),
            scheduler: SchedulerOverrides::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| SettingsError::Read(path.display().to_string(), e))?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| SettingsError::Write(path.display().to_string(), e))?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// True when an inference endpoint is configured.
    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    /// The preset named by `preset` with `[scheduler]` overrides applied.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, SettingsError> {
        let config = self.scheduler.apply(SchedulerConfig::preset(&self.preset)?);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.has_endpoint() {
            url::Url::parse(&self.endpoint).map_err(|e| SettingsError::Invalid {
                field: "endpoint",
                reason: e.to_string(),
            })?;
        }
        self.scheduler_config().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_standard_preset() {
        let settings = Settings::default();
        assert_eq!(settings.scheduler_config().unwrap(), SchedulerConfig::standard());
        assert!(!settings.has_endpoint());
    }

    #[test]
    fn standard_preset_matches_reference_values() {
        let c = SchedulerConfig::standard();
        assert_eq!(c.sample_interval(), Duration::from_millis(100));
        assert_eq!(c.grid_size, 32);
        assert_eq!(c.sensitivity, 4.0);
        assert_eq!(c.stability_threshold, 75.0);
        assert_eq!(c.lock_duration(), Duration::from_millis(300));
        assert_eq!(c.cooldown(), Duration::from_millis(1500));
        assert_eq!(c.failsafe_timeout(), Duration::from_millis(8000));
        assert_eq!(c.request_timeout(), Duration::from_millis(16_000));
    }

    #[test]
    fn relaxed_preset_differs_only_in_tuning() {
        let s = SchedulerConfig::standard();
        let r = SchedulerConfig::relaxed();
        assert!(r.sensitivity < s.sensitivity);
        assert!(r.lock_duration_ms > s.lock_duration_ms);
        assert!(r.cooldown_ms > s.cooldown_ms);
        assert_eq!(r.failsafe_timeout_ms, s.failsafe_timeout_ms);
        assert_eq!(r.grid_size, s.grid_size);
    }

    #[test]
    fn overrides_apply_on_top_of_preset() {
        let toml_src = r#"
            endpoint = "https://steady.openai.azure.com"
            preset = "relaxed"

            [scheduler]
            cooldownMs = 5000
            gridSize = 16
        "#;
        let settings: Settings = toml::from_str(toml_src).unwrap();
        let config = settings.scheduler_config().unwrap();
        assert_eq!(config.cooldown_ms, 5000);
        assert_eq!(config.grid_size, 16);
        assert_eq!(config.lock_duration_ms, SchedulerConfig::relaxed().lock_duration_ms);
        assert_eq!(settings.vision_deployment, "gpt-4o");
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let settings = Settings {
            preset: "turbo".into(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.scheduler_config(),
            Err(SettingsError::UnknownPreset(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut c = SchedulerConfig::standard();
        c.stability_threshold = 120.0;
        assert!(matches!(
            c.validate(),
            Err(SettingsError::Invalid { field: "stabilityThreshold", .. })
        ));

        let mut c = SchedulerConfig::standard();
        c.sensitivity = 0.0;
        assert!(c.validate().is_err());

        let mut c = SchedulerConfig::standard();
        c.jpeg_quality = 0;
        assert!(c.validate().is_err());

        let mut c = SchedulerConfig::standard();
        c.grid_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let settings = Settings {
            endpoint: "not a url".into(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { field: "endpoint", .. })
        ));
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let path = std::env::temp_dir().join(format!("steadylock-settings-{}.toml", std::process::id()));
        let mut settings = Settings::default();
        settings.preset = "relaxed".into();
        settings.scheduler.failsafe_timeout_ms = Some(12_000);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.scheduler_config().unwrap().failsafe_timeout_ms, 12_000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("steadylock-definitely-missing.toml");
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }
}
