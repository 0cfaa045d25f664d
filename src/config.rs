use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "ratelock.toml";

const DEFAULT_MIN_RATE: f64 = 0.1;
const DEFAULT_MAX_RATE: f64 = 5.0;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpeedControlConfig {
    pub default_rate: f64,
    pub remember_last_rate: bool,
    pub min_rate: f64,
    pub max_rate: f64,
    pub apply_to_all_media: bool,
}

impl Default for SpeedControlConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            remember_last_rate: true,
            min_rate: DEFAULT_MIN_RATE,
            max_rate: DEFAULT_MAX_RATE,
            apply_to_all_media: true,
        }
    }
}

impl SpeedControlConfig {
    /// Clamps `rate` into the configured bounds. Non-finite input falls back to
    /// the default rate first.
    pub fn clamp(&self, rate: f64) -> f64 {
        let rate = if rate.is_finite() {
            rate
        } else {
            self.default_rate
        };
        rate.max(self.min_rate).min(self.max_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub show_notifications: bool,
    pub notification_duration_ms: u64,
    pub enable_on_page_load: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            show_notifications: true,
            notification_duration_ms: 1000,
            enable_on_page_load: true,
        }
    }
}

impl UiConfig {
    pub fn notification_duration(&self) -> Duration {
        Duration::from_millis(self.notification_duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ActionSpec {
    #[serde(rename = "set_rate", alias = "setSpeed")]
    SetRate {
        #[serde(alias = "speed")]
        rate: f64,
    },

    #[serde(rename = "adjust_rate", alias = "increaseSpeed")]
    AdjustRate {
        #[serde(alias = "delta")]
        step: f64,
    },

    #[serde(rename = "seek_by", alias = "seekRelative")]
    SeekBy {
        #[serde(alias = "time")]
        seconds: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BindingConfig {
    #[serde(flatten)]
    pub action: ActionSpec,

    /// Overrides `keyboard.default_modifiers` for this key.
    #[serde(default)]
    pub modifiers: Option<Vec<String>>,
}

impl From<ActionSpec> for BindingConfig {
    fn from(action: ActionSpec) -> Self {
        Self {
            action,
            modifiers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub enable_shortcuts: bool,
    pub default_modifiers: Vec<String>,
    pub actions: HashMap<String, BindingConfig>,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        use ActionSpec::*;

        let actions = [
            ("q", SetRate { rate: 1.0 }),
            ("w", SetRate { rate: 1.5 }),
            ("e", SetRate { rate: 2.0 }),
            ("a", AdjustRate { step: -0.5 }),
            ("d", AdjustRate { step: 0.5 }),
            ("z", AdjustRate { step: -0.1 }),
            ("x", AdjustRate { step: 0.1 }),
            ("v", SeekBy { seconds: -2.0 }),
            ("b", SeekBy { seconds: 2.0 }),
            ("g", SeekBy { seconds: -6.0 }),
            ("h", SeekBy { seconds: 6.0 }),
            ("y", SeekBy { seconds: -18.0 }),
            ("u", SeekBy { seconds: 18.0 }),
            ("n", SeekBy { seconds: 80.0 }),
            ("p", SeekBy { seconds: 36000.0 }),
        ]
        .into_iter()
        .map(|(key, action)| (key.to_string(), BindingConfig::from(action)))
        .collect();

        Self {
            enable_shortcuts: true,
            default_modifiers: vec!["alt".to_string()],
            actions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub debug_mode: bool,
    pub auto_apply_to_new_media: bool,
    pub check_interval_ms: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            auto_apply_to_new_media: true,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
        }
    }
}

impl AdvancedConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speed_control: SpeedControlConfig,
    pub ui: UiConfig,
    pub keyboard: KeyboardConfig,
    pub advanced: AdvancedConfig,
}

impl Config {
    pub fn read(file: &mut impl Read) -> anyhow::Result<Self> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read config file")?;

        let config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn read_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = File::open(path).context("Failed to open config file")?;
        Self::read(&mut file)
    }

    /// Reads the config from `path`, or from `ratelock.toml` in the working
    /// directory if it exists. Without either the built-in defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_config = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !default_config.exists() {
                    return Ok(Config::default().sanitized());
                }
                default_config
            }
        };
        let config = Self::read_path(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        Ok(config.sanitized())
    }

    /// Like [`Config::load`], but any failure is logged and replaced by the
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load(path).unwrap_or_else(|err| {
            log::warn!("Using default config: {err:?}");
            Config::default().sanitized()
        })
    }

    /// Repairs values the controller cannot work with.
    pub fn sanitized(mut self) -> Self {
        let speed = &mut self.speed_control;
        if !speed.min_rate.is_finite()
            || !speed.max_rate.is_finite()
            || speed.min_rate <= 0.0
            || speed.min_rate > speed.max_rate
        {
            log::warn!(
                "Invalid rate bounds [{}, {}]; using [{DEFAULT_MIN_RATE}, {DEFAULT_MAX_RATE}]",
                speed.min_rate,
                speed.max_rate
            );
            speed.min_rate = DEFAULT_MIN_RATE;
            speed.max_rate = DEFAULT_MAX_RATE;
        }
        if !speed.default_rate.is_finite() {
            log::warn!("Invalid default rate {}; using 1.0", speed.default_rate);
            speed.default_rate = 1.0;
        }
        speed.default_rate = speed.default_rate.max(speed.min_rate).min(speed.max_rate);

        if self.advanced.check_interval_ms == 0 {
            log::warn!("Check interval must be positive; using {DEFAULT_CHECK_INTERVAL_MS}ms");
            self.advanced.check_interval_ms = DEFAULT_CHECK_INTERVAL_MS;
        }
        self
    }
}
