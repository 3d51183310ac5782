//! Console preferences persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/ipyconsole/settings.json
//! - Linux: ~/.config/ipyconsole/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\ipyconsole\settings.json

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use kernel_launch::{KernelFlavor, LaunchOptions};
use serde::{Deserialize, Deserializer, Serialize};

/// Banner printed when a console starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BannerStyle {
    /// Python and IPython versions plus flavor notes
    #[default]
    Long,
    /// One line with the versions only
    Short,
}

/// Console color scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    #[default]
    Dark,
    Light,
}

impl ColorScheme {
    /// Name of the IPython `%colors` scheme matching this theme.
    pub fn ipython_colors(&self) -> &'static str {
        match self {
            ColorScheme::Dark => "linux",
            ColorScheme::Light => "lightbg",
        }
    }
}

impl std::fmt::Display for ColorScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorScheme::Dark => write!(f, "dark"),
            ColorScheme::Light => write!(f, "light"),
        }
    }
}

/// Font descriptor handed to views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontSpec {
    pub family: String,
    pub size: u32,
}

impl Default for FontSpec {
    fn default() -> Self {
        Self {
            family: "Monospace".to_string(),
            size: 10,
        }
    }
}

/// All console preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Time without heartbeat replies before the kernel is declared dead
    #[serde(deserialize_with = "deserialize_duration")]
    pub time_to_dead: Duration,

    /// Maximum delay before buffered stdout/stderr reaches the view
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,

    /// Timeout for kernel-method replies
    #[serde(deserialize_with = "deserialize_duration")]
    pub method_timeout: Duration,

    /// Literal prompt that marks debugger input requests
    pub pdb_prompt: String,

    /// Prefix the kernel puts before output of other frontends
    pub other_output_prefix: String,

    /// Send `!`-prefixed lines as Python and bare lines as pdb commands
    pub pdb_use_exclamation_mark: bool,

    pub pdb_history_max: usize,
    pub history_max: usize,

    pub show_elapsed_time: bool,
    pub show_reset_warning: bool,
    pub ask_before_restart: bool,
    pub ask_before_closing: bool,

    pub banner: BannerStyle,
    pub color_scheme: ColorScheme,
    pub plain_font: FontSpec,
    pub rich_font: FontSpec,

    pub default_flavor: KernelFlavor,
    /// Interpreter used for new consoles; `None` means the default python
    pub interpreter: Option<PathBuf>,
    pub launch: LaunchOptions,

    /// Show the hint about installing modules after an ImportError
    pub show_modules_message: bool,
}

/// Accept durations as `{"secs":..,"nanos":..}`, a number of seconds, or a
/// string like `"50ms"` / `"45s"`.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct DurationVisitor;

    impl<'de> de::Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("seconds, a \"<n>ms\"/\"<n>s\" string, or a duration object")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Duration, E> {
            let v = v.trim();
            let parsed = if let Some(ms) = v.strip_suffix("ms") {
                ms.trim().parse::<u64>().map(Duration::from_millis).ok()
            } else if let Some(s) = v.strip_suffix('s') {
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|s| Duration::try_from_secs_f64(s).ok())
            } else {
                v.parse::<f64>()
                    .ok()
                    .and_then(|s| Duration::try_from_secs_f64(s).ok())
            };
            parsed.ok_or_else(|| E::custom(format!("invalid duration: {}", v)))
        }

        fn visit_map<A: de::MapAccess<'de>>(
            self,
            map: A,
        ) -> std::result::Result<Duration, A::Error> {
            Duration::deserialize(de::value::MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            time_to_dead: Duration::from_secs(45),
            flush_interval: Duration::from_millis(50),
            method_timeout: Duration::from_millis(500),
            pdb_prompt: "ipdb> ".to_string(),
            other_output_prefix: String::new(),
            pdb_use_exclamation_mark: false,
            pdb_history_max: 400,
            history_max: 1000,
            show_elapsed_time: false,
            show_reset_warning: true,
            ask_before_restart: true,
            ask_before_closing: false,
            banner: BannerStyle::Long,
            color_scheme: ColorScheme::Dark,
            plain_font: FontSpec::default(),
            rich_font: FontSpec {
                family: "Sans Serif".to_string(),
                size: 10,
            },
            default_flavor: KernelFlavor::Plain,
            interpreter: None,
            launch: LaunchOptions::default(),
            show_modules_message: true,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    crate::config_base_dir().join("settings.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
/// or can't be parsed.
pub fn load_settings() -> ConsoleSettings {
    let path = settings_path();
    if path.exists() {
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| match serde_json::from_str(&s) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("[settings] Ignoring malformed {:?}: {}", path, e);
                    None
                }
            })
            .unwrap_or_default()
    } else {
        ConsoleSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &ConsoleSettings) -> Result<()> {
    let path = settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_settings() {
        let settings = ConsoleSettings::default();
        assert_eq!(settings.time_to_dead, Duration::from_secs(45));
        assert_eq!(settings.flush_interval, Duration::from_millis(50));
        assert_eq!(settings.pdb_prompt, "ipdb> ");
        assert_eq!(settings.pdb_history_max, 400);
        assert!(!settings.show_elapsed_time);
        assert_eq!(settings.color_scheme.ipython_colors(), "linux");
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let json = r#"{"pdb_prompt": "(Pdb) ", "color_scheme": "light"}"#;
        let parsed: ConsoleSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.pdb_prompt, "(Pdb) ");
        assert_eq!(parsed.color_scheme, ColorScheme::Light);
        assert_eq!(parsed.time_to_dead, Duration::from_secs(45));
        assert_eq!(parsed.default_flavor, KernelFlavor::Plain);
    }

    #[test]
    fn test_duration_formats() {
        let json = r#"{"time_to_dead": 10, "flush_interval": "20ms", "method_timeout": 1.5}"#;
        let parsed: ConsoleSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.time_to_dead, Duration::from_secs(10));
        assert_eq!(parsed.flush_interval, Duration::from_millis(20));
        assert_eq!(parsed.method_timeout, Duration::from_millis(1500));

        let json = r#"{"time_to_dead": "3s"}"#;
        let parsed: ConsoleSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.time_to_dead, Duration::from_secs(3));
    }

    #[test]
    fn test_duration_roundtrip_through_serialize() {
        let settings = ConsoleSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: ConsoleSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.method_timeout, settings.method_timeout);
        assert_eq!(parsed.rich_font, settings.rich_font);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let json = r#"{"time_to_dead": -4}"#;
        assert!(serde_json::from_str::<ConsoleSettings>(json).is_err());
    }

    #[test]
    #[serial]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::env::set_var("IPYCONSOLE_CONFIG_DIR", tmp.path());

        let mut settings = ConsoleSettings::default();
        settings.show_elapsed_time = true;
        settings.default_flavor = KernelFlavor::Sympy;
        save_settings(&settings).unwrap();

        let loaded = load_settings();
        assert!(loaded.show_elapsed_time);
        assert_eq!(loaded.default_flavor, KernelFlavor::Sympy);

        std::fs::write(settings_path(), "{not json").unwrap();
        let fallback = load_settings();
        assert!(!fallback.show_elapsed_time);

        std::env::remove_var("IPYCONSOLE_CONFIG_DIR");
    }
}
