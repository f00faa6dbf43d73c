//! Adapter wide settings.
//!
//! Settings are read once at startup from `$HOME/.config/yadap/config.toml`, then CLI flags
//! override them. A client may adjust them for its session with the `_adapterSettings` request.

use crate::debugger::disasm::ShowDisassembly;
use crate::debugger::expression::EvaluatorKind;
use crate::debugger::variable::FormatOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// What the debug console does with text that is not prefixed.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConsoleMode {
    /// Console input is a backend command, `?expr` evaluates an expression.
    #[default]
    Commands,
    /// Console input is an expression, `/cmd command` runs a backend command.
    Evaluate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub evaluate_timeout_ms: u64,
    pub launch_timeout_ms: u64,
    /// How long attach with `waitFor` looks for a process.
    pub attach_wait_timeout_ms: u64,
    pub attach_poll_interval_ms: u64,
    /// Default evaluator of watch, hover and console expressions.
    pub expressions: EvaluatorKind,
    /// Default evaluator of breakpoint conditions.
    pub condition_expressions: EvaluatorKind,
    /// Number of leading elements in a container summary.
    pub container_preview: usize,
    /// Max length of a rendered string.
    pub string_limit: usize,
    pub show_disassembly: ShowDisassembly,
    pub console_mode: ConsoleMode,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        let format = FormatOptions::default();
        Self {
            evaluate_timeout_ms: 5_000,
            launch_timeout_ms: 30_000,
            attach_wait_timeout_ms: 60_000,
            attach_poll_interval_ms: 100,
            expressions: EvaluatorKind::Simple,
            condition_expressions: EvaluatorKind::Simple,
            container_preview: format.preview_len,
            string_limit: format.string_limit,
            show_disassembly: ShowDisassembly::Auto,
            console_mode: ConsoleMode::Commands,
        }
    }
}

impl AdapterSettings {
    /// Default location of a settings file.
    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".config").join("yadap").join("config.toml"))
    }

    /// Read settings from a file, a missing file means default settings.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            return Ok(Self::default());
        };
        if !path.exists() {
            log::debug!(target: "dap", "no settings file at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse settings file {}", path.display()))
    }

    pub fn evaluate_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluate_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn attach_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_wait_timeout_ms)
    }

    pub fn attach_poll_interval(&self) -> Duration {
        Duration::from_millis(self.attach_poll_interval_ms.max(1))
    }

    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            preview_len: self.container_preview,
            string_limit: self.string_limit,
        }
    }

    /// Apply a partial update with camelCase keys (`{"evaluateTimeoutMs": 100}`).
    pub fn merge_json(&mut self, patch: &Value) -> Result<(), serde_json::Error> {
        let mut current = serde_json::to_value(&*self)?;
        if let (Some(current), Some(patch)) = (current.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                current.insert(snake_case(key), value.clone());
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Read-only adapter settings (set only once, at adapter start).
static SETTINGS: OnceLock<AdapterSettings> = OnceLock::new();

/// Set initial settings.
pub fn set(settings: AdapterSettings) {
    if SETTINGS.set(settings).is_err() {
        log::warn!(target: "dap", "adapter settings are already set");
    }
}

/// Return adapter settings, default ones if settings were never set.
pub fn current() -> &'static AdapterSettings {
    SETTINGS.get_or_init(AdapterSettings::default)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            evaluate_timeout_ms = 250
            expressions = "native"
            show_disassembly = "always"
            "#,
        )
        .unwrap();

        let settings = AdapterSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.evaluate_timeout(), Duration::from_millis(250));
        assert_eq!(settings.expressions, EvaluatorKind::Native);
        assert_eq!(settings.show_disassembly, ShowDisassembly::Always);
        assert_eq!(settings.launch_timeout_ms, AdapterSettings::default().launch_timeout_ms);

        let missing = AdapterSettings::load(Some(&dir.path().join("none.toml"))).unwrap();
        assert_eq!(missing, AdapterSettings::default());

        std::fs::write(&path, "evaluate_timeout_ms = \"soon\"").unwrap();
        assert!(AdapterSettings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_merge_json() {
        let mut settings = AdapterSettings::default();
        settings
            .merge_json(&json!({
                "evaluateTimeoutMs": 10,
                "consoleMode": "evaluate",
                "conditionExpressions": "python",
            }))
            .unwrap();
        assert_eq!(settings.evaluate_timeout_ms, 10);
        assert_eq!(settings.console_mode, ConsoleMode::Evaluate);
        assert_eq!(settings.condition_expressions, EvaluatorKind::Python);

        assert!(settings.merge_json(&json!({"consoleMode": "loud"})).is_err());
        assert_eq!(settings.console_mode, ConsoleMode::Evaluate);
    }
}
