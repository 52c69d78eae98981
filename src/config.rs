use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONTEXT: &str = "live.cloud-platform.service.justice.gov.uk";
pub const DEFAULT_APP_NAME: &str = "manage-my-prison";
pub const MANAGED_BY: &str = "mmp-ops";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source: Option<String>,
    pub context: String,
    pub app_name: String,
    pub input_end_delay: Duration,
    pub page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: None,
            context: DEFAULT_CONTEXT.to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            input_end_delay: Duration::from_millis(default_input_end_delay_ms()),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OpsConfigFile {
    #[serde(default)]
    context: Option<String>,
    #[serde(default, alias = "app")]
    app_name: Option<String>,
    #[serde(default)]
    exec: ExecSpec,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

impl Default for OpsConfigFile {
    fn default() -> Self {
        Self {
            context: None,
            app_name: None,
            exec: ExecSpec::default(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExecSpec {
    #[serde(
        default = "default_input_end_delay_ms",
        alias = "input_end_delay",
        alias = "grace_ms"
    )]
    input_end_delay_ms: u64,
}

impl Default for ExecSpec {
    fn default() -> Self {
        Self {
            input_end_delay_ms: default_input_end_delay_ms(),
        }
    }
}

impl Settings {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => discover_config_path(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw, Some(path.display().to_string()))
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    fn parse(raw: &str, source: Option<String>) -> Result<Self> {
        let parsed: OpsConfigFile = if raw.trim().is_empty() {
            OpsConfigFile::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        let defaults = Self::default();

        Ok(Self {
            source,
            context: parsed
                .context
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.context),
            app_name: parsed
                .app_name
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.app_name),
            input_end_delay: Duration::from_millis(parsed.exec.input_end_delay_ms),
            page_size: parsed.page_size.max(1),
        })
    }
}

fn default_input_end_delay_ms() -> u64 {
    1_000
}

fn default_page_size() -> u32 {
    500
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MMP_OPS_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [PathBuf::from("mmp-ops.yaml"), PathBuf::from(".mmp-ops.yaml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let candidate = PathBuf::from(&home).join(".config/mmp-ops/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_APP_NAME, DEFAULT_CONTEXT, Settings};
    use std::time::Duration;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::parse("", None).unwrap();
        assert_eq!(settings, Settings::default());

        let blank = Settings::parse("\n", None).unwrap();
        assert_eq!(blank.page_size, 500);
    }

    #[test]
    fn overrides_are_applied() {
        let raw = "context: staging\napp: reports\nexec:\n  input_end_delay_ms: 250\npage_size: 20\n";
        let settings = Settings::parse(raw, Some("inline".to_string())).unwrap();
        assert_eq!(settings.context, "staging");
        assert_eq!(settings.app_name, "reports");
        assert_eq!(settings.input_end_delay, Duration::from_millis(250));
        assert_eq!(settings.page_size, 20);
        assert_eq!(settings.source.as_deref(), Some("inline"));
    }

    #[test]
    fn blank_values_keep_defaults() {
        let settings = Settings::parse("context: ' '\npage_size: 0\n", None).unwrap();
        assert_eq!(settings.context, DEFAULT_CONTEXT);
        assert_eq!(settings.app_name, DEFAULT_APP_NAME);
        assert_eq!(settings.page_size, 1);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(Settings::parse("exec: [", None).is_err());
    }
}
