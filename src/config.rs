// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use tracing::{info, warn};

use crate::{mode::Mode, output::Output};

/// Runtime configuration, read once at startup.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The color outputs are cleared to every frame.
    pub clear_color: [f32; 4],
    /// Per-connector settings, keyed by connector name.
    pub outputs: HashMap<String, OutputConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            outputs: HashMap::new(),
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Whether the output should be activated at all.
    pub enabled: bool,
    /// The mode to activate the output with instead of the monitor's preferred one.
    pub mode: Option<ModeSpec>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: None,
        }
    }
}

/// A mode as written in the config: `"1920x1080"`, `"1920x1080@60"`, or a mode name.
#[derive(serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String")]
pub enum ModeSpec {
    Size {
        width: u32,
        height: u32,
        refresh: Option<u32>,
    },
    Name(String),
}

impl FromStr for ModeSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_size = || -> Option<ModeSpec> {
            let (size, refresh) = match s.split_once('@') {
                Some((size, refresh)) => (size, Some(refresh.trim().parse().ok()?)),
                None => (s, None),
            };
            let (width, height) = size.split_once('x')?;
            Some(ModeSpec::Size {
                width: width.trim().parse().ok()?,
                height: height.trim().parse().ok()?,
                refresh,
            })
        };

        Ok(parse_size().unwrap_or_else(|| ModeSpec::Name(s.to_string())))
    }
}

impl From<String> for ModeSpec {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(spec) => spec,
            Err(never) => match never {},
        }
    }
}

impl ModeSpec {
    pub fn matches(&self, mode: &Mode) -> bool {
        match self {
            ModeSpec::Size {
                width,
                height,
                refresh,
            } => {
                mode.size() == (*width, *height)
                    && refresh.is_none_or(|refresh| refresh == mode.refresh())
            }
            ModeSpec::Name(name) => mode.name() == name,
        }
    }
}

impl OutputConfig {
    /// Pick the configured mode from `output`'s catalog.
    ///
    /// Returns `None` if no mode is configured or the configured one isn't available,
    /// in which case the output's own choice should be used.
    pub fn select_mode(&self, output: &Output) -> Option<Mode> {
        let spec = self.mode.as_ref()?;
        let mode = output.modes().find(|mode| spec.matches(mode));
        if mode.is_none() {
            warn!(
                output = output.name(),
                "Configured mode {spec:?} is not available, using the default"
            );
        }
        mode
    }
}

impl Config {
    /// Settings for the connector called `name`.
    pub fn output(&self, name: &str) -> OutputConfig {
        self.outputs.get(name).cloned().unwrap_or_default()
    }

    /// Load the config at `path`, or at the default location if `None`.
    ///
    /// A missing default config is not an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => {
                    info!("No config file found, using defaults");
                    return Ok(Config::default());
                }
            },
        };

        info!("Loading config from {}", path.display());
        let config = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::parse(&config)
    }

    pub fn parse(config: &str) -> anyhow::Result<Self> {
        toml::from_str(config).context("Failed to deserialize toml")
    }
}

/// `$XDG_CONFIG_HOME/kmscomp/config.toml`, if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix("kmscomp").find_config_file("config.toml")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn mode_spec_parses_sizes_and_names() {
        assert_eq!(
            "1280x720".parse::<ModeSpec>().unwrap(),
            ModeSpec::Size {
                width: 1280,
                height: 720,
                refresh: None
            }
        );
        assert_eq!(
            "1920x1080@144".parse::<ModeSpec>().unwrap(),
            ModeSpec::Size {
                width: 1920,
                height: 1080,
                refresh: Some(144)
            }
        );
        assert_eq!(
            "1920x1080i".parse::<ModeSpec>().unwrap(),
            ModeSpec::Name("1920x1080i".into())
        );
    }

    #[test]
    fn empty_config_is_default() -> anyhow::Result<()> {
        assert_eq!(Config::parse("")?, Config::default());
        Ok(())
    }

    #[test]
    fn output_sections_parse() -> anyhow::Result<()> {
        let config = Config::parse(
            r#"
            clear_color = [0.5, 0.5, 0.5, 1.0]

            [outputs."HDMI-A-1"]
            mode = "1280x720"

            [outputs.DP-1]
            enabled = false
            "#,
        )?;

        assert_eq!(config.clear_color, [0.5, 0.5, 0.5, 1.0]);
        assert_eq!(
            config.output("HDMI-A-1").mode,
            Some(ModeSpec::Size {
                width: 1280,
                height: 720,
                refresh: None
            })
        );
        assert!(!config.output("DP-1").enabled);
        assert_eq!(config.output("eDP-1"), OutputConfig::default());
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("clear_colour = [0.0, 0.0, 0.0, 1.0]").is_err());
    }

    #[test]
    fn load_reads_the_given_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "clear_color = [1.0, 0.0, 0.0, 1.0]")?;

        let config = Config::load(Some(file.path()))?;
        assert_eq!(config.clear_color, [1.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn load_fails_for_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
