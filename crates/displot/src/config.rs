//! Display setup configuration.

use crate::slot::Slot;

/// Placeholder replaced by the allocated display number.
pub const DISPLAY_NUMBER_MACRO: &str = "$DISPLAY_NUMBER";

/// Used when no command is configured.
pub const DEFAULT_COMMAND: &str = "vncserver :$DISPLAY_NUMBER -localhost -nolisten tcp";

/// Host label that opts a host out of display setup.
pub const NO_DISPLAY_LABEL: &str = "noxvnc";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("minimum display number {min} is greater than maximum {max}")]
    InvalidRange { min: Slot, max: Slot },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Server command line; `None` uses [`DEFAULT_COMMAND`].
    pub command: Option<String>,
    pub min_display: Slot,
    pub max_display: Slot,
    /// Extra launch attempts after the first failure.
    pub retries: u32,
    pub skip_on_windows: bool,
    /// Kill stale servers and remove X lock files the first time a host is used.
    pub clean_up: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            command: None,
            min_display: 10,
            max_display: 99,
            retries: 10,
            skip_on_windows: true,
            clean_up: false,
        }
    }
}

impl DisplayConfig {
    /// Defaults overridden by `DISPLOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(command) = lookup("DISPLOT_COMMAND") {
            config = config.with_command(command);
        }
        if let Some(v) = lookup("DISPLOT_MIN_DISPLAY") {
            config.min_display = parse_number("DISPLOT_MIN_DISPLAY", &v)?;
        }
        if let Some(v) = lookup("DISPLOT_MAX_DISPLAY") {
            config.max_display = parse_number("DISPLOT_MAX_DISPLAY", &v)?;
        }
        if let Some(v) = lookup("DISPLOT_RETRIES") {
            config.retries = parse_number("DISPLOT_RETRIES", &v)?;
        }
        if let Some(v) = lookup("DISPLOT_SKIP_ON_WINDOWS") {
            config.skip_on_windows = parse_bool("DISPLOT_SKIP_ON_WINDOWS", &v)?;
        }
        if let Some(v) = lookup("DISPLOT_CLEAN_UP") {
            config.clean_up = parse_bool("DISPLOT_CLEAN_UP", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_display > self.max_display {
            return Err(ConfigError::InvalidRange {
                min: self.min_display,
                max: self.max_display,
            });
        }
        Ok(())
    }

    /// The command line to run, falling back to [`DEFAULT_COMMAND`].
    pub fn command_line(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    /// Blank commands reset to the default.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.command = if command.trim().is_empty() {
            None
        } else {
            Some(command)
        };
        self
    }

    pub fn with_range(mut self, min: Slot, max: Slot) -> Self {
        self.min_display = min;
        self.max_display = max;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_skip_on_windows(mut self, skip: bool) -> Self {
        self.skip_on_windows = skip;
        self
    }

    pub fn with_clean_up(mut self, clean_up: bool) -> Self {
        self.clean_up = clean_up;
        self
    }
}

/// Result of checking a user-supplied command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCheck {
    Ok,
    /// Every build would get the same display; concurrent builds will collide.
    MissingDisplayNumber,
}

pub fn check_command_line(value: &str) -> CommandCheck {
    if value.trim().is_empty() || value.contains(DISPLAY_NUMBER_MACRO) {
        CommandCheck::Ok
    } else {
        CommandCheck::MissingDisplayNumber
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
