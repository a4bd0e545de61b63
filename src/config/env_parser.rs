//! Environment variable parsing utilities for configuration.

use crate::errors::Error;
use std::path::PathBuf;
use std::str::FromStr;

use super::paths;

/// Parse environment variable value or return error if empty/whitespace.
pub fn parse_env_string(name: &str, value: &str) -> Result<String, Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    Ok(value.to_string())
}

/// Parse environment variable as a path, expanding tilde.
pub fn parse_env_path(name: &str, value: &str) -> Result<PathBuf, Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    Ok(paths::expand_tilde_path(&PathBuf::from(value)))
}

/// Parse environment variable as any `FromStr` value (numbers, backends).
/// Range checks happen later in validation.
pub fn parse_env_value<T>(name: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {name} value: {e}")))
}

/// Parse environment variable as a boolean: true/false, 1/0, yes/no, on/off.
pub fn parse_env_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        "" => Err(Error::Config(format!("{name} cannot be empty"))),
        other => Err(Error::Config(format!(
            "Invalid {name} value: '{other}' is not a boolean"
        ))),
    }
}

/// Read `name` from the environment and, if set, store its parsed value.
pub fn apply_override<T>(
    name: &str,
    target: &mut T,
    parse: impl FnOnce(&str, &str) -> Result<T, Error>,
) -> Result<(), Error> {
    if let Ok(val) = std::env::var(name) {
        *target = parse(name, &val)?;
    }
    Ok(())
}
