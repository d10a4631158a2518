//! Environment variable interpolation for the settings file.
//!
//! Interpolation runs over the raw YAML text before it is parsed, so
//! credentials never have to live in the file itself.
//!
//! - `$VAR` or `${VAR}` substitutes the value, and is an error if unset
//! - `${VAR:-default}` falls back when VAR is unset or empty
//! - `${VAR-default}` falls back only when VAR is unset
//! - `$$` is a literal `$`

use regex::{Captures, Regex};
use snafu::prelude::*;
use std::sync::LazyLock;

use crate::error::{ConfigError, EnvInterpolationSnafu};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("valid placeholder pattern")
});

/// Interpolate variables from the process environment.
///
/// Every unresolved placeholder is reported at once.
pub fn interpolate(input: &str) -> Result<String, ConfigError> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate variables resolved by `lookup`.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut problems = Vec::new();

    let text = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return whole.to_string();
        };
        let name = name.as_str();
        let default = caps.name("default").map(|m| m.as_str());
        let empty_uses_default = caps.name("op").is_some_and(|op| op.as_str() == ":-");

        match (lookup(name), default) {
            (Some(value), _) if value.contains(['\n', '\r']) => {
                problems.push(format!("variable '{name}' contains a line break"));
                whole.to_string()
            }
            (Some(value), Some(default)) if value.is_empty() && empty_uses_default => {
                default.to_string()
            }
            (Some(value), _) => value,
            (None, Some(default)) => default.to_string(),
            (None, None) => {
                problems.push(format!("variable '{name}' is not set"));
                whole.to_string()
            }
        }
    });

    ensure!(
        problems.is_empty(),
        EnvInterpolationSnafu {
            message: problems.join("\n"),
        }
    );
    Ok(text.into_owned())
}
