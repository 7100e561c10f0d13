//! `${NAME}` / `${NAME:default}` expansion inside the raw config document

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("placeholder pattern is valid"));

/// Replace every placeholder with the variable's value
///
/// An unset or empty variable takes the default; with no default it expands
/// to the empty string.
pub fn expand_env(text: &str) -> String {
    expand_with(text, |name| env::var(name).ok())
}

pub(crate) fn expand_with(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let value = lookup(&caps[1]).filter(|v| !v.is_empty());
            match (value, caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => String::new(),
            }
        })
        .into_owned()
}
