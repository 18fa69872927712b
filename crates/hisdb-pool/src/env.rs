//! Environment placeholder expansion for configuration text.
//!
//! Both `${NAME}` and `$NAME` are recognized. A variable that is not set
//! expands to the empty string, matching shell semantics.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Lookup used to resolve a variable name to its value.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Lookup backed by the process environment.
#[must_use]
pub fn process_env() -> EnvLookup {
    Arc::new(|name| std::env::var(name).ok())
}

/// Expand placeholders in `text` using `lookup` to resolve each name.
pub fn expand_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            lookup(name).unwrap_or_else(|| {
                tracing::warn!(variable = name, "environment variable not set, expanding to empty");
                String::new()
            })
        })
        .into_owned()
}
