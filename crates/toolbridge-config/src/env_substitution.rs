use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

// ${VAR} placeholders, identifier rules as for shell variables
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex pattern")
});

/// Substitute every `${VAR}` placeholder with the value of `VAR` in the
/// current process environment. Unset variables become the empty string;
/// text outside placeholders is kept verbatim.
pub fn substitute_placeholders(input: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &Captures| env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}
