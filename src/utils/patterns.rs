//! Pattern rules matched against package names.
//!
//! Every rule kind (manifest spec rules, final-stage image overrides, module
//! file templates) follows the same semantics: a pattern matches a package
//! when it matches at the start of the package string, rules are evaluated in
//! configured order and the first rule matching any package wins.

use regex::Regex;

/// Compiles `pattern` so that it only matches at the start of the input.
pub fn prefix_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

/// Returns true if `pattern` matches the start of any of `names`.
///
/// An invalid pattern never matches; patterns are validated when settings
/// are loaded.
pub fn matches_any<S: AsRef<str>>(pattern: &str, names: &[S]) -> bool {
    match prefix_regex(pattern) {
        Ok(regex) => names.iter().any(|name| regex.is_match(name.as_ref())),
        Err(_) => false,
    }
}

/// Returns the first rule whose pattern matches any of `names`.
pub fn first_match<'a, T, S, F>(rules: &'a [T], names: &[S], pattern_of: F) -> Option<&'a T>
where
    S: AsRef<str>,
    F: Fn(&T) -> &str,
{
    rules
        .iter()
        .find(|rule| matches_any(pattern_of(rule), names))
}
