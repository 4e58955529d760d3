use semver::Version;
use thiserror::Error;

/// Version assigned to an image path with no usable tags.
pub const INITIAL_VERSION: &str = "1.0";

/// A registry tag that is not a `MAJOR.MINOR` version.
#[derive(Debug, Error)]
#[error("Unparseable version tag '{tag}': {reason}")]
pub struct VersionParseError {
    pub tag: String,
    pub reason: String,
}

/// Returns true if `tag` has the form `<digits>.<digits>`.
pub fn is_version_tag(tag: &str) -> bool {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match tag.split_once('.') {
        Some((major, minor)) => digits(major) && digits(minor),
        None => false,
    }
}

/// Parses a `MAJOR.MINOR` tag.
///
/// # Errors
/// Returns `VersionParseError` if the components do not fit a version number.
pub fn parse_tag(tag: &str) -> Result<Version, VersionParseError> {
    Version::parse(&format!("{}.0", tag)).map_err(|e| VersionParseError {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Computes the version that follows the newest `MAJOR.MINOR` tag.
///
/// Tags that do not match the pattern are ignored; matching tags that still
/// fail to parse count as `0.0`. The newest version gets a major bump, so
/// `{"1.0", "1.5"}` yields `"2.0"`. Without matching tags the result is `"1.0"`.
pub fn next_version<S: AsRef<str>>(tags: &[S]) -> String {
    let latest = tags
        .iter()
        .map(AsRef::as_ref)
        .filter(|tag| is_version_tag(tag))
        .map(|tag| {
            parse_tag(tag).unwrap_or_else(|e| {
                tracing::debug!("{}; treating as 0.0", e);
                Version::new(0, 0, 0)
            })
        })
        .max();

    match latest {
        Some(latest) => {
            let next = Version::new(latest.major.saturating_add(1), 0, 0);
            format!("{}.{}", next.major, next.minor)
        }
        None => INITIAL_VERSION.to_string(),
    }
}
