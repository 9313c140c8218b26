//! URL shape validation for script results
//!
//! A script is only considered successful when it settles with a string that
//! looks like a fetchable URL. The check is a single compiled regular
//! expression — no parsing, no DNS, no network. It accepts `http`, `https`,
//! `ftp` and `ftps` schemes with a dotted domain, `localhost`, a dotted-quad
//! IPv4 address, or a hex-and-colon IPv6 address, plus an optional port and
//! path.

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the full set of URL shapes a script may resolve to.
///
/// Host alternatives, in order: dotted domain labels ending in a TLD of two
/// or more letters (trailing dot allowed), a bare `localhost`, dotted-quad
/// IPv4, or an IPv6 group (brackets optional). Ports and paths are optional;
/// whitespace anywhere in the path is rejected.
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^(?:http|ftp)s?://",
        r"(?:(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+(?:[A-Z]{2,6}\.?|[A-Z0-9-]{2,}\.?)",
        r"|localhost",
        r"|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
        r"|\[?[A-F0-9]*:[A-F0-9:]+\]?)",
        r"(?::\d+)?",
        r"(?:/?|[/?]\S+)$",
    ))
    .unwrap()
});

/// Check whether `candidate` is a URL the pipeline is willing to fetch or
/// redirect to. Empty input is invalid.
pub fn is_valid_url(candidate: &str) -> bool {
    !candidate.is_empty() && URL_RE.is_match(candidate)
}
