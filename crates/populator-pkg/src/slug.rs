//! Identifier-safe slugs derived from arbitrary text.

/// Maximum length of a generated identifier, matching the FHIR id limit.
pub const MAX_ID_LENGTH: usize = 64;

/// Normalize arbitrary text into an identifier-safe slug.
///
/// Lower-cases the input, replaces every character outside `[a-z0-9-]` with
/// `-`, collapses runs of `-`, trims leading and trailing `-`, and truncates
/// to [`MAX_ID_LENGTH`]. Stable across runs for the same input.
#[must_use]
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true; // suppress a leading dash
    for c in text.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(MAX_ID_LENGTH);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_basic() {
        assert_eq!(slug("My CodeSystem v2"), "my-codesystem-v2");
    }

    #[test]
    fn test_slug_charset() {
        let s = slug("Üb€r wéird / input.json");
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_slug_collapses_runs() {
        assert_eq!(slug("a   b---c"), "a-b-c");
    }

    #[test]
    fn test_slug_trims_dashes() {
        assert_eq!(slug("--hello--"), "hello");
        assert_eq!(slug("...x..."), "x");
    }

    #[test]
    fn test_slug_version() {
        assert_eq!(slug("pkg-1.0.3"), "pkg-1-0-3");
    }

    #[test]
    fn test_slug_truncates() {
        let long = "a".repeat(200);
        assert_eq!(slug(&long).len(), MAX_ID_LENGTH);
    }

    #[test]
    fn test_slug_stable() {
        let a = slug("My CodeSystem v2.json");
        let b = slug("My CodeSystem v2.json");
        assert_eq!(a, b);
        assert!(a.len() <= MAX_ID_LENGTH);
    }

    #[test]
    fn test_slug_empty() {
        assert_eq!(slug(""), "");
        assert_eq!(slug("///"), "");
    }
}
