use url::Url;

/// Domain reported when a locator cannot be parsed or carries no host.
pub const UNKNOWN_DOMAIN: &str = "unknown";

// Browser-internal pages: tracking them is meaningless and some hosts refuse access.
const INTERNAL_SCHEME_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-search://",
    "chrome-untrusted://",
    "edge://",
    "brave://",
    "opera://",
    "vivaldi://",
    "moz-extension://",
    "devtools://",
    "view-source:",
    "about:",
];

/// Returns the lowercase host of `locator`, or [`UNKNOWN_DOMAIN`].
pub fn extract(locator: &str) -> String {
    let Ok(parsed) = Url::parse(locator.trim()) else {
        return UNKNOWN_DOMAIN.to_string();
    };
    match parsed.host_str() {
        Some(host) if !host.is_empty() => host.trim_end_matches('.').to_lowercase(),
        _ => UNKNOWN_DOMAIN.to_string(),
    }
}

pub fn is_trackable(locator: &str) -> bool {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !INTERNAL_SCHEME_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_returns_lowercase_host() {
        assert_eq!(extract("https://GitHub.com/rust-lang/rust"), "github.com");
        assert_eq!(extract("http://a.example.com:8080/page2?q=1#x"), "a.example.com");
        assert_eq!(extract("https://www.youtube.com./watch"), "www.youtube.com");
    }

    #[test]
    fn extract_fails_soft() {
        assert_eq!(extract("not a url"), UNKNOWN_DOMAIN);
        assert_eq!(extract(""), UNKNOWN_DOMAIN);
        assert_eq!(extract("data:text/plain,hello"), UNKNOWN_DOMAIN);
    }

    #[test]
    fn internal_pages_are_not_trackable() {
        assert!(!is_trackable("chrome://newtab/"));
        assert!(!is_trackable("chrome-extension://abcdef/popup.html"));
        assert!(!is_trackable("about:blank"));
        assert!(!is_trackable("EDGE://settings"));
        assert!(!is_trackable("   "));
    }

    #[test]
    fn regular_pages_are_trackable() {
        assert!(is_trackable("https://github.com"));
        assert!(is_trackable("http://localhost:3000/"));
        // Unparsable locators still open a session under "unknown".
        assert!(is_trackable("garbage"));
    }
}
