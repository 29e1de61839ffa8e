//! Identifier to request URL normalization.

use url::Url;

/// Why an identifier cannot be fetched over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("empty identifier")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing host: {0}")]
    MissingHost(String),

    #[error("invalid URL: {0}")]
    Invalid(String),
}

/// Turn an image identifier into the URL that is actually requested.
///
/// Surrounding whitespace is trimmed, a missing scheme defaults to
/// `https`, and the fragment is dropped since it never reaches the server.
/// Only `http` and `https` are accepted.
///
/// The cache keys on the identifier as given, not on this URL.
pub fn canonicalize(identifier: &str) -> Result<Url, UrlError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let with_scheme = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };
    let mut url = Url::parse(&with_scheme).map_err(|e| UrlError::Invalid(format!("{trimmed}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::MissingHost(trimmed.to_string()));
    }

    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_image_url() {
        let url = canonicalize("https://img.example.com/a/b.jpg?w=120").unwrap();
        assert_eq!(url.as_str(), "https://img.example.com/a/b.jpg?w=120");
    }

    #[test]
    fn test_canonicalize_defaults_to_https() {
        let url = canonicalize("cdn.example.com/x.png").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/x.png");
    }

    #[test]
    fn test_canonicalize_normalizes_host_and_fragment() {
        let url = canonicalize("  http://CDN.Example.COM/x.png#zoom ").unwrap();
        assert_eq!(url.as_str(), "http://cdn.example.com/x.png");
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert_eq!(canonicalize("file:///etc/hosts"), Err(UrlError::UnsupportedScheme("file".into())));
        assert_eq!(canonicalize("ftp://example.com/a.jpg"), Err(UrlError::UnsupportedScheme("ftp".into())));
    }

    #[test]
    fn test_canonicalize_rejects_empty() {
        assert_eq!(canonicalize(""), Err(UrlError::Empty));
        assert_eq!(canonicalize(" \t"), Err(UrlError::Empty));
    }

    #[test]
    fn test_canonicalize_rejects_garbage() {
        assert!(matches!(canonicalize("https://exa mple.com/"), Err(UrlError::Invalid(_))));
    }
}
