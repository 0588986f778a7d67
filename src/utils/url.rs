// src/utils/url.rs

//! URL canonicalisation for item identity.

use url::Url;

use crate::error::Result;

/// Reduce a URL to a canonical form so equivalent spellings compare equal.
///
/// Scheme and host are lowercased, default ports and fragments dropped,
/// query pairs sorted and a trailing slash on a non-root path removed.
///
/// # Examples
/// ```
/// use crawl_dedup::utils::url::canonicalize;
///
/// assert_eq!(
///     canonicalize("HTTPS://Example.com:443/a/?b=2&a=1#top").unwrap(),
///     "https://example.com/a?a=1&b=2"
/// );
/// ```
pub fn canonicalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_case_and_port() {
        assert_eq!(
            canonicalize("HTTP://EXAMPLE.com:80/Path").unwrap(),
            "http://example.com/Path"
        );
    }

    #[test]
    fn test_canonicalize_query_order() {
        let a = canonicalize("https://example.com/list?page=2&sort=asc").unwrap();
        let b = canonicalize("https://example.com/list?sort=asc&page=2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonicalize_fragment_and_slash() {
        assert_eq!(
            canonicalize("https://example.com/item/42/#reviews").unwrap(),
            "https://example.com/item/42"
        );
        assert_eq!(
            canonicalize("https://example.com/").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_canonicalize_rejects_garbage() {
        assert!(canonicalize("not a url").is_err());
    }
}
