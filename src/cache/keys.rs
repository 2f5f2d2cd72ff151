//! Response cache key derivation.
//!
//! A key is `{METHOD}.{url hash}.{vary hash}`. Varying header values are
//! folded into the key itself, so a cached entry can never be served to a
//! request whose varying headers differ from the ones it was written for.

use axum::http::{HeaderMap, HeaderName, Method};
use xxhash_rust::xxh3::xxh3_64;

/// Separator between the three key segments.
pub const KEY_DELIMITER: char = '.';

/// Joins `name:value` pairs before hashing. Header values cannot contain it.
const VARY_SEPARATOR: &str = "\n";

/// Fast non-cryptographic hash rendered as fixed-width hex.
pub fn hash_str(value: &str) -> String {
    format!("{:016x}", xxh3_64(value.as_bytes()))
}

/// Ordered list of request headers that change the rendered response.
#[derive(Debug, Clone, Default)]
pub struct VaryHeaders {
    names: Vec<String>,
}

impl VaryHeaders {
    /// Build from configuration, dropping blanks and case-insensitive duplicates
    /// while keeping the first spelling and position.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept: Vec<String> = Vec::new();
        for name in names {
            let trimmed = name.as_ref().trim();
            if trimmed.is_empty()
                || kept
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(trimmed))
            {
                continue;
            }
            kept.push(trimmed.to_string());
        }
        Self { names: kept }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Value for the outbound `Vary` header.
    pub fn header_value(&self) -> String {
        self.names.join(", ")
    }

    /// Concatenate `name:value` for every configured header present on the request.
    pub fn signature(&self, headers: &HeaderMap) -> String {
        let mut parts = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let values: Vec<&str> = headers
                .get_all(&header)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            if values.is_empty() {
                continue;
            }
            parts.push(format!("{name}:{}", values.join(",")));
        }
        parts.join(VARY_SEPARATOR)
    }
}

/// Derives cache keys for requests.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    vary: VaryHeaders,
}

impl KeyDeriver {
    pub fn new(vary: VaryHeaders) -> Self {
        Self { vary }
    }

    pub fn vary(&self) -> &VaryHeaders {
        &self.vary
    }

    /// Pure function of its inputs: identical requests yield identical keys.
    pub fn compute_key(&self, method: &Method, url: &str, headers: &HeaderMap) -> String {
        let signature = self.vary.signature(headers);
        format!(
            "{method}{KEY_DELIMITER}{}{KEY_DELIMITER}{}",
            hash_str(url),
            hash_str(&signature)
        )
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn deriver(names: &[&str]) -> KeyDeriver {
        KeyDeriver::new(VaryHeaders::new(names.iter().copied()))
    }

    #[test]
    fn key_has_documented_shape() {
        let deriver = deriver(&["Accept"]);
        let key = deriver.compute_key(
            &Method::GET,
            "/items?x=1",
            &headers(&[("accept", "text/html")]),
        );

        let expected = format!(
            "GET.{}.{}",
            hash_str("/items?x=1"),
            hash_str("Accept:text/html")
        );
        assert_eq!(key, expected);
    }

    #[test]
    fn varying_header_value_changes_key() {
        let deriver = deriver(&["Accept"]);
        let html = deriver.compute_key(
            &Method::GET,
            "/items?x=1",
            &headers(&[("Accept", "text/html")]),
        );
        let json = deriver.compute_key(
            &Method::GET,
            "/items?x=1",
            &headers(&[("Accept", "application/json")]),
        );
        assert_ne!(html, json);
    }

    #[test]
    fn unlisted_headers_do_not_change_key() {
        let deriver = deriver(&["Accept"]);
        let plain = deriver.compute_key(
            &Method::GET,
            "/items",
            &headers(&[("Accept", "text/html")]),
        );
        let with_extra = deriver.compute_key(
            &Method::GET,
            "/items",
            &headers(&[("Accept", "text/html"), ("User-Agent", "curl/8")]),
        );
        assert_eq!(plain, with_extra);
    }

    #[test]
    fn compute_key_is_deterministic() {
        let deriver = deriver(&["Accept", "HX-Request"]);
        let request_headers = headers(&[("HX-Request", "true"), ("Accept", "text/html")]);
        let first = deriver.compute_key(&Method::GET, "/a", &request_headers);
        let second = deriver.compute_key(&Method::GET, "/a", &request_headers);
        assert_eq!(first, second);
    }

    #[test]
    fn absent_headers_contribute_nothing() {
        let deriver = deriver(&["Accept", "HX-Request"]);
        let key = deriver.compute_key(
            &Method::GET,
            "/a",
            &headers(&[("Accept", "text/html")]),
        );
        assert!(key.ends_with(&hash_str("Accept:text/html")));
    }

    #[test]
    fn values_cannot_bleed_across_headers() {
        let deriver = deriver(&["A", "B"]);
        let split = deriver.compute_key(&Method::GET, "/", &headers(&[("A", "x"), ("B", "y")]));
        let merged = deriver.compute_key(&Method::GET, "/", &headers(&[("A", "xB:y")]));
        assert_ne!(split, merged);
    }

    #[test]
    fn method_and_url_are_part_of_key() {
        let deriver = deriver(&[]);
        let empty = HeaderMap::new();
        assert_ne!(
            deriver.compute_key(&Method::GET, "/a", &empty),
            deriver.compute_key(&Method::HEAD, "/a", &empty)
        );
        assert_ne!(
            deriver.compute_key(&Method::GET, "/a", &empty),
            deriver.compute_key(&Method::GET, "/b", &empty)
        );
    }

    #[test]
    fn vary_list_deduplicates_case_insensitively() {
        let vary = VaryHeaders::new(["Accept", "accept", " ", "HX-Request"]);
        assert_eq!(vary.names(), ["Accept", "HX-Request"]);
        assert_eq!(vary.header_value(), "Accept, HX-Request");
    }
}
