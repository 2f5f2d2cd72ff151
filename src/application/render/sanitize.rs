//! Allowlist sanitiser for secure renders and context validation.

use std::collections::{HashMap, HashSet};

use ammonia::Builder as AmmoniaBuilder;

/// Tags whose content is dropped together with the tag and which can never
/// be allowed.
const FORBIDDEN_TAGS: [&str; 2] = ["script", "style"];

#[derive(Debug, Clone)]
pub struct SecurePolicy {
    tags: HashSet<String>,
    attributes: HashSet<String>,
}

impl SecurePolicy {
    pub fn new<T, A>(tags: T, attributes: A) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        let tags = tags
            .into_iter()
            .map(|tag| tag.as_ref().trim().to_ascii_lowercase())
            .filter(|tag| !tag.is_empty() && !FORBIDDEN_TAGS.contains(&tag.as_str()))
            .collect();
        let attributes = attributes
            .into_iter()
            .map(|attr| attr.as_ref().trim().to_ascii_lowercase())
            .filter(|attr| !attr.is_empty() && !attr.starts_with("on"))
            .collect();
        Self { tags, attributes }
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tags.contains(&tag.to_ascii_lowercase())
    }

    /// Clean `html` down to the allowed tags and attributes.
    pub fn clean(&self, html: &str) -> String {
        self.builder().clean(html).to_string()
    }

    /// `value` cleaned to the allowlists, or `None` when it holds nothing
    /// tag-like and can be escaped as ordinary text.
    pub fn markup(&self, value: &str) -> Option<String> {
        looks_like_markup(value).then(|| self.clean(value))
    }

    /// The sanitised form of `value` when sanitising would change it.
    /// Text without anything tag-like is never considered suspicious.
    pub fn suspicious(&self, value: &str) -> Option<String> {
        self.markup(value).filter(|cleaned| cleaned != value)
    }

    fn builder(&self) -> AmmoniaBuilder<'_> {
        let mut builder = AmmoniaBuilder::default();
        builder.tags(self.tags.iter().map(String::as_str).collect());
        builder.generic_attributes(self.attributes.iter().map(String::as_str).collect());
        builder.tag_attributes(HashMap::new());
        if self.attributes.contains("rel") {
            builder.link_rel(None);
        }
        builder
    }
}

fn looks_like_markup(value: &str) -> bool {
    value
        .as_bytes()
        .windows(2)
        .any(|pair| pair[0] == b'<' && (pair[1].is_ascii_alphabetic() || b"/!?".contains(&pair[1])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SecurePolicy {
        SecurePolicy::new(["p", "a", "em", "script"], ["href", "class"])
    }

    #[test]
    fn script_is_never_allowed() {
        let policy = policy();
        assert!(!policy.allows_tag("script"));
        let cleaned = policy.clean("<p>hi</p><script>alert(1)</script>");
        assert_eq!(cleaned, "<p>hi</p>");
    }

    #[test]
    fn unknown_attributes_are_removed() {
        let cleaned = policy().clean(r#"<p class="x" style="color:red" onclick="x()">t</p>"#);
        assert_eq!(cleaned, r#"<p class="x">t</p>"#);
    }

    #[test]
    fn disallowed_tags_keep_their_text() {
        let cleaned = policy().clean("<div><em>a</em></div>");
        assert_eq!(cleaned, "<em>a</em>");
    }

    #[test]
    fn plain_text_is_not_suspicious() {
        assert_eq!(policy().suspicious("fish & chips"), None);
        assert_eq!(policy().suspicious("1 < 2"), None);
        assert_eq!(policy().suspicious("<em>fine</em>"), None);
        assert_eq!(
            policy().suspicious("<img src=x onerror=alert(1)>hi"),
            Some("hi".to_string())
        );
    }
}
