//! Ordered, case-insensitive header map.

/// Header names compare case-insensitively; insertion order is preserved on
/// write. Duplicate names fold with a comma, except `Set-Cookie` which
/// legitimately repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    items: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Add a header, folding into an existing entry of the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        if !name.eq_ignore_ascii_case("set-cookie") {
            if let Some((_, existing)) = self
                .items
                .iter_mut()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
            {
                existing.push_str(", ");
                existing.push_str(value);
                return;
            }
        }
        self.items.push((name.to_owned(), value.to_owned()));
    }

    /// Set a header, replacing any existing entry of the same name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.items
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.items.push((name.to_owned(), value.to_owned()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Whether `Transfer-Encoding` names `chunked`.
    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(&name, &value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/xml");
        assert_eq!(h.get("content-type"), Some("text/xml"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/xml"));
        assert!(h.contains("Content-type"));
    }

    #[test]
    fn test_duplicates_fold_with_comma() {
        let mut h = Headers::new();
        h.add("Accept", "text/xml");
        h.add("accept", "application/soap+xml");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("Accept"), Some("text/xml, application/soap+xml"));
    }

    #[test]
    fn test_set_cookie_never_folds() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("Set-Cookie", "b=2");
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_set_replaces() {
        let mut h = Headers::new();
        h.add("X-Test", "1");
        h.set("x-test", "2");
        assert_eq!(h.get("X-Test"), Some("2"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_body_framing_helpers() {
        let mut h = Headers::new();
        h.add("Content-Length", " 42 ");
        assert_eq!(h.content_length(), Some(42));

        let mut h = Headers::new();
        h.add("Transfer-Encoding", "gzip, Chunked");
        assert!(h.is_chunked());
    }
}
