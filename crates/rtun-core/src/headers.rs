use serde::{Deserialize, Serialize};

/// An ordered list of `(name, value)` pairs with a case-insensitive lookup.
///
/// HTTP allows a header name to repeat (e.g. `Set-Cookie`); an ordinary map
/// would silently drop duplicates. This preserves order and duplication
/// while still answering case-insensitive lookups cheaply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderList(pub Vec<(String, String)>);

/// Hop-by-hop headers that must never be forwarded across the tunnel boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
];

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    /// First value whose name matches case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values whose name matches case-insensitively, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Drop the headers that may not cross a proxy boundary.
    pub fn strip_hop_by_hop(&mut self) {
        self.0
            .retain(|(n, _)| !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h)));
    }

    pub fn is_hop_by_hop(name: &str) -> bool {
        HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for HeaderList {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = HeaderList::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn preserves_duplicates_in_order() {
        let mut h = HeaderList::new();
        h.push("Set-Cookie", "a=1");
        h.push("Set-Cookie", "b=2");
        let values: Vec<&str> = h.get_all("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn strip_hop_by_hop_removes_only_those() {
        let mut h = HeaderList::new();
        h.push("Connection", "keep-alive");
        h.push("X-Custom", "1");
        h.push("Transfer-Encoding", "chunked");
        h.strip_hop_by_hop();
        assert_eq!(h.0, vec![("X-Custom".to_string(), "1".to_string())]);
    }

    #[test]
    fn remove_is_case_insensitive() {
        let mut h = HeaderList::new();
        h.push("Host", "example.com");
        h.push("X-Keep", "1");
        h.remove("HOST");
        assert_eq!(h.0, vec![("X-Keep".to_string(), "1".to_string())]);
    }
}
