//! Ordered `(name, value)` header pairs and the canonical constructors for
//! request-initial, response-initial, and trailer metadata (spec §3, §6).

use crate::status::Code;

/// gRPC-compatible canonical header names (spec §6).
pub mod header {
    pub const METHOD: &str = ":method";
    pub const PATH: &str = ":path";
    pub const SCHEME: &str = ":scheme";
    pub const AUTHORITY: &str = ":authority";
    pub const STATUS: &str = ":status";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const TE: &str = "te";
    pub const GRPC_STATUS: &str = "grpc-status";
    pub const GRPC_MESSAGE: &str = "grpc-message";
}

const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// An ordered sequence of `(name, value)` pairs. Lookup is case-sensitive
/// and returns the first match, matching HTTP/2 header-list semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pairs: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.pairs.push((name.into(), value.into()));
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value whose name matches exactly, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Presence of `grpc-status` identifies this event as a trailer,
    /// regardless of where it falls in the stream (spec §3 invariant).
    pub fn grpc_status(&self) -> Option<Code> {
        self.get(header::GRPC_STATUS).and_then(|v| v.parse::<u32>().ok()).and_then(Code::from_u32)
    }

    pub fn grpc_message(&self) -> Option<&str> {
        self.get(header::GRPC_MESSAGE)
    }

    pub fn is_trailer(&self) -> bool {
        self.get(header::GRPC_STATUS).is_some()
    }

    /// Request-initial metadata for a call to `service_name.method_name`.
    pub fn request_initial(service_name: &str, method_name: &str, authority: &str) -> Self {
        Metadata::new()
            .with(header::METHOD, "POST")
            .with(header::PATH, format!("/{service_name}/{method_name}"))
            .with(header::SCHEME, "http")
            .with(header::AUTHORITY, authority)
            .with(header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
            .with(header::TE, "trailers")
    }

    /// Response-initial metadata, sent by the responder before any payload.
    pub fn response_initial() -> Self {
        Metadata::new().with(header::STATUS, "200").with(header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
    }

    /// Trailer metadata carrying the terminal status of a call.
    pub fn trailer(code: Code, message: Option<&str>) -> Self {
        let mut metadata = Metadata::new().with(header::GRPC_STATUS, (code as u32).to_string());
        if let Some(message) = message {
            if !message.is_empty() {
                metadata.insert(header::GRPC_MESSAGE, message);
            }
        }
        metadata
    }

    /// Parses `:path` (or a cached `methodPath`) of the shape
    /// `/service/method` into its two components.
    pub fn parse_path(path: &str) -> Option<(&str, &str)> {
        let trimmed = path.strip_prefix('/')?;
        let mut parts = trimmed.splitn(2, '/');
        let service = parts.next()?;
        let method = parts.next()?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }
        Some((service, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_initial_carries_canonical_headers() {
        let metadata = Metadata::request_initial("Echo", "Say", "localhost");
        assert_eq!(metadata.get(header::METHOD), Some("POST"));
        assert_eq!(metadata.get(header::PATH), Some("/Echo/Say"));
        assert_eq!(metadata.get(header::CONTENT_TYPE), Some(GRPC_CONTENT_TYPE));
        assert_eq!(metadata.get(header::TE), Some("trailers"));
    }

    #[test]
    fn trailer_is_identified_by_grpc_status_presence() {
        let trailer = Metadata::trailer(Code::NotFound, Some("no such widget"));
        assert!(trailer.is_trailer());
        assert_eq!(trailer.grpc_status(), Some(Code::NotFound));
        assert_eq!(trailer.grpc_message(), Some("no such widget"));
    }

    #[test]
    fn trailer_omits_message_header_when_empty() {
        let trailer = Metadata::trailer(Code::Ok, None);
        assert_eq!(trailer.grpc_message(), None);
    }

    #[test]
    fn get_returns_first_match() {
        let mut metadata = Metadata::new();
        metadata.insert("x-dup", "first");
        metadata.insert("x-dup", "second");
        assert_eq!(metadata.get("x-dup"), Some("first"));
    }

    #[test]
    fn parse_path_splits_service_and_method() {
        assert_eq!(Metadata::parse_path("/Echo/Say"), Some(("Echo", "Say")));
        assert_eq!(Metadata::parse_path("/com.example.Svc/Method"), Some(("com.example.Svc", "Method")));
    }

    #[test]
    fn parse_path_rejects_malformed_paths() {
        assert_eq!(Metadata::parse_path("Echo/Say"), None);
        assert_eq!(Metadata::parse_path("/Echo"), None);
        assert_eq!(Metadata::parse_path("/Echo/Say/Extra"), None);
        assert_eq!(Metadata::parse_path("//Say"), None);
    }
}
