//! Response classification: success, soft block, hard failure.
//!
//! Block detection is inherently fuzzy, so it sits behind the
//! [`BlockDetector`] trait. [`DefaultBlockDetector`] combines status codes,
//! a minimum body length and a list of challenge markers.

/// Outcome class of a single strategy attempt that produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    /// Usable content.
    Success,
    /// The source resisted automated access; escalate to the next strategy.
    SoftBlock { reason: String },
    /// Upstream server error; retry with backoff.
    HardFailure { reason: String },
    /// The resource definitively does not exist or the request is invalid.
    /// Escalating would not help.
    Rejected,
}

/// Classifies raw responses.
pub trait BlockDetector: Send + Sync {
    fn classify(&self, status: u16, body: &str) -> ResponseClass;
}

/// Status-code and content-marker heuristic.
#[derive(Debug, Clone)]
pub struct DefaultBlockDetector {
    pub block_statuses: Vec<u16>,
    pub rejected_statuses: Vec<u16>,
    /// Lowercase substrings that indicate a challenge page.
    pub markers: Vec<String>,
    pub min_content_length: usize,
}

impl Default for DefaultBlockDetector {
    fn default() -> Self {
        Self {
            block_statuses: vec![403, 429, 503],
            rejected_statuses: vec![400, 404, 410],
            markers: [
                "captcha",
                "access denied",
                "cf-chl",
                "cloudflare",
                "are you a robot",
                "unusual traffic",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            min_content_length: 200,
        }
    }
}

impl DefaultBlockDetector {
    pub fn with_min_content_length(mut self, len: usize) -> Self {
        self.min_content_length = len;
        self
    }

    pub fn with_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers = markers
            .into_iter()
            .map(|m| m.into().to_lowercase())
            .collect();
        self
    }

    fn find_marker(&self, body: &str) -> Option<&str> {
        let lower = body.to_lowercase();
        self.markers
            .iter()
            .find(|m| lower.contains(m.as_str()))
            .map(String::as_str)
    }
}

impl BlockDetector for DefaultBlockDetector {
    fn classify(&self, status: u16, body: &str) -> ResponseClass {
        if self.rejected_statuses.contains(&status) {
            return ResponseClass::Rejected;
        }
        if self.block_statuses.contains(&status) {
            return ResponseClass::SoftBlock {
                reason: format!("HTTP {status}"),
            };
        }
        if (500..600).contains(&status) {
            return ResponseClass::HardFailure {
                reason: format!("HTTP {status}"),
            };
        }
        if !(200..300).contains(&status) {
            return ResponseClass::SoftBlock {
                reason: format!("unexpected HTTP {status}"),
            };
        }
        if body.len() < self.min_content_length && !is_json_document(body) {
            return ResponseClass::SoftBlock {
                reason: format!("content too short ({} bytes)", body.len()),
            };
        }
        if let Some(marker) = self.find_marker(body) {
            return ResponseClass::SoftBlock {
                reason: format!("challenge marker '{marker}'"),
            };
        }
        ResponseClass::Success
    }
}

/// API payloads are legitimately short; only markup is held to the
/// minimum length.
fn is_json_document(body: &str) -> bool {
    let trimmed = body.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> String {
        format!("<html><body>{text}{}</body></html>", " ".repeat(300))
    }

    #[test]
    fn ok_page_is_success() {
        let detector = DefaultBlockDetector::default();
        assert_eq!(
            detector.classify(200, &page("Patent WO2020123456")),
            ResponseClass::Success
        );
    }

    #[test]
    fn block_statuses_are_soft_blocks() {
        let detector = DefaultBlockDetector::default();
        for status in [403, 429, 503] {
            assert!(matches!(
                detector.classify(status, &page("x")),
                ResponseClass::SoftBlock { .. }
            ));
        }
    }

    #[test]
    fn challenge_markers_are_soft_blocks() {
        let detector = DefaultBlockDetector::default();
        let class = detector.classify(200, &page("Please complete the CAPTCHA"));
        assert_eq!(
            class,
            ResponseClass::SoftBlock {
                reason: "challenge marker 'captcha'".into()
            }
        );
    }

    #[test]
    fn short_content_is_soft_block() {
        let detector = DefaultBlockDetector::default();
        assert!(matches!(
            detector.classify(200, "<html></html>"),
            ResponseClass::SoftBlock { .. }
        ));
        let lenient = DefaultBlockDetector::default().with_min_content_length(0);
        assert_eq!(lenient.classify(200, "{}"), ResponseClass::Success);
    }

    #[test]
    fn server_errors_are_hard_failures() {
        let detector = DefaultBlockDetector::default();
        assert!(matches!(
            detector.classify(502, &page("bad gateway")),
            ResponseClass::HardFailure { .. }
        ));
    }

    #[test]
    fn not_found_is_rejected() {
        let detector = DefaultBlockDetector::default();
        assert_eq!(detector.classify(404, ""), ResponseClass::Rejected);
        assert_eq!(detector.classify(410, ""), ResponseClass::Rejected);
    }

    #[test]
    fn custom_markers_replace_defaults() {
        let detector = DefaultBlockDetector::default().with_markers(["Bot Check"]);
        assert!(matches!(
            detector.classify(200, &page("bot check required")),
            ResponseClass::SoftBlock { .. }
        ));
        assert_eq!(
            detector.classify(200, &page("captcha")),
            ResponseClass::Success
        );
    }

    #[test]
    fn short_json_payload_is_success() {
        let detector = DefaultBlockDetector::default();
        assert_eq!(
            detector.classify(200, r#"{"IdentifierList":{"CID":[2244]}}"#),
            ResponseClass::Success
        );
        assert!(matches!(
            detector.classify(200, "<html>short</html>"),
            ResponseClass::SoftBlock { .. }
        ));
    }
}
