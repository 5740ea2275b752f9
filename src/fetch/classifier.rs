//! Block classification
//!
//! Decides whether a response is a real answer or the source's anti-bot
//! layer pushing back. The functions here are pure: the same response
//! always yields the same verdict.

use super::{BlockSignal, ContentKind};

/// Statuses that always indicate blocking or throttling
const BLOCK_STATUSES: [u16; 3] = [403, 429, 504];

/// Case-insensitive markers of challenge and WAF pages.
///
/// More specific markers come first so that a reCAPTCHA page reports
/// `recaptcha` rather than the generic `captcha`.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "recaptcha",
    "hcaptcha",
    "captcha",
    "cloudflare",
    "attention required",
    "access denied",
    "request blocked",
    "incapsula",
    "akamai",
    "robot",
    "waf",
];

/// The parts of a response the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub body: &'a str,
    pub content_type: Option<&'a str>,
    pub expected_kind: ContentKind,
}

/// Classification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVerdict {
    pub blocked: bool,
    pub signal: Option<BlockSignal>,
}

impl BlockVerdict {
    fn clear() -> Self {
        Self {
            blocked: false,
            signal: None,
        }
    }

    fn blocked(signal: BlockSignal) -> Self {
        Self {
            blocked: true,
            signal: Some(signal),
        }
    }

    /// Stable reason string, present only when blocked
    pub fn reason(&self) -> Option<String> {
        self.signal.as_ref().map(BlockSignal::reason)
    }
}

/// Classifies a response as blocked or not
///
/// # Rules (in order)
///
/// 1. Status 403, 429 or 504 is a block.
/// 2. A markup response (by content type or by body sniffing) where
///    structured data was expected is a block, reported with the first
///    challenge signature found or `unexpected_markup` otherwise.
/// 3. Anything else is not a block.
pub fn classify(view: &ResponseView<'_>) -> BlockVerdict {
    if BLOCK_STATUSES.contains(&view.status) {
        return BlockVerdict::blocked(BlockSignal::HttpStatus(view.status));
    }

    if view.expected_kind != ContentKind::Json {
        return BlockVerdict::clear();
    }

    let lowered = view.body.to_ascii_lowercase();
    let markup_type = view
        .content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text/html") || ct.contains("application/xhtml")
        })
        .unwrap_or(false);

    if markup_type || sniff_markup(&lowered) {
        let signal = match find_signature(&lowered) {
            Some(signature) => BlockSignal::ChallengeBody(signature.to_string()),
            None => BlockSignal::UnexpectedContentType,
        };
        return BlockVerdict::blocked(signal);
    }

    BlockVerdict::clear()
}

/// Second-chance classification for a 2xx body that failed to parse
///
/// Runs [`classify`] with `unknown` standing in for a missing content type,
/// then also accepts a challenge signature in a non-markup body (plain-text
/// denial pages).
pub fn classify_malformed(view: &ResponseView<'_>) -> BlockVerdict {
    let view = ResponseView {
        content_type: Some(view.content_type.unwrap_or("unknown")),
        ..*view
    };

    let verdict = classify(&view);
    if verdict.blocked {
        return verdict;
    }

    match find_signature(&view.body.to_ascii_lowercase()) {
        Some(signature) => BlockVerdict::blocked(BlockSignal::ChallengeBody(signature.to_string())),
        None => verdict,
    }
}

/// Returns true if the body looks like an HTML document
pub fn looks_like_markup(body: &str) -> bool {
    sniff_markup(&body.to_ascii_lowercase())
}

fn sniff_markup(lowered: &str) -> bool {
    let head = lowered.trim_start();
    head.starts_with("<!doctype html")
        || head.starts_with("<html")
        || lowered.contains("<head")
        || lowered.contains("<body")
}

fn find_signature(lowered: &str) -> Option<&'static str> {
    CHALLENGE_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lowered.contains(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_view<'a>(status: u16, body: &'a str, content_type: Option<&'a str>) -> ResponseView<'a> {
        ResponseView {
            status,
            body,
            content_type,
            expected_kind: ContentKind::Json,
        }
    }

    #[test]
    fn test_block_statuses() {
        for status in [403, 429, 504] {
            let verdict = classify(&json_view(status, "{}", Some("application/json")));
            assert!(verdict.blocked, "status {} should be a block", status);
            assert_eq!(verdict.signal, Some(BlockSignal::HttpStatus(status)));
            assert_eq!(verdict.reason(), Some(format!("http_{}", status)));
        }
    }

    #[test]
    fn test_json_response_not_blocked() {
        let verdict = classify(&json_view(200, r#"{"ok":true}"#, Some("application/json")));
        assert!(!verdict.blocked);
        assert_eq!(verdict.reason(), None);
    }

    #[test]
    fn test_non_block_error_status_not_blocked() {
        let verdict = classify(&json_view(500, "internal error", Some("text/plain")));
        assert!(!verdict.blocked);
    }

    #[test]
    fn test_challenge_markup_with_signature() {
        let body = "<html><head><title>Attention Required! | Cloudflare</title></head></html>";
        let verdict = classify(&json_view(200, body, Some("text/html; charset=utf-8")));
        assert!(verdict.blocked);
        assert_eq!(
            verdict.signal,
            Some(BlockSignal::ChallengeBody("cloudflare".to_string()))
        );
    }

    #[test]
    fn test_specific_signature_wins() {
        let body = "<html><body><div class=\"g-recaptcha\"></div></body></html>";
        let verdict = classify(&json_view(200, body, Some("text/html")));
        assert_eq!(verdict.reason(), Some("recaptcha".to_string()));
    }

    #[test]
    fn test_markup_without_signature() {
        let body = "<!DOCTYPE html><html><body><p>Hola</p></body></html>";
        let verdict = classify(&json_view(200, body, None));
        assert!(verdict.blocked);
        assert_eq!(verdict.signal, Some(BlockSignal::UnexpectedContentType));
        assert_eq!(verdict.reason(), Some("unexpected_markup".to_string()));
    }

    #[test]
    fn test_markup_detected_by_content_type_alone() {
        let verdict = classify(&json_view(200, "plain words", Some("text/html")));
        assert!(verdict.blocked);
    }

    #[test]
    fn test_markup_allowed_for_text_targets() {
        let view = ResponseView {
            status: 200,
            body: "<html><body>captcha</body></html>",
            content_type: Some("text/html"),
            expected_kind: ContentKind::Text,
        };
        assert!(!classify(&view).blocked);
    }

    #[test]
    fn test_malformed_plain_text_denial() {
        let view = json_view(200, "Access Denied - reference #18.2f", Some("text/plain"));
        assert!(!classify(&view).blocked);

        let verdict = classify_malformed(&view);
        assert!(verdict.blocked);
        assert_eq!(verdict.reason(), Some("access denied".to_string()));
    }

    #[test]
    fn test_malformed_garbage_not_blocked() {
        let verdict = classify_malformed(&json_view(200, "{\"truncated\":", None));
        assert!(!verdict.blocked);
    }

    #[test]
    fn test_looks_like_markup() {
        assert!(looks_like_markup("  <!doctype html><html></html>"));
        assert!(looks_like_markup("<HTML>"));
        assert!(looks_like_markup("junk<body>"));
        assert!(!looks_like_markup("{\"html\": \"<b>\"}"));
    }
}
