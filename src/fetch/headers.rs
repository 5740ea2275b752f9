//! Realistic request metadata
//!
//! Every attempt gets a freshly randomized header profile so consecutive
//! requests do not share an identical fingerprint.

use super::{ContentKind, FetchTarget};
use crate::config::FetchConfig;
use rand::seq::SliceRandom;
use url::Url;

/// Browser user agents rotated across requests
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_6_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_3_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Mobile Safari/537.36",
];

const FALLBACK_ACCEPT_LANGUAGE: &str = "es-CL,es;q=0.9,en-US;q=0.8,en;q=0.7";

const ACCEPT_JSON: &str = "application/json, text/plain, */*";
const ACCEPT_DOCUMENT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Picks a user agent from the pool
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// One request's worth of headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl HeaderProfile {
    /// Builds a randomized profile for a target
    ///
    /// Referer and origin come from the configuration when set, otherwise
    /// they are derived from the target's own site.
    pub fn for_target(target: &FetchTarget, config: &FetchConfig) -> Self {
        let site_origin = Url::parse(&target.url)
            .ok()
            .map(|url| url.origin())
            .filter(|origin| origin.is_tuple())
            .map(|origin| origin.ascii_serialization());

        let accept_language = config
            .accept_language
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_ACCEPT_LANGUAGE.to_string());

        let accept = match target.expected_kind {
            ContentKind::Json => ACCEPT_JSON,
            ContentKind::Text => ACCEPT_DOCUMENT,
        };

        Self {
            user_agent: random_user_agent().to_string(),
            accept: accept.to_string(),
            accept_language,
            referer: config
                .referer
                .clone()
                .or_else(|| site_origin.as_ref().map(|origin| format!("{}/", origin))),
            origin: config.origin.clone().or(site_origin),
        }
    }

    /// All headers as name/value pairs
    ///
    /// `accept-encoding` is left to the HTTP client, which negotiates and
    /// decodes compression itself.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("user-agent", self.user_agent.clone()),
            ("accept", self.accept.clone()),
            ("accept-language", self.accept_language.clone()),
            ("cache-control", "no-cache".to_string()),
            ("pragma", "no-cache".to_string()),
            ("dnt", "1".to_string()),
        ];

        if let Some(referer) = &self.referer {
            pairs.push(("referer", referer.clone()));
        }
        if let Some(origin) = &self.origin {
            pairs.push(("origin", origin.clone()));
        }

        pairs
    }

    /// Headers sent as extras by the browser (which sets its own user agent)
    pub fn extra_browser_headers(&self) -> serde_json::Map<String, serde_json::Value> {
        self.to_pairs()
            .into_iter()
            .filter(|(name, _)| *name != "user-agent" && *name != "accept")
            .map(|(name, value)| (name.to_string(), serde_json::Value::String(value)))
            .collect()
    }

    /// Primary language tag, e.g. `es-CL` out of `es-CL,es;q=0.9`
    pub fn primary_language(&self) -> &str {
        self.accept_language
            .split(',')
            .next()
            .map(str::trim)
            .unwrap_or("es-CL")
    }
}
