//! The fetch strategy chain
//!
//! A target is first tried with plain HTTP requests. Blocks, timeouts and
//! transient errors are absorbed with backoff; once the lightweight budget
//! is spent the chain makes exactly one attempt through a real browser.
//! Only the chain's terminal errors reach callers.

use super::{
    classify, classify_malformed, excerpt, BackoffScheduler, BlockSignal, BlockTracker,
    BrowserSession, ContentKind, Deadline, FetchError, FetchOutcome, FetchTarget, HeaderProfile,
    RatePacer, RawResponse, ResponseView, Strategy, Transport,
};
use crate::config::{Config, FetchConfig};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

/// Drives a target through the lightweight and heavyweight strategies
pub struct ResilientFetcher {
    transport: Arc<dyn Transport>,
    browser: Option<Arc<BrowserSession>>,
    pacer: RatePacer,
    backoff: BackoffScheduler,
    tracker: Arc<BlockTracker>,
    settings: FetchConfig,
    deadline: Option<Deadline>,
}

impl ResilientFetcher {
    /// Creates a fetcher with lightweight requests only
    pub fn new(transport: Arc<dyn Transport>, config: &Config, tracker: Arc<BlockTracker>) -> Self {
        Self {
            transport,
            browser: None,
            pacer: RatePacer::new(&config.pacing),
            backoff: BackoffScheduler::new(&config.backoff),
            tracker,
            settings: config.fetch.clone(),
            deadline: None,
        }
    }

    /// Enables the heavyweight fallback through the given session
    ///
    /// Ignored when the configuration disables the heavyweight strategy.
    pub fn with_browser(mut self, session: Arc<BrowserSession>) -> Self {
        if self.settings.heavyweight_enabled {
            self.browser = Some(session);
        }
        self
    }

    /// Bounds every backoff and circuit-breaker wait by a run deadline
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fetches a target, escalating strategies as needed
    ///
    /// # Returns
    ///
    /// * `Ok(FetchOutcome)` - The payload and how it was obtained
    /// * `Err(FetchError::Http)` - A non-retryable HTTP status
    /// * `Err(FetchError::DeadlineExceeded)` - The run deadline cut a wait short
    /// * `Err(FetchError::Exhausted)` - Every strategy failed
    pub async fn resilient_fetch(&self, target: &FetchTarget) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();
        let max_attempts = self.settings.max_lightweight_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        match self
            .tracker
            .enforce(Strategy::Lightweight, &target.url, self.deadline.as_ref())
            .await
        {
            Err(FetchError::DeadlineExceeded) => return Err(FetchError::DeadlineExceeded),
            Err(err) => last_error = Some(err),
            Ok(()) => {
                for attempt in 1..=max_attempts {
                    attempts = attempt;
                    let result = self.lightweight_attempt(target, attempt).await;
                    self.pacer.pace().await;

                    match result {
                        Ok((payload, status)) => {
                            self.tracker.record_success();
                            return Ok(FetchOutcome::success(
                                payload,
                                status,
                                Strategy::Lightweight,
                                attempt,
                                started.elapsed(),
                            ));
                        }
                        Err(err) if !err.is_retryable() => {
                            tracing::warn!(
                                url = %target.url,
                                attempt,
                                error = %err,
                                "Non-retryable failure, giving up on target"
                            );
                            return Err(err);
                        }
                        Err(err) => {
                            if attempt < max_attempts {
                                self.backoff
                                    .pause(attempt, target, &err, self.deadline.as_ref())
                                    .await?;
                            }
                            last_error = Some(err);
                        }
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| FetchError::Transport {
            url: target.url.clone(),
            message: "no lightweight attempt was made".to_string(),
        });

        let Some(browser) = &self.browser else {
            return Err(exhausted(target, Strategy::Lightweight, attempts, last_error));
        };

        attempts += 1;
        tracing::info!(
            url = %target.url,
            lightweight_attempts = attempts - 1,
            last_error = %last_error,
            "Escalating to heavyweight fetch"
        );

        let result = match self
            .tracker
            .enforce(Strategy::Heavyweight, &target.url, self.deadline.as_ref())
            .await
        {
            Ok(()) => self.heavyweight_attempt(browser, target, attempts).await,
            Err(FetchError::DeadlineExceeded) => return Err(FetchError::DeadlineExceeded),
            Err(err) => Err(err),
        };
        self.pacer.pace().await;

        match result {
            Ok((payload, status)) => {
                self.tracker.record_success();
                Ok(FetchOutcome::success(
                    payload,
                    status,
                    Strategy::Heavyweight,
                    attempts,
                    started.elapsed(),
                ))
            }
            Err(err) => Err(exhausted(target, Strategy::Heavyweight, attempts, err)),
        }
    }

    async fn lightweight_attempt(
        &self,
        target: &FetchTarget,
        attempt: u32,
    ) -> Result<(Value, u16), FetchError> {
        let headers = HeaderProfile::for_target(target, &self.settings);
        tracing::debug!(
            url = %target.url,
            attempt,
            user_agent = %headers.user_agent,
            "Lightweight attempt"
        );

        let response = self
            .transport
            .send(&target.url, &headers, self.settings.request_timeout())
            .await
            .map_err(|e| FetchError::from_transport(&target.url, e))?;

        self.evaluate(target, &response, Strategy::Lightweight, attempt)
    }

    async fn heavyweight_attempt(
        &self,
        browser: &BrowserSession,
        target: &FetchTarget,
        attempt: u32,
    ) -> Result<(Value, u16), FetchError> {
        let headers = HeaderProfile::for_target(target, &self.settings);

        let response = browser
            .fetch(&target.url, &headers, self.settings.browser_timeout())
            .await
            .map_err(|e| FetchError::from_browser(&target.url, e))?;

        self.evaluate(target, &response, Strategy::Heavyweight, attempt)
    }

    /// Turns a raw response into a payload or a classified error
    fn evaluate(
        &self,
        target: &FetchTarget,
        response: &RawResponse,
        strategy: Strategy,
        attempt: u32,
    ) -> Result<(Value, u16), FetchError> {
        let view = ResponseView {
            status: response.status,
            body: &response.body,
            content_type: response.content_type.as_deref(),
            expected_kind: target.expected_kind,
        };

        if let Some(signal) = classify(&view).signal {
            return Err(self.block(target, strategy, signal, response.status, attempt));
        }

        if !(200..300).contains(&response.status) {
            return Err(FetchError::Http {
                url: target.url.clone(),
                status: response.status,
                body_excerpt: excerpt(&response.body),
            });
        }

        match target.expected_kind {
            ContentKind::Text => Ok((Value::String(response.body.clone()), response.status)),
            ContentKind::Json => match serde_json::from_str(&response.body) {
                Ok(payload) => Ok((payload, response.status)),
                Err(parse_error) => match classify_malformed(&view).signal {
                    Some(signal) => Err(self.block(target, strategy, signal, response.status, attempt)),
                    None => Err(FetchError::Parse {
                        url: target.url.clone(),
                        message: parse_error.to_string(),
                    }),
                },
            },
        }
    }

    fn block(
        &self,
        target: &FetchTarget,
        strategy: Strategy,
        signal: BlockSignal,
        status: u16,
        attempt: u32,
    ) -> FetchError {
        self.tracker.record_block(strategy, &signal);

        tracing::warn!(
            action = "block",
            kind = %strategy,
            url = %target.url,
            status,
            reason = %signal,
            attempt,
            context = %target.context_label(),
            "Block detected"
        );

        FetchError::Block {
            url: target.url.clone(),
            status,
            signal,
        }
    }
}

fn exhausted(
    target: &FetchTarget,
    strategy: Strategy,
    attempts: u32,
    last: FetchError,
) -> FetchError {
    tracing::warn!(
        url = %target.url,
        strategy = %strategy,
        attempts,
        kind = last.kind(),
        error = %last,
        "All fetch strategies exhausted"
    );

    FetchError::Exhausted {
        url: target.url.clone(),
        strategy,
        attempts,
        last: Box::new(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, CircuitMode};
    use crate::fetch::{
        BrowserError, BrowserHandle, BrowserLauncher, BrowserPage, TransportError,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Scripted = Result<RawResponse, TransportError>;

    /// Replays a fixed sequence of responses, repeating the last one
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_scripted(entry: &Scripted) -> Scripted {
        match entry {
            Ok(response) => Ok(response.clone()),
            Err(TransportError::Timeout) => Err(TransportError::Timeout),
            Err(TransportError::Connect(m)) => Err(TransportError::Connect(m.clone())),
            Err(TransportError::Request(m)) => Err(TransportError::Request(m.clone())),
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _url: &str,
            _headers: &HeaderProfile,
            _timeout: Duration,
        ) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                clone_scripted(script.front().unwrap())
            }
        }
    }

    struct FixedLauncher {
        response: Option<RawResponse>,
        navigations: Arc<AtomicUsize>,
    }

    struct FixedBrowser {
        response: Option<RawResponse>,
        navigations: Arc<AtomicUsize>,
    }

    struct FixedPage {
        response: Option<RawResponse>,
        navigations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserLauncher for FixedLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError> {
            Ok(Box::new(FixedBrowser {
                response: self.response.clone(),
                navigations: Arc::clone(&self.navigations),
            }))
        }
    }

    #[async_trait]
    impl BrowserHandle for FixedBrowser {
        async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
            Ok(Box::new(FixedPage {
                response: self.response.clone(),
                navigations: Arc::clone(&self.navigations),
            }))
        }

        async fn close(&mut self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserPage for FixedPage {
        async fn navigate(
            &mut self,
            _url: &str,
            _headers: &HeaderProfile,
            timeout: Duration,
        ) -> Result<RawResponse, BrowserError> {
            self.navigations.fetch_add(1, Ordering::SeqCst);
            self.response.clone().ok_or(BrowserError::Timeout(timeout))
        }

        async fn close(self: Box<Self>) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn test_config(extra: &str) -> Config {
        parse_config(&format!(
            r#"
[source]
detail-url-template = "https://api.example.com/items/{{id}}"

[fetch]
max-lightweight-attempts = 3

[storage]
database-path = ":memory:"

{}
"#,
            extra
        ))
        .unwrap()
    }

    fn json(status: u16, body: &str) -> Scripted {
        Ok(RawResponse {
            status,
            content_type: Some("application/json".to_string()),
            body: body.to_string(),
        })
    }

    fn fetcher_with(
        config: &Config,
        transport: Arc<ScriptedTransport>,
        browser_response: Option<Option<RawResponse>>,
    ) -> (ResilientFetcher, Arc<BlockTracker>, Arc<AtomicUsize>) {
        let tracker = Arc::new(BlockTracker::new(config.circuit_breaker.clone()));
        let navigations = Arc::new(AtomicUsize::new(0));
        let mut fetcher = ResilientFetcher::new(transport, config, Arc::clone(&tracker));

        if let Some(response) = browser_response {
            let launcher = FixedLauncher {
                response,
                navigations: Arc::clone(&navigations),
            };
            fetcher = fetcher.with_browser(Arc::new(BrowserSession::new(Arc::new(launcher))));
        }

        (fetcher, tracker, navigations)
    }

    fn target() -> FetchTarget {
        FetchTarget::json("https://api.example.com/items/1").with_context("phase", "detail")
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let config = test_config("");
        let transport = ScriptedTransport::new(vec![json(200, r#"{"id":1}"#)]);
        let (fetcher, _, _) = fetcher_with(&config, Arc::clone(&transport), Some(None));

        let outcome = fetcher.resilient_fetch(&target()).await.unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.strategy_used, Strategy::Lightweight);
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.payload, Some(serde_json::json!({"id": 1})));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_block() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![
            json(429, "{}"),
            json(200, r#"{"id":1}"#),
        ]);
        let (fetcher, tracker, _) = fetcher_with(&config, Arc::clone(&transport), None);

        let outcome = fetcher.resilient_fetch(&target()).await.unwrap();
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(outcome.strategy_used, Strategy::Lightweight);
        assert_eq!(tracker.snapshot().metrics.blocks_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heavyweight_after_lightweight_blocks() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![json(403, "forbidden")]);
        let browser_ok = RawResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: r#"{"id":1,"via":"browser"}"#.to_string(),
        };
        let (fetcher, tracker, navigations) =
            fetcher_with(&config, Arc::clone(&transport), Some(Some(browser_ok)));

        let outcome = fetcher.resilient_fetch(&target()).await.unwrap();
        assert_eq!(outcome.attempts_used, 4);
        assert_eq!(outcome.strategy_used, Strategy::Heavyweight);
        assert_eq!(transport.calls(), 3);
        assert_eq!(navigations.load(Ordering::SeqCst), 1);
        assert_eq!(
            tracker.snapshot().metrics.by_kind.get("lightweight"),
            Some(&3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_strategies_fail() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout)]);
        let (fetcher, _, navigations) = fetcher_with(&config, Arc::clone(&transport), Some(None));

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        match err {
            FetchError::Exhausted {
                strategy,
                attempts,
                last,
                ..
            } => {
                assert_eq!(strategy, Strategy::Heavyweight);
                assert_eq!(attempts, 4);
                assert!(matches!(*last, FetchError::Timeout { .. }));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(transport.calls(), 3);
        assert_eq!(navigations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_without_browser() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![json(503, "unavailable")]);
        let (fetcher, _, _) = fetcher_with(&config, Arc::clone(&transport), None);

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Exhausted {
                strategy: Strategy::Lightweight,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.strategy(), Some(Strategy::Lightweight));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_with_heavyweight_disabled_reports_lightweight() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let config = Config {
            fetch: FetchConfig {
                heavyweight_enabled: false,
                max_lightweight_attempts: 5,
                ..config.fetch
            },
            ..config
        };
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout)]);
        let (fetcher, _, navigations) = fetcher_with(&config, Arc::clone(&transport), Some(None));

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        let outcome = FetchOutcome::failure(&err, Duration::ZERO);
        assert_eq!(outcome.attempts_used, 5);
        assert_eq!(outcome.strategy_used, Strategy::Lightweight);
        assert_eq!(transport.calls(), 5);
        assert_eq!(navigations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_immediately() {
        let config = test_config("");
        let transport = ScriptedTransport::new(vec![json(404, "not found")]);
        let (fetcher, _, navigations) = fetcher_with(&config, Arc::clone(&transport), Some(None));

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(navigations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_500_not_retried() {
        let config = test_config("");
        let transport = ScriptedTransport::new(vec![json(500, "boom")]);
        let (fetcher, _, _) = fetcher_with(&config, Arc::clone(&transport), None);

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 500, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_with_challenge_is_block() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse {
                status: 200,
                content_type: None,
                body: "Request blocked. Reference 8812".to_string(),
            }),
            json(200, r#"{"ok":true}"#),
        ]);
        let (fetcher, tracker, _) = fetcher_with(&config, Arc::clone(&transport), None);

        let outcome = fetcher.resilient_fetch(&target()).await.unwrap();
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(
            tracker.snapshot().metrics.by_reason.get("request blocked"),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_markup_instead_of_json_is_block() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: "<html><body>Please verify you are human (captcha)</body></html>".to_string(),
            }),
            json(200, r#"{"ok":true}"#),
        ]);
        let (fetcher, tracker, _) = fetcher_with(&config, Arc::clone(&transport), None);

        fetcher.resilient_fetch(&target()).await.unwrap();
        assert_eq!(
            tracker.snapshot().metrics.by_reason.get("captcha"),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_backoff() {
        let config = test_config("[circuit-breaker]\nenabled = false");
        let transport = ScriptedTransport::new(vec![json(429, "{}")]);
        let (fetcher, _, navigations) = fetcher_with(&config, Arc::clone(&transport), Some(None));
        let fetcher = fetcher.with_deadline(Deadline::after(Duration::from_secs(30)));

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        assert!(matches!(err, FetchError::DeadlineExceeded));
        assert_eq!(transport.calls(), 1);
        assert_eq!(navigations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_circuit_exhausts_without_requests() {
        let config = test_config(
            "[circuit-breaker]\nmode = \"fail-fast\"\nthreshold = 1\nrate-limit-threshold = 10",
        );
        assert_eq!(config.circuit_breaker.mode, CircuitMode::FailFast);

        let transport = ScriptedTransport::new(vec![json(200, "{}")]);
        let (fetcher, tracker, navigations) =
            fetcher_with(&config, Arc::clone(&transport), Some(None));
        tracker.record_block(Strategy::Lightweight, &BlockSignal::HttpStatus(403));

        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        match err {
            FetchError::Exhausted {
                strategy,
                attempts,
                last,
                ..
            } => {
                assert_eq!(strategy, Strategy::Heavyweight);
                assert_eq!(attempts, 1);
                assert!(matches!(*last, FetchError::CircuitOpen { .. }));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(transport.calls(), 0);
        assert_eq!(navigations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_open_circuit_wait() {
        let config = test_config("[circuit-breaker]\nthreshold = 1\nopen-ms = 1800000");
        assert_eq!(config.circuit_breaker.mode, CircuitMode::Sleep);

        let transport = ScriptedTransport::new(vec![json(200, "{}")]);
        let (fetcher, tracker, navigations) =
            fetcher_with(&config, Arc::clone(&transport), Some(None));
        let fetcher = fetcher.with_deadline(Deadline::after(Duration::from_secs(60)));
        tracker.record_block(Strategy::Lightweight, &BlockSignal::HttpStatus(403));

        let start = Instant::now();
        let err = fetcher.resilient_fetch(&target()).await.unwrap_err();
        assert!(matches!(err, FetchError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(61));
        assert_eq!(transport.calls(), 0);
        assert_eq!(navigations.load(Ordering::SeqCst), 0);
    }
}
