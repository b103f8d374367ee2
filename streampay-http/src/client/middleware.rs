//! Client-side 402 interception and stream reuse.
//!
//! This module provides the [`StreamClient`] middleware which negotiates
//! streaming payments on behalf of outbound requests and tracks how often
//! negotiation actually had to touch the ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use http::{Extensions, HeaderValue, StatusCode};
use reqwest::{Request, Response, Url};
use reqwest_middleware as rqm;
use streampay::ledger::StreamId;
use streampay::proto::PaymentTerms;
use tokio::sync::Mutex;
#[cfg(feature = "telemetry")]
use tracing::{debug, info, instrument, trace};

use super::funder::StreamFunder;
use crate::constants::{DEFAULT_FUNDING_DURATION_SECS, STREAM_ID_HEADER, STREAM_TERMS_HEADER};
use crate::error::ClientError;
use crate::headers::decode_payment_required;

/// Negotiation policy for a [`StreamClient`].
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Seconds of streaming funded per created stream. The escrowed total
    /// is `rate * funding_duration`.
    pub funding_duration: u64,
    /// Informational tag attached to every created stream.
    pub metadata: String,
    /// Cap on the cumulative base units this negotiator may escrow across
    /// all streams; `None` means unlimited.
    pub spending_limit: Option<u64>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            funding_duration: DEFAULT_FUNDING_DURATION_SECS,
            metadata: "streampay negotiator".to_owned(),
            spending_limit: None,
        }
    }
}

/// Snapshot of a negotiator's efficiency counters.
///
/// `requests_sent` counts calls through the middleware;
/// `signers_triggered` counts stream-creation authorizations. The
/// difference is the number of requests served by stream reuse, the
/// negotiator's whole reason to exist. `requests_sent >=
/// signers_triggered` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationMetrics {
    /// Requests issued through the middleware since construction.
    pub requests_sent: u64,
    /// Stream-creation authorizations triggered since construction.
    pub signers_triggered: u64,
}

/// Per-target session state: the stream id bound to a target, if any.
type SessionSlot = Arc<Mutex<Option<StreamId>>>;

/// Reqwest middleware that negotiates and reuses payment streams.
///
/// On a `402 Payment Required` response the middleware parses the
/// provider's terms, opens a stream through its [`StreamFunder`], caches
/// the stream id under the request's target key (host, or host:port), and
/// retries the original request exactly once with the id attached. The
/// retried response is returned verbatim, success or failure.
///
/// Cached ids are attached optimistically to every later request for the
/// same target; when the provider stops honoring a stream the next 402
/// renegotiates and replaces the cache entry. Negotiation for one target
/// is serialized by a per-target lock, so concurrent first requests cost
/// at most one redundant authorization.
#[derive(Debug)]
pub struct StreamClient<F> {
    funder: F,
    config: NegotiatorConfig,
    sessions: DashMap<String, SessionSlot>,
    requests_sent: AtomicU64,
    signers_triggered: AtomicU64,
    funded_total: AtomicU64,
}

impl<F> StreamClient<F> {
    /// Creates a negotiator with default policy.
    pub fn new(funder: F) -> Self {
        Self::with_config(funder, NegotiatorConfig::default())
    }

    /// Creates a negotiator with the given policy.
    pub fn with_config(funder: F, config: NegotiatorConfig) -> Self {
        Self {
            funder,
            config,
            sessions: DashMap::new(),
            requests_sent: AtomicU64::new(0),
            signers_triggered: AtomicU64::new(0),
            funded_total: AtomicU64::new(0),
        }
    }

    /// Sets how many seconds of streaming each created stream funds.
    #[must_use]
    pub fn with_funding_duration(mut self, seconds: u64) -> Self {
        self.config.funding_duration = seconds;
        self
    }

    /// Sets the metadata tag attached to created streams.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.config.metadata = metadata.into();
        self
    }

    /// Caps the cumulative amount this negotiator may escrow.
    #[must_use]
    pub fn with_spending_limit(mut self, limit: u64) -> Self {
        self.config.spending_limit = Some(limit);
        self
    }

    /// Returns the current efficiency counters.
    #[must_use]
    pub fn metrics(&self) -> NegotiationMetrics {
        NegotiationMetrics {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            signers_triggered: self.signers_triggered.load(Ordering::Relaxed),
        }
    }

    fn session(&self, key: &str) -> SessionSlot {
        let entry = self
            .sessions
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(None)));
        Arc::clone(entry.value())
    }
}

impl<F> StreamClient<F>
where
    F: StreamFunder,
{
    /// Opens a stream for the given terms, enforcing mode and spending
    /// policy. Exactly one authorization is counted per call that reaches
    /// the funder.
    async fn negotiate(&self, terms: &PaymentTerms) -> Result<StreamId, ClientError> {
        if !terms.mode.is_streaming() {
            return Err(ClientError::UnsupportedPaymentMode(terms.mode.to_string()));
        }

        let rate = terms.rate_base_units().map_err(|e| {
            ClientError::MalformedPaymentTerms(format!("bad rate '{}': {e}", terms.rate))
        })?;
        let total_amount = rate
            .checked_mul(self.config.funding_duration)
            .ok_or_else(|| {
                ClientError::MalformedPaymentTerms(format!(
                    "rate '{}' overflows the funding window",
                    terms.rate
                ))
            })?;

        if let Some(limit) = self.config.spending_limit {
            let funded = self.funded_total.load(Ordering::SeqCst);
            if funded.saturating_add(total_amount) > limit {
                return Err(ClientError::FundingLimitExceeded {
                    requested: total_amount,
                    funded,
                    limit,
                });
            }
        }

        #[cfg(feature = "telemetry")]
        debug!(
            rate,
            total_amount,
            duration = self.config.funding_duration,
            recipient = %terms.pay_to,
            "Opening payment stream"
        );

        self.signers_triggered.fetch_add(1, Ordering::Relaxed);
        let id = self
            .funder
            .open_stream(
                terms,
                total_amount,
                self.config.funding_duration,
                &self.config.metadata,
            )
            .await?;
        self.funded_total.fetch_add(total_amount, Ordering::SeqCst);
        Ok(id)
    }
}

/// Derives the cache key for a request's destination.
fn target_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => url.as_str().to_owned(),
    }
}

fn stream_id_header(id: StreamId) -> HeaderValue {
    id.to_string()
        .parse()
        .expect("decimal stream id is a valid header value")
}

/// Extracts payment terms from a 402 response.
fn parse_stream_terms(res: &Response) -> Result<PaymentTerms, ClientError> {
    let header = res.headers().get(STREAM_TERMS_HEADER).ok_or_else(|| {
        ClientError::MalformedPaymentTerms(format!("missing {STREAM_TERMS_HEADER} header"))
    })?;
    let value = header.to_str().map_err(|_| {
        ClientError::MalformedPaymentTerms(format!("{STREAM_TERMS_HEADER} is not valid ASCII"))
    })?;
    let required =
        decode_payment_required(value).map_err(|e| ClientError::MalformedPaymentTerms(e.to_string()))?;
    Ok(required.terms)
}

/// Runs the next middleware or HTTP client with optional telemetry
/// instrumentation.
#[cfg_attr(
    feature = "telemetry",
    instrument(name = "streampay.reqwest.next", skip_all)
)]
async fn run_next(
    next: rqm::Next<'_>,
    req: Request,
    extensions: &mut Extensions,
) -> rqm::Result<Response> {
    next.run(req, extensions).await
}

#[async_trait::async_trait]
impl<F> rqm::Middleware for StreamClient<F>
where
    F: StreamFunder + 'static,
{
    /// Handles a request, negotiating a payment stream when the provider
    /// demands one.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "streampay.reqwest.handle", skip_all, err)
    )]
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let slot = self.session(&target_key(req.url()));
        let attached = *slot.lock().await;
        if let Some(id) = attached {
            req.headers_mut().insert(STREAM_ID_HEADER, stream_id_header(id));
        }

        let retry_req = req.try_clone();
        let res = run_next(next.clone(), req, extensions).await?;
        if res.status() != StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            trace!(status = ?res.status(), "No payment required, returning response");
            return Ok(res);
        }

        #[cfg(feature = "telemetry")]
        info!(url = ?res.url(), "Received 402 Payment Required, negotiating stream");

        let terms = match parse_stream_terms(&res) {
            Ok(terms) => terms,
            Err(e) => {
                // Any negotiation failure invalidates whatever stream was
                // cached for this target.
                *slot.lock().await = None;
                return Err(rqm::Error::Middleware(e.into()));
            }
        };
        let mut retry = retry_req.ok_or_else(|| {
            rqm::Error::Middleware(ClientError::RequestNotCloneable.into())
        })?;

        let stream_id = {
            let mut cached = slot.lock().await;
            match *cached {
                // A concurrent request to this target already replaced the
                // stream we attached (or attached none); ride it instead
                // of funding a second one.
                Some(id) if *cached != attached => id,
                _ => match self.negotiate(&terms).await {
                    Ok(id) => {
                        *cached = Some(id);
                        id
                    }
                    Err(e) => {
                        *cached = None;
                        return Err(rqm::Error::Middleware(e.into()));
                    }
                },
            }
        };

        retry
            .headers_mut()
            .insert(STREAM_ID_HEADER, stream_id_header(stream_id));

        #[cfg(feature = "telemetry")]
        trace!(stream = %stream_id, "Retrying request with stream attached");

        run_next(next, retry, extensions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LedgerFunder, ReqwestWithStreaming};
    use crate::headers::encode_payment_required;
    use base64::prelude::*;
    use streampay::escrow::InMemoryVault;
    use streampay::ledger::StreamLedger;
    use streampay::proto::{PaymentMode, PaymentRequired};
    use streampay::timestamp::ManualClock;
    use streampay::LedgerError;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Funder stub handing out sequential ids; optionally fails its first
    /// call.
    struct MockFunder {
        calls: AtomicU64,
        fail_first: bool,
    }

    impl MockFunder {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_first: false,
            }
        }

        fn failing_first() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_first: true,
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl StreamFunder for MockFunder {
        async fn open_stream(
            &self,
            _terms: &PaymentTerms,
            _total_amount: u64,
            _duration: u64,
            _metadata: &str,
        ) -> Result<StreamId, LedgerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_first && call == 1 {
                return Err(LedgerError::InvalidTerms("backend rejected".into()));
            }
            Ok(StreamId::new(call))
        }
    }

    fn streaming_terms() -> PaymentTerms {
        PaymentTerms {
            mode: PaymentMode::Streaming,
            rate: "1".into(),
            asset: None,
            decimals: Some(0),
            contract: "0xLedger".into(),
            pay_to: "0xProvider".into(),
        }
    }

    fn terms_header(terms: PaymentTerms) -> String {
        encode_payment_required(&PaymentRequired::new(terms)).unwrap()
    }

    fn build_client(
        negotiator: &Arc<StreamClient<MockFunder>>,
    ) -> rqm::ClientWithMiddleware {
        reqwest::Client::new()
            .with_streaming(Arc::clone(negotiator))
            .build()
    }

    /// Mounts the usual provider behavior: 200 when the expected stream id
    /// is attached, 402 with terms otherwise. Specific mock first; wiremock
    /// picks the first match.
    async fn mount_provider(server: &MockServer, route: &str, expected_id: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header(STREAM_ID_HEADER, expected_id))
            .respond_with(ResponseTemplate::new(200).set_body_string("premium"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(STREAM_TERMS_HEADER, terms_header(streaming_terms()).as_str()),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_passthrough_without_payment_demand() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/free"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let res = client.get(format!("{}/free", server.uri())).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(
            negotiator.metrics(),
            NegotiationMetrics {
                requests_sent: 1,
                signers_triggered: 0
            }
        );
        assert_eq!(negotiator.funder.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_reuse_avoids_repeat_authorization() {
        let server = MockServer::start().await;
        mount_provider(&server, "/premium", "1").await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);
        let url = format!("{}/premium", server.uri());

        for _ in 0..5 {
            let res = client.get(&url).send().await.unwrap();
            assert_eq!(res.status(), 200);
        }

        // One authorization bought five requests.
        assert_eq!(
            negotiator.metrics(),
            NegotiationMetrics {
                requests_sent: 5,
                signers_triggered: 1
            }
        );
        assert_eq!(negotiator.funder.calls(), 1);
    }

    #[tokio::test]
    async fn test_separate_targets_get_separate_streams() {
        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        mount_provider(&server_a, "/premium", "1").await;
        mount_provider(&server_b, "/premium", "2").await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let res = client
            .get(format!("{}/premium", server_a.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let res = client
            .get(format!("{}/premium", server_b.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);

        assert_eq!(negotiator.funder.calls(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_mode_fails_without_ledger_call() {
        let server = MockServer::start().await;
        let mut terms = streaming_terms();
        terms.mode = PaymentMode::Other("one-time".into());
        Mock::given(method("GET"))
            .and(path("/premium"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(STREAM_TERMS_HEADER, terms_header(terms).as_str()),
            )
            .mount(&server)
            .await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let err = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap_err();
        match err {
            rqm::Error::Middleware(inner) => {
                assert!(inner.to_string().contains("one-time"));
            }
            other => panic!("expected middleware error, got {other:?}"),
        }
        assert_eq!(negotiator.funder.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_terms_header_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/premium"))
            .respond_with(ResponseTemplate::new(402))
            .mount(&server)
            .await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let err = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap_err();
        match err {
            rqm::Error::Middleware(inner) => {
                assert!(inner.to_string().contains("malformed payment terms"));
            }
            other => panic!("expected middleware error, got {other:?}"),
        }
        assert_eq!(negotiator.funder.calls(), 0);
    }

    #[tokio::test]
    async fn test_terms_without_recipient_are_malformed() {
        let server = MockServer::start().await;
        let incomplete =
            BASE64_STANDARD.encode(r#"{"terms":{"mode":"streaming","rate":"1","contract":"0xL"}}"#);
        Mock::given(method("GET"))
            .and(path("/premium"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(STREAM_TERMS_HEADER, incomplete.as_str()),
            )
            .mount(&server)
            .await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let err = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, rqm::Error::Middleware(_)));
        assert_eq!(negotiator.funder.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_response_is_returned_verbatim() {
        let server = MockServer::start().await;
        // Provider keeps demanding payment even with a stream attached.
        Mock::given(method("GET"))
            .and(path("/premium"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(STREAM_TERMS_HEADER, terms_header(streaming_terms()).as_str()),
            )
            .mount(&server)
            .await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::new()));
        let client = build_client(&negotiator);

        let res = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap();
        // Exactly one retry: the second 402 comes back as the outcome.
        assert_eq!(res.status(), 402);
        assert_eq!(negotiator.funder.calls(), 1);
        assert_eq!(
            negotiator.metrics(),
            NegotiationMetrics {
                requests_sent: 1,
                signers_triggered: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failed_negotiation_clears_cache_then_recovers() {
        let server = MockServer::start().await;
        // The flaky funder succeeds on its second call, returning id 2.
        mount_provider(&server, "/premium", "2").await;

        let negotiator = Arc::new(StreamClient::new(MockFunder::failing_first()));
        let client = build_client(&negotiator);
        let url = format!("{}/premium", server.uri());

        let err = client.get(&url).send().await.unwrap_err();
        assert!(matches!(err, rqm::Error::Middleware(_)));

        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(negotiator.funder.calls(), 2);
    }

    #[tokio::test]
    async fn test_spending_limit_blocks_funding() {
        let server = MockServer::start().await;
        mount_provider(&server, "/premium", "1").await;

        // Default funding window is 3600 s at rate 1/s; a 100-unit cap
        // cannot cover it.
        let negotiator = Arc::new(StreamClient::new(MockFunder::new()).with_spending_limit(100));
        let client = build_client(&negotiator);

        let err = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap_err();
        match err {
            rqm::Error::Middleware(inner) => {
                assert!(inner.to_string().contains("funding limit exceeded"));
            }
            other => panic!("expected middleware error, got {other:?}"),
        }
        assert_eq!(negotiator.funder.calls(), 0);
    }

    #[tokio::test]
    async fn test_negotiation_funds_ledger_stream_end_to_end() {
        let server = MockServer::start().await;
        mount_provider(&server, "/premium", "1").await;

        let vault = Arc::new(InMemoryVault::new());
        vault.mint("0xAgent", 10_000);
        vault.approve("0xAgent", 10_000);
        let ledger = Arc::new(StreamLedger::new(
            Arc::clone(&vault),
            ManualClock::starting_at(1_000),
        ));

        let negotiator = Arc::new(
            StreamClient::new(LedgerFunder::new(Arc::clone(&ledger), "0xAgent".to_owned()))
                .with_funding_duration(600)
                .with_metadata("agent payment"),
        );
        let client = reqwest::Client::new()
            .with_streaming(Arc::clone(&negotiator))
            .build();

        let res = client
            .get(format!("{}/premium", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);

        let ids = ledger.streams_for("0xAgent");
        assert_eq!(ids.len(), 1);
        let stream = ledger.get(ids[0]).await.unwrap();
        assert_eq!(stream.recipient, "0xProvider");
        assert_eq!(stream.total_amount, 600);
        assert_eq!(stream.metadata, "agent payment");
        assert_eq!(vault.escrowed(), 600);
    }
}
