//! Per-route tower layer that puts routes behind a payment stream.
//!
//! [`StreamGate`] creates per-route layers that integrate natively with
//! axum's `.layer()` method. A request carrying a `Payment-Stream-Id`
//! header naming a stream the gate's [`StreamValidator`] accepts passes
//! through to the inner service; every other request is answered with
//! `402 Payment Required` and the route's payment terms.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use axum::{Router, routing::get};
//! use streampay_http::server::{LedgerValidator, RouteTerms, StreamGate};
//!
//! let gate = StreamGate::new(Arc::new(LedgerValidator::new(ledger)));
//!
//! let app = Router::new().route(
//!     "/api/premium",
//!     get(premium_handler).layer(gate.route(
//!         RouteTerms::new("0.0001", "0xProvider", "0xLedger")
//!             .with_asset("0xToken"),
//!     )),
//! );
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::body::Body;
use http::{Request, Response, StatusCode};
use streampay::escrow::Escrow;
use streampay::ledger::{StreamId, StreamLedger};
use streampay::proto::{PaymentMode, PaymentRequired, PaymentTerms};
use streampay::timestamp::{Clock, SystemClock};
use tower::{Layer, Service};

use crate::constants::{ACCESS_CONTROL_EXPOSE_HEADERS, STREAM_ID_HEADER, STREAM_TERMS_HEADER};
use crate::headers::encode_payment_required;

/// Decides whether a stream id entitles a request to pass the gate.
#[async_trait::async_trait]
pub trait StreamValidator: Send + Sync {
    /// Returns `true` if the stream is currently paying for requests.
    async fn validate(&self, id: StreamId) -> bool;
}

/// A [`StreamValidator`] backed by an in-process [`StreamLedger`].
#[derive(Debug)]
pub struct LedgerValidator<E, C = SystemClock> {
    ledger: Arc<StreamLedger<E, C>>,
}

impl<E, C> LedgerValidator<E, C> {
    /// Creates a validator over the given ledger.
    pub fn new(ledger: Arc<StreamLedger<E, C>>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl<E, C> StreamValidator for LedgerValidator<E, C>
where
    E: Escrow,
    C: Clock,
{
    async fn validate(&self, id: StreamId) -> bool {
        // The activity flag alone is not enough: natural expiry never
        // clears it, so an expired stream must also fail the clock check.
        match self.ledger.get(id).await {
            Ok(stream) => stream.is_active && self.ledger.now() < stream.stop_time,
            Err(_) => false,
        }
    }
}

/// Payment terms a gated route publishes in its 402 responses.
#[derive(Debug, Clone)]
pub struct RouteTerms {
    rate: String,
    pay_to: String,
    contract: String,
    asset: Option<String>,
    decimals: Option<u8>,
}

impl RouteTerms {
    /// Creates terms demanding `rate` value per second, paid to `pay_to`
    /// through the settlement target `contract`.
    pub fn new(
        rate: impl Into<String>,
        pay_to: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            rate: rate.into(),
            pay_to: pay_to.into(),
            contract: contract.into(),
            asset: None,
            decimals: None,
        }
    }

    /// Names the asset streams must pay in.
    #[must_use]
    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    /// Declares the asset's decimal places.
    #[must_use]
    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = Some(decimals);
        self
    }

    fn to_payment_required(&self) -> PaymentRequired {
        PaymentRequired {
            error: Some("Payment required".to_owned()),
            terms: PaymentTerms {
                mode: PaymentMode::Streaming,
                rate: self.rate.clone(),
                asset: self.asset.clone(),
                decimals: self.decimals,
                contract: self.contract.clone(),
                pay_to: self.pay_to.clone(),
            },
        }
    }
}

/// Per-route stream gate factory.
///
/// Holds a shared validator and hands out per-route layers via
/// [`StreamGate::route`].
#[derive(Debug)]
pub struct StreamGate<V> {
    validator: Arc<V>,
}

impl<V> Clone for StreamGate<V> {
    fn clone(&self) -> Self {
        Self {
            validator: Arc::clone(&self.validator),
        }
    }
}

impl<V> StreamGate<V> {
    /// Creates a gate backed by the given validator.
    pub fn new(validator: Arc<V>) -> Self {
        Self { validator }
    }

    /// Creates a per-route layer publishing the given terms.
    #[must_use]
    pub fn route(&self, terms: RouteTerms) -> StreamRouteLayer<V> {
        StreamRouteLayer {
            shared: Arc::new(RouteShared {
                validator: Arc::clone(&self.validator),
                required: terms.to_payment_required(),
            }),
        }
    }
}

/// Shared state for a single gated route.
#[derive(Debug)]
struct RouteShared<V> {
    validator: Arc<V>,
    required: PaymentRequired,
}

/// Per-route tower [`Layer`] enforcing stream payment.
///
/// Created by [`StreamGate::route`].
#[derive(Debug)]
pub struct StreamRouteLayer<V> {
    shared: Arc<RouteShared<V>>,
}

impl<V> Clone for StreamRouteLayer<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, V> Layer<S> for StreamRouteLayer<V> {
    type Service = StreamRouteService<S, V>;

    fn layer(&self, inner: S) -> Self::Service {
        StreamRouteService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Per-route tower [`Service`] enforcing stream payment.
///
/// Created by [`StreamRouteLayer`]. Should not be constructed directly.
pub struct StreamRouteService<S, V> {
    inner: S,
    shared: Arc<RouteShared<V>>,
}

impl<S: Clone, V> Clone for StreamRouteService<S, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, V> std::fmt::Debug for StreamRouteService<S, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouteService")
            .field("required", &self.shared.required)
            .finish_non_exhaustive()
    }
}

impl<S, V> Service<Request<Body>> for StreamRouteService<S, V>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    V: StreamValidator + 'static,
{
    type Response = Response<Body>;
    // The gate itself never fails; inner-service errors pass through.
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(id) = stream_id_from(&req) {
                if shared.validator.validate(id).await {
                    let mut response = inner.call(req).await?;
                    response.headers_mut().insert(
                        STREAM_ID_HEADER,
                        id.to_string()
                            .parse()
                            .expect("decimal stream id is a valid header value"),
                    );
                    return Ok(response);
                }
            }
            Ok(payment_required_response(&shared.required))
        })
    }
}

/// Extracts and parses the stream id header, if present and well-formed.
fn stream_id_from(req: &Request<Body>) -> Option<StreamId> {
    req.headers()
        .get(STREAM_ID_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Creates a 402 Payment Required response carrying the route's terms.
fn payment_required_response(required: &PaymentRequired) -> Response<Body> {
    let encoded = encode_payment_required(required).unwrap_or_default();
    let body_json = serde_json::to_string(required).unwrap_or_default();

    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(STREAM_TERMS_HEADER, &encoded)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_EXPOSE_HEADERS, STREAM_TERMS_HEADER)
        .body(Body::from(body_json))
        .expect("valid 402 response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::decode_payment_required;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashSet;
    use streampay::escrow::InMemoryVault;
    use streampay::timestamp::ManualClock;
    use tower::util::ServiceExt;

    struct StubValidator {
        accepted: HashSet<StreamId>,
    }

    impl StubValidator {
        fn accepting(ids: &[u64]) -> Self {
            Self {
                accepted: ids.iter().copied().map(StreamId::new).collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamValidator for StubValidator {
        async fn validate(&self, id: StreamId) -> bool {
            self.accepted.contains(&id)
        }
    }

    fn gated_app(validator: Arc<StubValidator>) -> Router {
        let gate = StreamGate::new(validator);
        Router::new().route(
            "/premium",
            get(|| async { "premium content" }).layer(gate.route(
                RouteTerms::new("0.0001", "0xProvider", "0xLedger").with_asset("0xToken"),
            )),
        )
    }

    fn request(stream_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/premium");
        if let Some(id) = stream_id {
            builder = builder.header(STREAM_ID_HEADER, id);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unpaid_request_gets_terms() {
        let app = gated_app(Arc::new(StubValidator::accepting(&[])));

        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let header = response
            .headers()
            .get(STREAM_TERMS_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        let required = decode_payment_required(header).unwrap();
        assert!(required.terms.mode.is_streaming());
        assert_eq!(required.terms.pay_to, "0xProvider");
        assert_eq!(required.terms.contract, "0xLedger");
    }

    #[tokio::test]
    async fn test_valid_stream_passes_gate() {
        let app = gated_app(Arc::new(StubValidator::accepting(&[7])));

        let response = app.oneshot(request(Some("7"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let echoed = response.headers().get(STREAM_ID_HEADER).unwrap();
        assert_eq!(echoed.to_str().unwrap(), "7");
    }

    #[tokio::test]
    async fn test_unknown_or_garbled_stream_is_refused() {
        let app = gated_app(Arc::new(StubValidator::accepting(&[7])));

        let response = app.clone().oneshot(request(Some("8"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let response = app.oneshot(request(Some("not-a-number"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_ledger_validator_tracks_stream_lifetime() {
        let vault = Arc::new(InMemoryVault::new());
        vault.mint("0xAgent", 600);
        vault.approve("0xAgent", 600);
        let clock = ManualClock::starting_at(50_000);
        let ledger = Arc::new(StreamLedger::new(Arc::clone(&vault), clock.clone()));
        let validator = LedgerValidator::new(Arc::clone(&ledger));

        let id = ledger
            .create_stream("0xAgent".into(), "0xProvider".into(), 600, 600, String::new())
            .await
            .unwrap();
        assert!(validator.validate(id).await);
        assert!(!validator.validate(StreamId::new(99)).await);

        // Past stop_time the raw activity flag still reads true, but the
        // gate must refuse the stream.
        clock.advance(601);
        assert!(ledger.is_stream_active(id).await.unwrap());
        assert!(!validator.validate(id).await);

        // A cancelled stream is refused immediately.
        vault.mint("0xAgent", 600);
        vault.approve("0xAgent", 600);
        let second = ledger
            .create_stream("0xAgent".into(), "0xProvider".into(), 600, 600, String::new())
            .await
            .unwrap();
        assert!(validator.validate(second).await);
        ledger.cancel(second, "0xAgent").await.unwrap();
        assert!(!validator.validate(second).await);
    }
}
