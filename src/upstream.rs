//! Bounded upstream dispatch.
//!
//! Forwards the merged request to the offer's upstream endpoint after the
//! URL policy (see [`crate::guard`]) has cleared it, with a hard deadline
//! and a streamed, size-capped body read that closes deterministically on
//! both timeout and cap. Response decoding respects the content type: JSON
//! becomes structured data, HTML is returned as a website-marked string,
//! images are base64-encoded.
//!
//! Redirects are never followed blindly: the HTTP client has redirects
//! disabled, and every `Location` target goes back through the URL policy
//! before a bounded follow-up request is issued. A guard-approved upstream
//! cannot bounce the proxy into a private or metadata address.
//!
//! Each attempt also feeds the per-offer circuit breaker. The breaker only
//! informs offer health for catalog visibility; it never short-circuits the
//! proxy path.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, Response, StatusCode, redirect};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::guard::{self, GuardError, UpstreamTarget};
use crate::store::Offer;

/// Default cap on upstream response bodies: 10 MiB.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Default upstream deadline.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How many policy-checked redirect hops a dispatch will follow.
const MAX_REDIRECTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("Offer declares an invalid HTTP method: {0}")]
    BadMethod(String),
    #[error("Internal upstream requires a configured API base")]
    NoApiBase,
    #[error("Upstream timed out")]
    Timeout,
    #[error("Upstream response exceeded {cap} bytes")]
    ResponseTooLarge { cap: usize },
    #[error("Upstream redirect is missing or unparseable")]
    BadRedirect,
    #[error("Upstream redirected more than {limit} times")]
    TooManyRedirects { limit: u32 },
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("Upstream request failed: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout)
    }
}

/// Decoded upstream response.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamData {
    Json(JsonValue),
    Website { html: String },
    Image { content_type: String, data: String },
    Text(String),
}

impl UpstreamData {
    /// The JSON value relayed to clients and recorded on the run.
    pub fn into_value(self) -> JsonValue {
        match self {
            UpstreamData::Json(value) => value,
            UpstreamData::Website { html } => {
                serde_json::json!({ "type": "website", "html": html })
            }
            UpstreamData::Image { content_type, data } => {
                serde_json::json!({ "type": "image", "contentType": content_type, "data": data })
            }
            UpstreamData::Text(text) => serde_json::json!({ "type": "text", "text": text }),
        }
    }

    /// A reward-validating upstream may override the offer's static reward
    /// with a tier-specific amount.
    pub fn dynamic_reward_amount(&self) -> Option<u64> {
        let UpstreamData::Json(value) = self else {
            return None;
        };
        let field = value
            .get("rewardAmount")
            .or_else(|| value.get("reward_amount"))?;
        field
            .as_u64()
            .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
    }
}

/// In-process breaker counters, one entry per offer.
#[derive(Default)]
pub struct CircuitBreaker {
    entries: DashMap<Uuid, BreakerEntry>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BreakerEntry {
    pub success: u64,
    pub failure: u64,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn record(&self, offer_id: Uuid, success: bool) -> BreakerEntry {
        let mut entry = self.entries.entry(offer_id).or_default();
        if success {
            entry.success += 1;
            entry.consecutive_failures = 0;
        } else {
            entry.failure += 1;
            entry.consecutive_failures += 1;
        }
        *entry
    }

    pub fn snapshot(&self, offer_id: Uuid) -> BreakerEntry {
        self.entries
            .get(&offer_id)
            .map(|e| *e)
            .unwrap_or_default()
    }
}

/// Bounded HTTP client for upstream calls.
pub struct UpstreamDispatcher {
    client: Client,
    api_base: Option<Url>,
    timeout: Duration,
    max_response_bytes: usize,
    breaker: Arc<CircuitBreaker>,
}

impl UpstreamDispatcher {
    pub fn new(api_base: Option<Url>, timeout: Duration, max_response_bytes: usize) -> Self {
        // Redirects must come back through the guard, so the client itself
        // never follows them.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .expect("HTTP client initializes");
        Self {
            client,
            api_base,
            timeout,
            max_response_bytes,
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Sends the merged payload to the offer's upstream and reads the capped
    /// response. Breaker accounting is the caller's job (it also persists
    /// the outcome); this method only performs the exchange.
    ///
    /// Each redirect hop re-enters the URL policy before it is followed, up
    /// to [`MAX_REDIRECTS`] hops.
    pub async fn dispatch(
        &self,
        offer: &Offer,
        payload: &JsonValue,
    ) -> Result<UpstreamData, UpstreamError> {
        let mut url = self.resolve(offer)?;
        let mut method = Method::from_bytes(offer.method.as_bytes())
            .map_err(|_| UpstreamError::BadMethod(offer.method.clone()))?;
        let mut body = Some(payload);

        for _ in 0..=MAX_REDIRECTS {
            let response = self.send_once(method.clone(), url.clone(), body).await?;
            let status = response.status();

            if status.is_redirection() {
                let next = redirect_target(&url, &response)?;
                self.authorize_redirect(&next)?;
                // 303 (and the legacy 301/302 POST semantics) downgrade to a
                // bodyless GET; 307/308 re-send the original request.
                if matches!(status.as_u16(), 301 | 302 | 303) {
                    method = Method::GET;
                    body = None;
                }
                tracing::debug!(from = %url, to = %next, "Following upstream redirect");
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    message: human_status_message(status),
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();

            let raw = read_capped(response.bytes_stream(), self.max_response_bytes, |e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })
            .await?;

            return Ok(decode_body(&content_type, raw));
        }
        Err(UpstreamError::TooManyRedirects {
            limit: MAX_REDIRECTS,
        })
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&JsonValue>,
    ) -> Result<Response, UpstreamError> {
        let mut request = self.client.request(method.clone(), url).timeout(self.timeout);
        match body {
            Some(payload) if method == Method::GET => {
                if let Some(fields) = payload.as_object() {
                    let pairs: Vec<(String, String)> = fields
                        .iter()
                        .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
                        .collect();
                    request = request.query(&pairs);
                }
            }
            Some(payload) => {
                request = request.json(payload);
            }
            None => {}
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })
    }

    fn resolve(&self, offer: &Offer) -> Result<Url, UpstreamError> {
        match guard::check_upstream_url(&offer.upstream_url)? {
            UpstreamTarget::External(url) => Ok(url),
            UpstreamTarget::Internal(path) => {
                let base = self.api_base.as_ref().ok_or(UpstreamError::NoApiBase)?;
                Ok(guard::resolve_internal(&path, base)?)
            }
        }
    }

    /// A redirect target must satisfy the same policy as an offer's upstream
    /// URL. Targets on the configured API base origin keep the internal
    /// bypass of the private-range rules.
    fn authorize_redirect(&self, next: &Url) -> Result<(), UpstreamError> {
        if let Some(base) = &self.api_base {
            if next.origin() == base.origin() {
                return match next.scheme() {
                    "http" | "https" => Ok(()),
                    _ => Err(GuardError::ForbiddenScheme.into()),
                };
            }
        }
        guard::check_upstream_url(next.as_str())?;
        Ok(())
    }
}

/// Resolves the `Location` header against the current URL.
fn redirect_target(current: &Url, response: &Response) -> Result<Url, UpstreamError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(UpstreamError::BadRedirect)?;
    current.join(location).map_err(|_| UpstreamError::BadRedirect)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads the stream into memory, aborting as soon as the accumulated size
/// would exceed `cap`. A body of exactly `cap` bytes succeeds.
async fn read_capped<S, B, E>(
    stream: S,
    cap: usize,
    map_err: impl Fn(E) -> UpstreamError,
) -> Result<Vec<u8>, UpstreamError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(&map_err)?;
        let chunk = chunk.as_ref();
        if buffer.len() + chunk.len() > cap {
            return Err(UpstreamError::ResponseTooLarge { cap });
        }
        buffer.extend_from_slice(chunk);
    }
    Ok(buffer)
}

fn decode_body(content_type: &str, body: Vec<u8>) -> UpstreamData {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    if essence == "application/json" || essence.ends_with("+json") {
        return match serde_json::from_slice(&body) {
            Ok(value) => UpstreamData::Json(value),
            Err(_) => UpstreamData::Text(String::from_utf8_lossy(&body).into_owned()),
        };
    }
    if essence == "text/html" {
        return UpstreamData::Website {
            html: String::from_utf8_lossy(&body).into_owned(),
        };
    }
    if essence.starts_with("image/") {
        return UpstreamData::Image {
            content_type: essence,
            data: BASE64.encode(&body),
        };
    }
    UpstreamData::Text(String::from_utf8_lossy(&body).into_owned())
}

fn human_status_message(status: StatusCode) -> String {
    match status.as_u16() {
        404 => "Upstream endpoint not found".to_string(),
        405 => "Upstream rejected the HTTP method".to_string(),
        401 | 403 => "Upstream denied access".to_string(),
        500..=599 => "Upstream internal error".to_string(),
        other => format!("Upstream returned status {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_chunks(chunks: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Unpin {
        stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn body_of_exactly_cap_bytes_succeeds() {
        let body = read_capped(ok_chunks(vec![vec![0u8; 512], vec![0u8; 512]]), 1_024, |e| {
            UpstreamError::Transport(e.to_string())
        })
        .await
        .unwrap();
        assert_eq!(body.len(), 1_024);
    }

    #[tokio::test]
    async fn body_of_cap_plus_one_aborts() {
        let error = read_capped(
            ok_chunks(vec![vec![0u8; 512], vec![0u8; 513]]),
            1_024,
            |e: std::io::Error| UpstreamError::Transport(e.to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, UpstreamError::ResponseTooLarge { cap: 1_024 }));
    }

    #[test]
    fn decode_json_html_image_and_text() {
        let json = decode_body("application/json; charset=utf-8", b"{\"sum\":3}".to_vec());
        assert_eq!(json, UpstreamData::Json(serde_json::json!({"sum": 3})));

        let html = decode_body("text/html", b"<h1>hi</h1>".to_vec());
        assert_eq!(
            html,
            UpstreamData::Website {
                html: "<h1>hi</h1>".into()
            }
        );

        let image = decode_body("image/png", vec![0x89, 0x50]);
        match image {
            UpstreamData::Image { content_type, data } => {
                assert_eq!(content_type, "image/png");
                assert_eq!(BASE64.decode(data).unwrap(), vec![0x89, 0x50]);
            }
            other => panic!("expected image, got {other:?}"),
        }

        let text = decode_body("text/plain", b"hello".to_vec());
        assert_eq!(text, UpstreamData::Text("hello".into()));

        // Malformed JSON degrades to text rather than failing the dispatch.
        let degraded = decode_body("application/json", b"not json".to_vec());
        assert_eq!(degraded, UpstreamData::Text("not json".into()));
    }

    #[test]
    fn status_messages_are_human() {
        assert_eq!(
            human_status_message(StatusCode::NOT_FOUND),
            "Upstream endpoint not found"
        );
        assert_eq!(
            human_status_message(StatusCode::METHOD_NOT_ALLOWED),
            "Upstream rejected the HTTP method"
        );
        assert_eq!(
            human_status_message(StatusCode::UNAUTHORIZED),
            "Upstream denied access"
        );
        assert_eq!(
            human_status_message(StatusCode::BAD_GATEWAY),
            "Upstream internal error"
        );
    }

    #[test]
    fn dynamic_reward_amount_reads_both_spellings() {
        let camel = UpstreamData::Json(serde_json::json!({"rewardAmount": 5_000}));
        assert_eq!(camel.dynamic_reward_amount(), Some(5_000));
        let snake = UpstreamData::Json(serde_json::json!({"reward_amount": "7500"}));
        assert_eq!(snake.dynamic_reward_amount(), Some(7_500));
        let none = UpstreamData::Json(serde_json::json!({"ok": true}));
        assert_eq!(none.dynamic_reward_amount(), None);
    }

    #[test]
    fn breaker_counts_consecutive_failures() {
        let breaker = CircuitBreaker::default();
        let offer = Uuid::new_v4();
        breaker.record(offer, false);
        breaker.record(offer, false);
        assert_eq!(breaker.snapshot(offer).consecutive_failures, 2);
        breaker.record(offer, true);
        let entry = breaker.snapshot(offer);
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.success, 1);
        assert_eq!(entry.failure, 2);
    }

    fn test_offer(upstream_url: String) -> Offer {
        use crate::chain::{Address, PaymentToken};
        use crate::store::{OfferMode, OfferStatus};
        use std::str::FromStr;
        Offer {
            id: Uuid::new_v4(),
            slug: "sum".into(),
            title: "Sum".into(),
            description: None,
            upstream_url,
            method: "POST".into(),
            price: 10_000,
            mode: OfferMode::Charge,
            status: OfferStatus::Active,
            payout_wallet: Address::from_str("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v")
                .unwrap(),
            payment_token: PaymentToken::Native,
            reward_amount: None,
            funded_wallet: None,
            max_claims_per_user: None,
            input_schema: None,
            creator_id: Uuid::new_v4(),
            run_count: 0,
            upstream_success: 0,
            upstream_failure: 0,
            consecutive_failures: 0,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_round_trips_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sum"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sum": 3})))
            .mount(&server)
            .await;

        // MockServer binds 127.0.0.1, which the guard rejects; the test goes
        // through the internal-path rewrite instead.
        let dispatcher = UpstreamDispatcher::new(
            Some(Url::parse(&server.uri()).unwrap()),
            UPSTREAM_TIMEOUT,
            MAX_RESPONSE_BYTES,
        );
        let offer = test_offer("/sum".into());
        let data = dispatcher
            .dispatch(&offer, &serde_json::json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(data, UpstreamData::Json(serde_json::json!({"sum": 3})));
    }

    #[tokio::test]
    async fn dispatch_maps_upstream_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sum"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = UpstreamDispatcher::new(
            Some(Url::parse(&server.uri()).unwrap()),
            UPSTREAM_TIMEOUT,
            MAX_RESPONSE_BYTES,
        );
        let offer = test_offer("/sum".into());
        let error = dispatcher
            .dispatch(&offer, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(error, UpstreamError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn dispatch_rejects_private_upstreams_before_any_request() {
        let dispatcher = UpstreamDispatcher::new(None, UPSTREAM_TIMEOUT, MAX_RESPONSE_BYTES);
        let offer = test_offer("http://169.254.169.254/latest".into());
        let error = dispatcher
            .dispatch(&offer, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::Guard(GuardError::MetadataAddress)
        ));
    }

    #[tokio::test]
    async fn redirect_to_metadata_address_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sum"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "http://169.254.169.254/latest/meta-data"),
            )
            .mount(&server)
            .await;

        let dispatcher = UpstreamDispatcher::new(
            Some(Url::parse(&server.uri()).unwrap()),
            UPSTREAM_TIMEOUT,
            MAX_RESPONSE_BYTES,
        );
        let offer = test_offer("/sum".into());
        let error = dispatcher
            .dispatch(&offer, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::Guard(GuardError::MetadataAddress)
        ));
    }

    #[tokio::test]
    async fn relative_redirect_on_api_base_is_followed_as_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sum"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/final"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/final"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sum": 3})))
            .mount(&server)
            .await;

        let dispatcher = UpstreamDispatcher::new(
            Some(Url::parse(&server.uri()).unwrap()),
            UPSTREAM_TIMEOUT,
            MAX_RESPONSE_BYTES,
        );
        let offer = test_offer("/sum".into());
        let data = dispatcher
            .dispatch(&offer, &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(data, UpstreamData::Json(serde_json::json!({"sum": 3})));
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sum"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/sum"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sum"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/sum"))
            .mount(&server)
            .await;

        let dispatcher = UpstreamDispatcher::new(
            Some(Url::parse(&server.uri()).unwrap()),
            UPSTREAM_TIMEOUT,
            MAX_RESPONSE_BYTES,
        );
        let offer = test_offer("/sum".into());
        let error = dispatcher
            .dispatch(&offer, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::TooManyRedirects { limit: MAX_REDIRECTS }
        ));
    }
}
