use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::limiter::LimitDecision;
use crate::policy::{RequestMeta, Selection};
use crate::server::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
}

fn too_many_requests(decision: &LimitDecision) -> Response {
    let window = decision.window.as_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "detail": format!("Rate limit exceeded. Try again in {} seconds.", window)
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    add_rate_limit_headers(headers, decision.limit, 0);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(window));
    // Upper bound: the window restarts no later than now + window
    let reset = Utc::now().timestamp().max(0) as u64 + window;
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset));

    response
}

/// Classify, check the limiter, then either refuse with 429 or run the
/// handler and annotate the response.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let policy = state.policy.load_full();

    if !policy.rate_limit_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let selection = {
        let headers = request.headers();
        let meta = RequestMeta {
            path: request.uri().path(),
            authorization: header_str(headers, header::AUTHORIZATION.as_str()),
            forwarded_for: header_str(headers, "x-forwarded-for"),
            peer,
        };
        state.selector.select(&policy, &meta)
    };

    let (class, key, limit, window) = match selection {
        Selection::Bypassed => {
            crate::metrics::record_bypass();
            return next.run(request).await;
        }
        Selection::Limited {
            class,
            key,
            limit,
            window,
            ..
        } => (class, key, limit, window),
    };

    let decision = state.limiter.check(&key, limit, window).await;
    crate::metrics::record_request(class.as_str(), decision.allowed);

    if !decision.allowed {
        warn!(
            class = %class,
            key = %key,
            limit = limit,
            window_secs = window.as_secs(),
            "Rate limit exceeded"
        );
        return too_many_requests(&decision);
    }

    debug!(
        "Admitted {} {} as {} ({} remaining)",
        request.method(),
        request.uri().path(),
        class,
        decision.remaining
    );

    let mut response = next.run(request).await;
    add_rate_limit_headers(response.headers_mut(), decision.limit, decision.remaining);
    response
}
