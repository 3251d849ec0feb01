//! Request classification: which limit applies and to which identity.

use crate::auth::{bearer_token, Claims, TokenVerifier};
use crate::config::{LimitClass, PolicyCache};
use crate::limiter::SlidingWindowLimiter;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// The request attributes classification looks at
#[derive(Debug, Clone, Default)]
pub struct RequestMeta<'a> {
    pub path: &'a str,
    pub authorization: Option<&'a str>,
    pub forwarded_for: Option<&'a str>,
    pub peer: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Bypassed,
    Limited {
        class: LimitClass,
        key: String,
        limit: u32,
        window: Duration,
        claims: Option<Claims>,
    },
}

/// Client address: first `X-Forwarded-For` hop, else the socket peer
pub fn client_ip(forwarded_for: Option<&str>, peer: Option<SocketAddr>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| canonical_ip(addr.ip()).to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

pub struct PolicySelector {
    verifier: Arc<dyn TokenVerifier>,
}

impl PolicySelector {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Classify a request. First match wins: bypass, auth prefix, AI
    /// prefix, authenticated user, public.
    pub fn select(&self, policy: &PolicyCache, meta: &RequestMeta<'_>) -> Selection {
        if policy.is_bypassed(meta.path) {
            return Selection::Bypassed;
        }

        let claims = meta
            .authorization
            .and_then(bearer_token)
            .and_then(|token| self.verifier.verify(token));
        let ip = || client_ip(meta.forwarded_for, meta.peer);

        let (class, identity) = if meta.path.starts_with(policy.auth_prefix()) {
            (LimitClass::Auth, ip())
        } else if meta.path.starts_with(policy.ai_prefix()) {
            match &claims {
                Some(c) => (LimitClass::Ai, c.user_id.clone()),
                None => (LimitClass::AiAnonymous, ip()),
            }
        } else {
            match &claims {
                Some(c) => (LimitClass::User, c.user_id.clone()),
                None => (LimitClass::Public, ip()),
            }
        };

        let limit = policy.class_limit(class);
        Selection::Limited {
            class,
            key: SlidingWindowLimiter::construct_key(class.key_segment(), &identity),
            limit: limit.limit,
            window: Duration::from_secs(limit.window_secs),
            claims,
        }
    }
}
