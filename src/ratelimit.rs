//! Sliding-window rate limiting.
//!
//! Each identifier owns an ordered window of admission timestamps. On every
//! check the window is pruned of entries older than `time_window`, and the
//! request is admitted iff fewer than `max_requests` remain. Identifiers whose
//! window has emptied are removed by [`RateLimiter::sweep`].
//!
//! Supports X-Forwarded-For header parsing for clients behind proxies.

use chrono::Utc;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How the limiter keys requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Client IP address.
    #[default]
    SourceAddress,
    /// Identity established by the authentication middleware.
    Identity,
    /// Value of the named request header.
    Header(String),
}

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests admitted per window.
    pub max_requests: usize,
    /// Width of the sliding window.
    pub time_window: Duration,
    /// Identifier strategy; falls back to source address when the value is absent.
    pub identifier: IdentifierKind,
    /// Whether to trust X-Forwarded-For / X-Real-IP headers.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            time_window: Duration::from_secs(60),
            identifier: IdentifierKind::SourceAddress,
            trust_forwarded_for: false,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, time_window: Duration) -> Self {
        Self {
            max_requests,
            time_window,
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, identifier: IdentifierKind) -> Self {
        self.identifier = identifier;
        self
    }

    /// Enables trusting X-Forwarded-For headers.
    ///
    /// **Security Warning**: Only enable this behind a trusted load balancer
    /// that sets the header. Untrusted clients can spoof it to dodge limits.
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Request attributes the limiter can key on.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub headers: &'a HeaderMap,
    pub remote_addr: Option<IpAddr>,
    pub identity: Option<&'a str>,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Time until the oldest retained request leaves the window.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Returns the `Retry-After` header value in seconds.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let secs = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        secs.max(1)
    }

    /// Writes `X-RateLimit-*` headers; `X-RateLimit-Reset` is a unix timestamp.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset_at = Utc::now().timestamp() as u64 + self.retry_after_secs();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at));
        if !self.allowed {
            headers.insert("retry-after", HeaderValue::from(self.retry_after_secs()));
        }
    }
}

/// Sliding-window rate limiter keyed by identifier.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Extracts the client IP from request headers.
    ///
    /// If `trust_forwarded_for` is enabled, attempts to parse the
    /// X-Forwarded-For header. Falls back to the provided socket address.
    pub fn extract_client_ip(
        &self,
        headers: &HeaderMap,
        socket_addr: Option<IpAddr>,
    ) -> Option<IpAddr> {
        if self.config.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim);
            if let Some(value) = forwarded {
                match IpAddr::from_str(value) {
                    Ok(ip) => return Some(ip),
                    Err(e) => warn!(header = %value, error = %e, "invalid IP in X-Forwarded-For header"),
                }
            }

            if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
                match IpAddr::from_str(value.trim()) {
                    Ok(ip) => return Some(ip),
                    Err(e) => warn!(header = %value, error = %e, "invalid IP in X-Real-IP header"),
                }
            }
        }

        socket_addr
    }

    /// Derives the window key for a request.
    pub fn identifier(&self, info: &RequestInfo<'_>) -> String {
        let chosen = match &self.config.identifier {
            IdentifierKind::SourceAddress => None,
            IdentifierKind::Identity => info.identity.map(|id| format!("id:{}", id)),
            IdentifierKind::Header(name) => info
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| format!("hdr:{}", v)),
        };

        chosen.unwrap_or_else(|| {
            match self.extract_client_ip(info.headers, info.remote_addr) {
                Some(ip) => format!("ip:{}", ip),
                None => "ip:unknown".to_string(),
            }
        })
    }

    /// Checks and, if admitted, records a request.
    pub fn check(&self, info: &RequestInfo<'_>) -> RateLimitDecision {
        let key = self.identifier(info);
        self.check_key_at(&key, Instant::now())
    }

    /// Checks an explicit identifier at the current time.
    pub fn check_key(&self, key: &str) -> RateLimitDecision {
        self.check_key_at(key, Instant::now())
    }

    /// Checks an explicit identifier at `now`.
    pub fn check_key_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let window = self.config.time_window;
        let limit = self.config.max_requests;

        let mut entry = self.windows.entry(key.to_string()).or_default();
        let timestamps = entry.value_mut();
        prune(timestamps, now, window);

        let allowed = timestamps.len() < limit;
        if allowed {
            timestamps.push_back(now);
        }

        let reset_after = timestamps
            .front()
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(window);

        let decision = RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(timestamps.len()),
            reset_after,
        };

        if !allowed {
            debug!(identifier = key, retry_after_ms = reset_after.as_millis(), "rate limit exceeded");
        }
        decision
    }

    /// Removes identifiers whose window is empty. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let window = self.config.time_window;
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "swept idle rate limit windows");
        }
        removed
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter(max: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(max, Duration::from_millis(window_ms)))
    }

    #[test]
    fn test_window_admits_then_denies_then_recovers() {
        let limiter = limiter(3, 1000);
        let start = Instant::now();

        for i in 0..3 {
            let d = limiter.check_key_at("c", start + Duration::from_millis(i * 10));
            assert!(d.allowed);
            assert_eq!(d.remaining, 2 - i as usize);
        }

        let denied = limiter.check_key_at("c", start + Duration::from_millis(500));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, Duration::from_millis(500));
        assert_eq!(denied.retry_after_secs(), 1);

        let later = limiter.check_key_at("c", start + Duration::from_millis(1100));
        assert!(later.allowed);
    }

    #[test]
    fn test_denied_request_is_not_recorded() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();
        assert!(limiter.check_key_at("c", start).allowed);
        for ms in [100, 200, 300] {
            assert!(!limiter.check_key_at("c", start + Duration::from_millis(ms)).allowed);
        }
        // Only the admitted request occupies the window.
        assert!(limiter.check_key_at("c", start + Duration::from_millis(1000)).allowed);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = limiter(1, 1000);
        let now = Instant::now();
        assert!(limiter.check_key_at("a", now).allowed);
        assert!(!limiter.check_key_at("a", now).allowed);
        assert!(limiter.check_key_at("b", now).allowed);
    }

    #[test]
    fn test_sweep_drops_empty_windows() {
        let limiter = limiter(5, 100);
        let start = Instant::now();
        limiter.check_key_at("a", start);
        limiter.check_key_at("b", start + Duration::from_millis(80));
        assert_eq!(limiter.tracked(), 2);

        assert_eq!(limiter.sweep_at(start + Duration::from_millis(120)), 1);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.sweep_at(start + Duration::from_millis(200)), 1);
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_identifier_strategies_fall_back_to_address() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let mut headers = HeaderMap::new();

        let by_header = RateLimiter::new(
            RateLimitConfig::default().with_identifier(IdentifierKind::Header("x-api-key".into())),
        );
        let info = RequestInfo {
            headers: &headers,
            remote_addr: Some(ip),
            identity: None,
        };
        assert_eq!(by_header.identifier(&info), "ip:192.168.1.1");

        headers.insert("x-api-key", HeaderValue::from_static("k-1"));
        let info = RequestInfo {
            headers: &headers,
            remote_addr: Some(ip),
            identity: None,
        };
        assert_eq!(by_header.identifier(&info), "hdr:k-1");

        let by_identity =
            RateLimiter::new(RateLimitConfig::default().with_identifier(IdentifierKind::Identity));
        let info = RequestInfo {
            headers: &headers,
            remote_addr: None,
            identity: Some("alice"),
        };
        assert_eq!(by_identity.identifier(&info), "id:alice");
        let anonymous = RequestInfo {
            headers: &headers,
            remote_addr: None,
            identity: None,
        };
        assert_eq!(by_identity.identifier(&anonymous), "ip:unknown");
    }

    #[test]
    fn test_extract_client_ip_no_trust() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());

        let socket_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            limiter.extract_client_ip(&headers, Some(socket_ip)),
            Some(socket_ip)
        );
    }

    #[test]
    fn test_extract_client_ip_trust_enabled() {
        let limiter = RateLimiter::new(RateLimitConfig::default().with_trust_forwarded_for(true));
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());

        let socket_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            limiter.extract_client_ip(&headers, Some(socket_ip)),
            Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );
    }

    #[test]
    fn test_extract_client_ip_x_real_ip_and_invalid() {
        let limiter = RateLimiter::new(RateLimitConfig::default().with_trust_forwarded_for(true));
        let socket_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(
            limiter.extract_client_ip(&headers, Some(socket_ip)),
            Some(socket_ip)
        );

        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(
            limiter.extract_client_ip(&headers, Some(socket_ip)),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn test_decision_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_after: Duration::from_millis(2500),
        };
        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "3");
        assert!(headers.contains_key("x-ratelimit-reset"));
    }
}
