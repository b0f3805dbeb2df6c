use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use axum_extra::extract::cookie::{Cookie, Key, PrivateCookieJar, SameSite};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use subtle::ConstantTimeEq;
use time::Duration;

use crate::error::EmbarkError;
use crate::router::EmbarkState;

pub const SESSION_COOKIE: &str = "embark_session";
const SESSION_HOURS: i64 = 12;

/// An empty `expected` key matches nothing.
pub fn key_matches(candidate: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
}

/// Non-browser clients may authenticate with the shared key instead of a session.
/// Accepts either:
/// - Header: `x-embark-key: ...`
/// - Header: `Authorization: Bearer ...`
/// - Query string: `?key=...`
pub fn has_valid_key(headers: &HeaderMap, query: Option<&str>, expected: &str) -> bool {
    if let Some(hv) = headers.get("x-embark-key").and_then(|v| v.to_str().ok())
        && key_matches(hv, expected)
    {
        return true;
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let auth = auth.trim();
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            && key_matches(token, expected)
        {
            return true;
        }
    }

    if let Some(qs) = query {
        for (k, v) in url::form_urlencoded::parse(qs.as_bytes()) {
            if k == "key" && key_matches(&v, expected) {
                return true;
            }
        }
    }
    false
}

/// The session cookie stores its issue time; the jar encrypts and signs it.
pub fn session_valid(value: &str, now: DateTime<Utc>) -> bool {
    let Ok(issued) = DateTime::parse_from_rfc3339(value) else {
        return false;
    };
    let age = now - issued.with_timezone(&Utc);
    age >= ChronoDuration::zero() && age < ChronoDuration::hours(SESSION_HOURS)
}

pub fn session_cookie(insecure: bool) -> Cookie<'static> {
    Cookie::build(Cookie::new(SESSION_COOKIE, Utc::now().to_rfc3339()))
        .path("/")
        .http_only(true)
        .secure(!insecure)
        .same_site(SameSite::Lax)
        .max_age(Duration::hours(SESSION_HOURS))
        .build()
}

pub fn clear_session_cookie() -> Cookie<'static> {
    Cookie::build(Cookie::new(SESSION_COOKIE, ""))
        .path("/")
        .build()
}

/// Extractor guarding every route except login.
#[derive(Debug, Clone, Copy)]
pub struct RequireLogin;

impl FromRequestParts<EmbarkState> for RequireLogin {
    type Rejection = EmbarkError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &EmbarkState,
    ) -> Result<Self, Self::Rejection> {
        if has_valid_key(&parts.headers, parts.uri.query(), &state.embark_key) {
            return Ok(Self);
        }

        let Ok(jar) = PrivateCookieJar::<Key>::from_request_parts(parts, state).await;
        match jar.get(SESSION_COOKIE) {
            Some(cookie) if session_valid(cookie.value(), Utc::now()) => Ok(Self),
            _ => Err(EmbarkError::Unauthorized),
        }
    }
}
