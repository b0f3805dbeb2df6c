use axum::{
    Form, Json,
    extract::{ConnectInfo, State},
    http::Extensions,
    response::IntoResponse,
};
use axum_extra::extract::cookie::PrivateCookieJar;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{info, warn};

use crate::forms::LoginForm;
use crate::middleware::auth::{clear_session_cookie, key_matches, session_cookie};
use crate::{EmbarkError, router::EmbarkState};

const LIMITER_RETAIN_THRESHOLD: usize = 4096;

/// Peer address from `into_make_service_with_connect_info`; unknown peers share one bucket.
fn client_ip(extensions: &Extensions) -> IpAddr {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// POST {login_url} -> checks the shared key and opens a session.
pub async fn login(
    State(state): State<EmbarkState>,
    extensions: Extensions,
    jar: PrivateCookieJar,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, EmbarkError> {
    let client = client_ip(&extensions);
    if state.login_limiter.check_key(&client).is_err() {
        warn!(%client, "login rate limit hit");
        return Err(EmbarkError::RateLimited);
    }
    if state.login_limiter.len() > LIMITER_RETAIN_THRESHOLD {
        state.login_limiter.retain_recent();
    }
    if !key_matches(&form.key, &state.embark_key) {
        warn!(%client, "login with invalid key");
        return Err(EmbarkError::Unauthorized);
    }

    info!("login successful");
    let jar = jar.add(session_cookie(state.cfg.insecure_cookie));
    Ok((jar, Json(json!({ "login": "ok" }))))
}

/// GET /logout/ -> drops the session cookie.
pub async fn logout(jar: PrivateCookieJar) -> impl IntoResponse {
    (jar.remove(clear_session_cookie()), Json(json!({ "logout": "ok" })))
}
