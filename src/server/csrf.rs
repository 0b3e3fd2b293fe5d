use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::server::{errors::ApiError, AppState};

/// The session cookie a CSRF token is bound to.
pub const SESSION_COOKIE: &str = "sync_session";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Sessions and their tokens live for a day.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How much of a mutating body is inspected for an inline `_csrf` field.
const BODY_INSPECTION_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
struct IssuedToken {
    token: String,
    issued_at: Instant,
}

/// CSRF tokens bound to session cookies. Issuing for a known session
/// rotates its token.
#[derive(Debug, Default)]
pub struct CsrfTokens {
    sessions: DashMap<String, IssuedToken>,
}

impl CsrfTokens {
    /// Issues (or rotates) a token for the session, creating a session id
    /// when the client has none yet.
    pub fn issue(&self, session: Option<&str>) -> (String, String) {
        self.purge_expired();

        let session = session
            .map(str::to_string)
            .unwrap_or_else(|| random_token(32));
        let token = random_token(48);

        self.sessions.insert(
            session.clone(),
            IssuedToken {
                token: token.clone(),
                issued_at: Instant::now(),
            },
        );

        (session, token)
    }

    pub fn verify(&self, session: &str, token: &str) -> bool {
        self.sessions
            .get(session)
            .map(|issued| {
                issued.token == token && issued.issued_at.elapsed() < SESSION_TTL
            })
            .unwrap_or(false)
    }

    fn purge_expired(&self) {
        self.sessions
            .retain(|_, issued| issued.issued_at.elapsed() < SESSION_TTL);
    }
}

pub fn random_token(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// The `Set-Cookie` value binding a session to the client.
pub fn session_cookie(session: &str) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age=86400",
        SESSION_COOKIE, session
    )
}

pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;

    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Requires a valid CSRF token on every mutating request. The token may
/// arrive in the `x-csrf-token` header or as a `_csrf` body field.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return Ok(next.run(request).await);
    }

    let session =
        session_from_headers(request.headers()).ok_or(ApiError::CsrfRejected)?;

    if let Some(token) = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if state.csrf.verify(&session, token) {
            return Ok(next.run(request).await);
        }

        return Err(ApiError::CsrfRejected);
    }

    // Fall back to an inline body field
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, BODY_INSPECTION_LIMIT)
        .await
        .map_err(|_| ApiError::CsrfRejected)?;

    let token = body_token(&bytes).ok_or(ApiError::CsrfRejected)?;

    if !state.csrf.verify(&session, &token) {
        return Err(ApiError::CsrfRejected);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

fn body_token(bytes: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;

    value.get("_csrf")?.as_str().map(str::to_string)
}
