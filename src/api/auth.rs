//! Optional bearer-token authentication for the API surface.
//!
//! Active only when an app auth token is configured; unauthenticated
//! deployments (the default) pass every request through.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::state::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let configured = state
        .settings
        .http
        .auth_token
        .as_deref()
        .filter(|token| !token.is_empty());

    let Some(expected) = configured else {
        return Ok(next.run(request).await);
    };

    let token = bearer_token(request.headers())?;
    if token != expected {
        return Err(ApiError::unauthorized("unauthorized"));
    }

    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing token"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid token"))?;
    value
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("invalid token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_extracted() {
        let headers = headers_with("Bearer s3cret");
        assert_eq!(bearer_token(&headers).unwrap(), "s3cret");
    }

    #[test]
    fn test_missing_header_rejected() {
        let err = bearer_token(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "missing token");
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let headers = headers_with("Basic abc");
        assert_eq!(bearer_token(&headers).unwrap_err().to_string(), "invalid token");
    }

    #[test]
    fn test_empty_bearer_rejected() {
        let headers = headers_with("Bearer ");
        assert!(bearer_token(&headers).is_err());
    }
}
