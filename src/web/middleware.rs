//! Bearer-key guard for the admin routes

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::error::AppError;

/// Extract the key of an `Authorization: Bearer <key>` header
fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let key = value.strip_prefix("Bearer ")?.trim();
    (!key.is_empty()).then_some(key)
}

#[derive(Clone)]
pub struct AdminAuthLayer {
    api_key: Arc<str>,
}

impl AdminAuthLayer {
    /// An empty key locks the admin routes entirely.
    pub fn new(api_key: &str) -> Self {
        Self { api_key: api_key.into() }
    }
}

impl<S> Layer<S> for AdminAuthLayer {
    type Service = AdminAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminAuthMiddleware {
            inner,
            api_key: self.api_key.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdminAuthMiddleware<S> {
    inner: S,
    api_key: Arc<str>,
}

impl<S> Service<Request<Body>> for AdminAuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let authorized = !self.api_key.is_empty() && bearer_key(request.headers()) == Some(&*self.api_key);
        if !authorized {
            warn!(path = %request.uri().path(), "Rejected admin request without a valid key");
            return Box::pin(async { Ok(AppError::AdminUnauthorized.into_response()) });
        }

        // The clone that was polled ready is the one that serves the call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_key_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_key(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(bearer_key(&headers), Some("secret"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("PenguinID 12345"));
        assert_eq!(bearer_key(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_key(&headers), None);
    }
}
