//! Handling of plain (non-upgrade) HTTP requests.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chatwire_auth::TokenValidator;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ServerError;
use crate::health;
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::websocket::handshake::OriginPolicy;
use crate::websocket::registry::ConnectionRegistry;

/// Answers one framed HTTP request. The connection is closed after the
/// response is written.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the response for `req`. An error becomes a JSON 500.
    async fn handle(&self, req: HttpRequest) -> Result<HttpResponse, ServerError>;
}

#[derive(Deserialize)]
struct ValidateTokenRequest {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct ValidateTokenResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

/// Built-in routes: health, metrics, token validation, CORS preflight.
pub struct ApiHandler {
    start_time: Instant,
    registry: Arc<ConnectionRegistry>,
    validator: Arc<dyn TokenValidator>,
    origins: OriginPolicy,
    metrics: Option<PrometheusHandle>,
}

impl ApiHandler {
    /// Handler reporting on `registry` and validating with `validator`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        validator: Arc<dyn TokenValidator>,
        origins: OriginPolicy,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            registry,
            validator,
            origins,
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn health(&self) -> HttpResponse {
        let body = health::health_check(
            self.start_time,
            self.registry.len(),
            self.registry.authenticated_count(),
        );
        HttpResponse::json(200, &body)
    }

    fn metrics(&self) -> HttpResponse {
        match &self.metrics {
            Some(handle) => HttpResponse::new(200).with_body(
                "text/plain; version=0.0.4; charset=utf-8",
                crate::metrics::render(handle),
            ),
            None => HttpResponse::error(503, "Metrics recorder not installed"),
        }
    }

    fn validate_token(&self, req: &HttpRequest) -> HttpResponse {
        let Ok(body) = serde_json::from_slice::<ValidateTokenRequest>(&req.body) else {
            return HttpResponse::error(400, "Invalid request");
        };
        let principal = body
            .token
            .as_deref()
            .and_then(|token| self.validator.validate(token));
        HttpResponse::json(
            200,
            &ValidateTokenResponse {
                valid: principal.is_some(),
                user_id: principal.as_ref().map(|p| p.user_id),
                username: principal.map(|p| p.username),
            },
        )
    }

    /// Echo an allow-listed `Origin` so browsers accept the response.
    fn with_cors(&self, req: &HttpRequest, resp: HttpResponse) -> HttpResponse {
        match req.header("origin") {
            Some(origin) if self.origins.allows(Some(origin)) => resp
                .with_header("Access-Control-Allow-Origin", origin)
                .with_header("Access-Control-Allow-Credentials", "true"),
            _ => resp,
        }
    }
}

#[async_trait]
impl RequestHandler for ApiHandler {
    async fn handle(&self, req: HttpRequest) -> Result<HttpResponse, ServerError> {
        debug!(method = %req.method, path = %req.path, "http request");
        let resp = match (req.method, req.path.as_str()) {
            (Method::Options, _) => HttpResponse::new(204)
                .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Content-Type, Authorization")
                .with_header("Access-Control-Max-Age", "86400"),
            (Method::Get, "/health") => self.health(),
            (Method::Get, "/metrics") => self.metrics(),
            (Method::Post, "/api/validate-token") => self.validate_token(&req),
            (_, path) => HttpResponse::error(404, &format!("Not found: {path}")),
        };
        Ok(self.with_cors(&req, resp))
    }
}
