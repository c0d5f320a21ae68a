//! Diff engine backed by a remote diff service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::DiffError;
use crate::types::{Digest, Params};

use super::DiffEngine;

/// Default request timeout, matching the default lease duration.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct CalculateRequest<'a> {
    grouping: &'a Params,
    extra_digests: &'a [Digest],
}

/// Sends diff work to `POST {base_url}/calculate`.
pub struct HttpDiffEngine {
    base_url: String,
    http_client: Client,
}

impl HttpDiffEngine {
    /// Creates an engine for the diff service at `base_url`
    /// (e.g. "http://diffservice:8000").
    pub fn new(base_url: &str) -> Result<Self, DiffError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates an engine with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, DiffError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiffError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn calculate_url(&self) -> String {
        format!("{}/calculate", self.base_url)
    }
}

#[async_trait]
impl DiffEngine for HttpDiffEngine {
    async fn calculate_diffs(
        &self,
        grouping: &Params,
        extra_digests: &[Digest],
    ) -> Result<(), DiffError> {
        let request = CalculateRequest {
            grouping,
            extra_digests,
        };

        let response = self
            .http_client
            .post(self.calculate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| DiffError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(DiffError::Service {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn grouping() -> Params {
        let mut params = Params::new();
        params.insert("name".to_string(), "square".to_string());
        params
    }

    #[test]
    fn test_calculate_url_trims_trailing_slash() {
        let engine = HttpDiffEngine::new("http://diffservice:8000/").unwrap();
        assert_eq!(engine.calculate_url(), "http://diffservice:8000/calculate");
    }

    #[test]
    fn test_request_body_shape() {
        let params = grouping();
        let digests = vec![Digest::from("abc")];
        let body = serde_json::to_value(CalculateRequest {
            grouping: &params,
            extra_digests: &digests,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"grouping": {"name": "square"}, "extra_digests": ["abc"]})
        );
    }

    #[tokio::test]
    async fn test_calculate_diffs_posts_request() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let app = Router::new().route(
            "/calculate",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    StatusCode::OK
                }
            }),
        );
        let url = serve(app).await;

        let engine = HttpDiffEngine::new(&url).unwrap();
        engine
            .calculate_diffs(&grouping(), &[Digest::from("abc")])
            .await
            .unwrap();

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["extra_digests"][0], "abc");
    }

    #[tokio::test]
    async fn test_calculate_diffs_maps_service_errors() {
        let app = Router::new().route(
            "/calculate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "no images") }),
        );
        let url = serve(app).await;

        let engine = HttpDiffEngine::new(&url).unwrap();
        let err = engine.calculate_diffs(&grouping(), &[]).await.unwrap_err();
        match err {
            DiffError::Service { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "no images");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
