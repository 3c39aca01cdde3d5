use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use wa_sandbox::SandboxResponse;

/// Per-installation credential header required on every execute call.
pub const ACCESS_KEY_HEADER: &str = "x-wpagent-key";

/// Holds only the SHA-256 digest of the configured key.
#[derive(Debug, Clone)]
pub struct AccessKeyPolicy {
    digest: [u8; 32],
}

impl AccessKeyPolicy {
    pub fn new(access_key: &str) -> anyhow::Result<Self> {
        let access_key = access_key.trim();
        if access_key.is_empty() {
            return Err(anyhow::anyhow!("site.access_key is required to serve"));
        }
        Ok(Self {
            digest: digest(access_key),
        })
    }

    fn matches(&self, provided: &str) -> bool {
        let provided = digest(provided.trim());
        // Fixed-length fold so the comparison does not stop at the first mismatch.
        self.digest
            .iter()
            .zip(provided.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[derive(Debug, Clone)]
pub struct AccessKeyPolicyExt(pub Arc<AccessKeyPolicy>);

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

fn access_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(ACCESS_KEY_HEADER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(raw)
}

fn unauthorized_with_context(code: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(error_code = code, error = %message, "sandbox request rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(SandboxResponse::failure(code, message)),
    )
        .into_response()
}

/// Rejects the request before any action logic runs unless it carries the
/// configured access key.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_access_key(req: Request<Body>, next: Next) -> Response {
    let Some(policy) = req
        .extensions()
        .get::<AccessKeyPolicyExt>()
        .map(|v| v.0.clone())
    else {
        return unauthorized_with_context(
            "access_key_not_configured",
            "server has no access key configured",
        );
    };
    let Some(provided) = access_key_from_headers(req.headers()) else {
        return unauthorized_with_context(
            "missing_access_key",
            format!("missing {ACCESS_KEY_HEADER} header"),
        );
    };
    if !policy.matches(provided) {
        return unauthorized_with_context("invalid_access_key", "invalid access key");
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::to_bytes;
    use axum::extract::Extension;
    use axum::middleware;
    use axum::routing::post;
    use serde_json::json;
    use tower::util::ServiceExt;

    fn build_auth_test_router(policy: Option<AccessKeyPolicy>) -> Router {
        let router = Router::new()
            .route(
                "/wp-agent/v1/execute",
                post(|| async { Json(json!({ "success": true })) }),
            )
            .layer(middleware::from_fn(require_access_key));
        match policy {
            Some(policy) => router.layer(Extension(AccessKeyPolicyExt(Arc::new(policy)))),
            None => router,
        }
    }

    fn execute_request(key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/wp-agent/v1/execute");
        if let Some(key) = key {
            builder = builder.header(ACCESS_KEY_HEADER, key);
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn response_body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }

    #[test]
    fn empty_access_key_cannot_build_a_policy() {
        assert!(AccessKeyPolicy::new("  ").is_err());
    }

    #[test]
    fn keys_match_after_trimming() {
        let policy = AccessKeyPolicy::new("s3cret").expect("policy");
        assert!(policy.matches("s3cret"));
        assert!(policy.matches(" s3cret\n"));
        assert!(!policy.matches("s3cre"));
        assert!(!policy.matches("S3CRET"));
    }

    #[tokio::test]
    async fn missing_key_is_rejected() {
        let app = build_auth_test_router(Some(AccessKeyPolicy::new("s3cret").expect("policy")));
        let response = app.oneshot(execute_request(None)).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "missing_access_key");
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let app = build_auth_test_router(Some(AccessKeyPolicy::new("s3cret").expect("policy")));
        let response = app
            .oneshot(execute_request(Some("guess")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_body_json(response).await;
        assert_eq!(body["error_code"], "invalid_access_key");
    }

    #[tokio::test]
    async fn matching_key_reaches_the_handler() {
        let app = build_auth_test_router(Some(AccessKeyPolicy::new("s3cret").expect("policy")));
        let response = app
            .oneshot(execute_request(Some("s3cret")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unconfigured_policy_denies_everything() {
        let app = build_auth_test_router(None);
        let response = app
            .oneshot(execute_request(Some("anything")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_body_json(response).await;
        assert_eq!(body["error_code"], "access_key_not_configured");
    }
}
