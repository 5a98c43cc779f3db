use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use stride_core::documents::{ChildDocument, DocumentStore, is_valid_collection};
use stride_core::models::Document;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
pub(crate) struct AppState {
    store: Arc<DocumentStore>,
    api_key: Option<String>,
}

impl AppState {
    pub(crate) fn new(store: DocumentStore, api_key: Option<String>) -> Self {
        Self {
            store: Arc::new(store),
            api_key,
        }
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct WriteQuery {
    #[serde(default = "default_merge")]
    merge: bool,
}

fn default_merge() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
pub(crate) struct CreatedResponse {
    pub(crate) id: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn get_user_document(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    state
        .store
        .get_user_document(&user_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No document for user '{user_id}'")))
}

async fn set_user_document(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<WriteQuery>,
    Json(doc): Json<Document>,
) -> Result<StatusCode, ApiError> {
    state.store.set_user_document(&user_id, doc, query.merge)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_child_document(
    State(state): State<AppState>,
    Path((user_id, collection)): Path<(String, String)>,
    Json(doc): Json<Document>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    if !is_valid_collection(&collection) {
        return Err(ApiError::BadRequest(format!(
            "Invalid collection name '{collection}'"
        )));
    }
    let id = state
        .store
        .create_child_document(&user_id, &collection, doc)?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn list_child_documents(
    State(state): State<AppState>,
    Path((user_id, collection)): Path<(String, String)>,
) -> Result<Json<Vec<ChildDocument>>, ApiError> {
    if !is_valid_collection(&collection) {
        return Err(ApiError::BadRequest(format!(
            "Invalid collection name '{collection}'"
        )));
    }
    Ok(Json(
        state.store.list_child_documents(&user_id, &collection)?,
    ))
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/users/{uid}",
            get(get_user_document).put(set_user_document),
        )
        .route(
            "/api/users/{uid}/{collection}",
            get(list_child_documents).post(create_child_document),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    store: DocumentStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(store, api_key.clone()));

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see server_api_key file in data directory)",
            mask_key(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

/// First and last four characters, or all stars for short keys.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(api_key: Option<String>) -> AppState {
        AppState::new(DocumentStore::open_in_memory().unwrap(), api_key)
    }

    fn test_app(api_key: Option<String>) -> Router {
        build_router(test_state(api_key))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_reaches_handler() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Authorized, but nothing stored yet
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app(None);

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/users/u1/meals")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/remote.db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
    }

    #[tokio::test]
    async fn put_then_get_user_document_merges() {
        let app = test_app(None);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/users/u1?merge=false",
                &serde_json::json!({"name": "Ada", "height": 170}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        app.clone()
            .oneshot(json_request(
                "PUT",
                "/api/users/u1",
                &serde_json::json!({"name": "Ada Lovelace"}),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "Ada Lovelace");
        assert_eq!(json["height"], 170);
    }

    #[tokio::test]
    async fn create_child_returns_same_id_for_same_local_id() {
        let app = test_app(None);
        let doc = serde_json::json!({"localId": "abc", "weight": 70.5});

        let first = app
            .clone()
            .oneshot(json_request("POST", "/api/users/u1/weights", &doc))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = body_json(first).await;

        let second = app
            .clone()
            .oneshot(json_request("POST", "/api/users/u1/weights", &doc))
            .await
            .unwrap();
        let second = body_json(second).await;
        assert_eq!(first["id"], second["id"]);

        let listed = app
            .oneshot(
                axum::http::Request::get("/api/users/u1/weights")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(listed).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["fields"]["weight"], 70.5);
    }

    #[tokio::test]
    async fn invalid_collection_returns_400() {
        let app = test_app(None);
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/users/u1/bad%20name",
                &serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_object_body_is_rejected() {
        let app = test_app(None);
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/users/u1/meals",
                &serde_json::json!([1, 2, 3]),
            ))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn mask_key_handles_short_and_multibyte_keys() {
        assert_eq!(mask_key("0123456789abcdef"), "0123...cdef");
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("ééééxxxxxxxxüüüü"), "éééé...üüüü");
    }
}
