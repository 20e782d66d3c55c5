//! HTTP 推論サーバー
//!
//! - `GET /`         アップロード用ページ
//! - `POST /predict` multipart の `image` フィールドを判定
//! - `GET /health`   稼働状況
//! - `GET /info`     モデル情報

use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::model::model_metadata::{DATASET_NAME, MODEL_NAME};
use crate::model::ServerSettings;
use crate::preprocess::IMAGE_SIZE;
use crate::service::ServiceContext;
use crate::verdict::Verdict;

const INDEX_HTML: &str = include_str!("index.html");

/// アップロード画像を受け取る multipart フィールド名
const IMAGE_FIELD: &str = "image";

const UNRECOGNIZED_MESSAGE: &str = "No math symbol recognised.";

/// 各ハンドラーに渡す状態
#[derive(Clone)]
struct AppState {
    ctx: Arc<ServiceContext>,
    max_upload_bytes: usize,
}

/// ルーターを構築
pub fn router(ctx: Arc<ServiceContext>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/info", get(model_info))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState {
            ctx,
            max_upload_bytes,
        })
}

/// サーバーを起動して終了まで待つ
pub async fn serve(settings: &ServerSettings, ctx: Arc<ServiceContext>) -> Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("サーバーを起動しました: http://{}", listener.local_addr()?);
    axum::serve(listener, router(ctx, settings.max_upload_bytes))
        .await
        .context("Server error")?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// multipart の読み込みエラーを応答に変換する
///
/// 上限超過だけは 413、それ以外は画像なしとして扱う。
fn upload_error(e: MultipartError, max_upload_bytes: usize) -> ServiceError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("アップロードが上限 {} バイトを超えました: {}", max_upload_bytes, e);
        return ServiceError::PayloadTooLarge(max_upload_bytes);
    }
    warn!("multipart の解析に失敗しました: {}", e);
    ServiceError::no_image()
}

/// `image` フィールドの中身を取り出す
///
/// フィールドが無い・ファイル名が空・中身が空のときは `BadRequest`。
async fn read_image_field(mut multipart: Multipart, max_upload_bytes: usize) -> Result<Vec<u8>, ServiceError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ServiceError::no_image()),
            Err(e) => return Err(upload_error(e, max_upload_bytes)),
        };

        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let has_file_name = field.file_name().is_some_and(|name| !name.is_empty());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| upload_error(e, max_upload_bytes))?;

        if !has_file_name || bytes.is_empty() {
            return Err(ServiceError::no_image());
        }
        return Ok(bytes.to_vec());
    }
}

fn verdict_response(verdict: Verdict) -> Result<Json<Value>, ServiceError> {
    match verdict {
        Verdict::Recognized {
            latex,
            unicode,
            confidence,
            ..
        } => Ok(Json(json!({
            "success": true,
            "status": "recognized",
            "symbol": unicode,
            "unicode": unicode,
            "latex": latex,
            "confidence": confidence * 100.0,
        }))),
        Verdict::Unrecognized => Ok(Json(json!({
            "success": true,
            "status": "unrecognized",
            "message": UNRECOGNIZED_MESSAGE,
        }))),
        Verdict::DataError(e) => Err(ServiceError::DataIntegrity(e)),
    }
}

async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ServiceError> {
    let ctx = state.ctx;
    if !ctx.model_loaded() {
        return Err(ServiceError::Unavailable);
    }

    let multipart = multipart.map_err(|e| {
        warn!("multipart リクエストではありません: {}", e.body_text());
        ServiceError::no_image()
    })?;
    let bytes = read_image_field(multipart, state.max_upload_bytes).await?;

    // 推論はブロッキングスレッドで行う
    let worker_ctx = ctx.clone();
    let verdict = tokio::task::spawn_blocking(move || worker_ctx.predict_image(&bytes))
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
        .inspect_err(|e| {
            if matches!(e, ServiceError::Internal(_)) {
                error!("予測に失敗しました: {}", e);
            }
        })?;

    verdict_response(verdict)
}

async fn health(State(AppState { ctx, .. }): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "model_loaded": ctx.model_loaded(),
        "labels_loaded": ctx.labels_loaded(),
        "num_classes": ctx.num_classes(),
    }))
}

async fn model_info(State(AppState { ctx, .. }): State<AppState>) -> Response {
    if !ctx.model_loaded() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Model not loaded" })),
        )
            .into_response();
    }

    Json(json!({
        "model_name": MODEL_NAME,
        "num_classes": ctx.num_classes(),
        "input_shape": [IMAGE_SIZE, IMAGE_SIZE, 1],
        "framework": "Burn",
        "dataset": DATASET_NAME,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{alpha_table, blank_png, stroke_png, StubClassifier};
    use crate::service::SymbolClassifier;
    use crate::symbols::SymbolTable;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    const BOUNDARY: &str = "MATHOCRBOUNDARY";
    const UPLOAD_LIMIT: usize = 1024 * 1024;

    fn multipart_body(field: &str, file_name: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn predict_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn app_with(stub: Option<Arc<StubClassifier>>, symbols: SymbolTable) -> Router {
        let classifier = stub.map(|s| s as Arc<dyn SymbolClassifier>);
        router(
            Arc::new(ServiceContext::new(classifier, symbols)),
            UPLOAD_LIMIT,
        )
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_predict_recognized() {
        let stub = Arc::new(StubClassifier::new(vec![0.9, 0.1]));
        let app = app_with(Some(stub.clone()), alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "alpha.png", &stroke_png())),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "success": true,
                "status": "recognized",
                "symbol": "α",
                "unicode": "α",
                "latex": "\\alpha",
                "confidence": 90.0,
            })
        );
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_predict_blank_upload_is_unrecognized() {
        let stub = Arc::new(StubClassifier::new(vec![0.99, 0.01]));
        let app = app_with(Some(stub.clone()), alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "blank.png", &blank_png())),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "unrecognized");
        assert_eq!(body["message"], "No math symbol recognised.");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_without_model() {
        let app = app_with(None, alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "alpha.png", &stroke_png())),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Model not loaded. Please check server logs.");
    }

    #[tokio::test]
    async fn test_predict_without_image_field() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let app = app_with(Some(stub), alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("file", "alpha.png", &stroke_png())),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "No image provided in the request.");
    }

    #[tokio::test]
    async fn test_predict_empty_file_name() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let app = app_with(Some(stub), alpha_table());

        let (status, _) = send(
            app,
            predict_request(multipart_body("image", "", &stroke_png())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_predict_not_multipart() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let app = app_with(Some(stub), alpha_table());

        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_predict_oversized_upload() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let ctx = ServiceContext::new(Some(stub.clone() as Arc<dyn SymbolClassifier>), alpha_table());
        let app = router(Arc::new(ctx), 1024);

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "big.png", &vec![0u8; 8 * 1024])),
        )
        .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Uploaded file is too large (limit 1024 bytes).");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_missing_label_is_data_error() {
        let stub = Arc::new(StubClassifier::new(vec![0.05, 0.95]));
        let app = app_with(Some(stub), alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "x.png", &stroke_png())),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["status"], "data_error");
        assert_eq!(body["error"], "Label file mismatch. Index 1 not found.");
    }

    #[tokio::test]
    async fn test_predict_undecodable_image() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let app = app_with(Some(stub), alpha_table());

        let (status, body) = send(
            app,
            predict_request(multipart_body("image", "x.png", b"not a png")),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("An internal server error occurred:"));
    }

    #[tokio::test]
    async fn test_health() {
        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let (status, body) = send(app_with(Some(stub), alpha_table()), get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["labels_loaded"], true);
        assert_eq!(body["num_classes"], 1);

        let (_, body) = send(app_with(None, SymbolTable::new()), get("/health")).await;
        assert_eq!(body["model_loaded"], false);
        assert_eq!(body["labels_loaded"], false);
        assert_eq!(body["num_classes"], 0);
    }

    #[tokio::test]
    async fn test_info() {
        let (status, body) = send(app_with(None, alpha_table()), get("/info")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Model not loaded");

        let stub = Arc::new(StubClassifier::new(vec![1.0]));
        let (status, body) = send(app_with(Some(stub), alpha_table()), get("/info")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["framework"], "Burn");
        assert_eq!(body["dataset"], "HASYv2");
        assert_eq!(body["input_shape"], json!([32, 32, 1]));
        assert_eq!(body["num_classes"], 1);
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = app_with(None, SymbolTable::new())
            .oneshot(get("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
