//! 推論サービスのエラー型
//!
//! どのエラーも `{ "success": false, "error": ... }` 形式の JSON で返します。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::verdict::DataIntegrityError;

/// リクエスト処理中のエラー
#[derive(Error, Debug)]
pub enum ServiceError {
    /// モデルが読み込まれていない
    #[error("Model not loaded. Please check server logs.")]
    Unavailable,

    /// リクエストの不備（画像なし・multipart 不正など）
    #[error("{0}")]
    BadRequest(String),

    /// アップロードが上限サイズを超えた
    #[error("Uploaded file is too large (limit {0} bytes).")]
    PayloadTooLarge(usize),

    /// ラベル表とモデルの不整合
    #[error("{0}")]
    DataIntegrity(DataIntegrityError),

    /// その他の失敗（デコード・推論エラーなど）
    #[error("An internal server error occurred: {0}")]
    Internal(String),
}

impl ServiceError {
    /// 画像が添付されていない
    pub fn no_image() -> Self {
        ServiceError::BadRequest("No image provided in the request.".to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Unavailable
            | ServiceError::DataIntegrity(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Internal(format!("{:#}", e))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ServiceError::DataIntegrity(_) => json!({
                "success": false,
                "status": "data_error",
                "error": self.to_string(),
            }),
            _ => json!({
                "success": false,
                "error": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
