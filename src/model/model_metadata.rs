//! モデルメタデータの定義
//!
//! モデルバンドル（tar.gz）に `metadata.json` として同梱され、
//! 推論時にモデルを初期化するためのクラス数などを保持します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::SymbolId;

/// モデル名
pub const MODEL_NAME: &str = "Handwritten Math Symbol Recognition";

/// 学習データセット名
pub const DATASET_NAME: &str = "HASYv2";

/// モデルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,

    /// 出力クラス数 K
    pub num_classes: usize,

    /// 入力画像の一辺（正方形、1チャネル）
    pub image_size: u32,

    /// クラスインデックス順の元の記号ID（逆引き表）
    pub class_symbol_ids: Vec<SymbolId>,

    /// 実際に回したエポック数（早期終了を含む）
    pub epochs_run: u32,

    /// 最終評価時の検証損失
    pub val_loss: f64,

    /// 最終評価時の検証精度（0.0〜1.0）
    pub val_accuracy: f64,

    pub dataset: String,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_symbol_ids: Vec<SymbolId>,
        image_size: u32,
        epochs_run: u32,
        val_loss: f64,
        val_accuracy: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            model_name: MODEL_NAME.to_string(),
            num_classes: class_symbol_ids.len(),
            image_size,
            class_symbol_ids,
            epochs_run,
            val_loss,
            val_accuracy,
            dataset: DATASET_NAME.to_string(),
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;

        if metadata.num_classes != metadata.class_symbol_ids.len() {
            anyhow::bail!(
                "メタデータのクラス数が一致しません: num_classes={}, class_symbol_ids={}",
                metadata.num_classes,
                metadata.class_symbol_ids.len()
            );
        }
        Ok(metadata)
    }
}
