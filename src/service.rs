//! 推論サービスの状態と予測処理
//!
//! 起動時に一度だけ構築し、以後は読み取り専用で共有します。

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::ServiceError;
use crate::model::AppConfig;
use crate::preprocess::{decode_and_normalize, ImageStats};
use crate::symbols::SymbolTable;
use crate::verdict::{decide, Verdict};

/// 正規化済み画像からクラス確率を返す分類器
pub trait SymbolClassifier: Send + Sync {
    /// 32x32 画像1枚に対する確率分布（長さはクラス数）
    fn predict(&self, pixels: &[f32]) -> anyhow::Result<Vec<f64>>;

    fn num_classes(&self) -> usize;
}

/// 推論サービスの共有状態
pub struct ServiceContext {
    classifier: Option<Arc<dyn SymbolClassifier>>,
    symbols: SymbolTable,
}

impl ServiceContext {
    pub fn new(classifier: Option<Arc<dyn SymbolClassifier>>, symbols: SymbolTable) -> Self {
        Self { classifier, symbols }
    }

    /// 設定に従ってモデルと記号表を読み込む
    ///
    /// 読み込みに失敗した部分は欠けたまま起動する。
    pub fn from_config(config: &AppConfig) -> Self {
        let classifier = Self::load_classifier(config);

        let symbols = match SymbolTable::load(&config.server.labels_path) {
            Ok(symbols) => {
                info!(
                    "記号表を読み込みました: {} 件 ({})",
                    symbols.len(),
                    config.server.labels_path.display()
                );
                symbols
            }
            Err(e) => {
                error!(
                    "記号表の読み込みに失敗しました ({}): {:#}",
                    config.server.labels_path.display(),
                    e
                );
                SymbolTable::new()
            }
        };

        Self::new(classifier, symbols)
    }

    #[cfg(feature = "ml")]
    fn load_classifier(config: &AppConfig) -> Option<Arc<dyn SymbolClassifier>> {
        match crate::ml::load_classifier(&config.server.model_path, config.device_type) {
            Ok(classifier) => {
                info!("モデルを読み込みました: {} クラス", classifier.num_classes());
                Some(classifier)
            }
            Err(e) => {
                error!(
                    "モデルの読み込みに失敗しました ({}): {:#}",
                    config.server.model_path.display(),
                    e
                );
                None
            }
        }
    }

    #[cfg(not(feature = "ml"))]
    fn load_classifier(_config: &AppConfig) -> Option<Arc<dyn SymbolClassifier>> {
        warn!("ml フィーチャー無しでビルドされているため、モデルは読み込みません");
        None
    }

    pub fn model_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn labels_loaded(&self) -> bool {
        !self.symbols.is_empty()
    }

    /// 記号表の件数
    pub fn num_classes(&self) -> usize {
        self.symbols.len()
    }

    /// アップロードされた画像を判定する
    pub fn predict_image(&self, bytes: &[u8]) -> Result<Verdict, ServiceError> {
        let classifier = self.classifier.as_ref().ok_or(ServiceError::Unavailable)?;

        let pixels = decode_and_normalize(bytes)?;

        // 白紙やノイズはモデルに通さない
        let stats = ImageStats::from_pixels(&pixels);
        if !stats.looks_like_symbol() {
            debug!(
                "前処理チェックで除外: foreground={:.4}, std={:.4}",
                stats.foreground_fraction, stats.std_dev
            );
            return Ok(Verdict::Unrecognized);
        }

        let probabilities = classifier.predict(&pixels)?;
        let (class_index, confidence) = argmax(&probabilities)
            .ok_or_else(|| ServiceError::Internal("model returned no probabilities".to_string()))?;

        let verdict = decide(class_index, confidence, self.symbols.get(class_index));
        if let Verdict::DataError(e) = &verdict {
            warn!("予測クラス {} の表示情報に問題があります: {}", class_index, e);
        }
        Ok(verdict)
    }
}

/// 最大値とその位置（同値なら先頭）
fn argmax(values: &[f64]) -> Option<(usize, f64)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, best_v)) if v <= best_v => best,
            _ => Some((i, v)),
        })
}
