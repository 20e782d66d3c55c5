//! 予測結果の判定
//!
//! HTTP やモデルに依存しない純粋な判定関数です。

use thiserror::Error;

use crate::types::{ClassIndex, SymbolEntry};

/// 「認識できた」とみなす最小確信度（この値ちょうどを含む）
pub const CONFIDENCE_THRESHOLD: f64 = 0.85;

/// 判定結果
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// 確信度が閾値以上で表示情報もある
    Recognized {
        class_index: ClassIndex,
        latex: String,
        unicode: String,
        /// モデルの最大確率（0.0〜1.0）
        confidence: f64,
    },
    /// 確信度不足、または前処理チェックで除外
    Unrecognized,
    /// ラベル表とモデルの不整合
    DataError(DataIntegrityError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataIntegrityError {
    /// 予測クラスが記号表に無い
    #[error("Label file mismatch. Index {0} not found.")]
    MissingLabel(ClassIndex),
    /// 記号表にあるが LaTeX も Unicode も空
    #[error("Label found, but both Unicode and LaTeX strings were empty.")]
    EmptyLabel(ClassIndex),
}

/// 予測クラス・確信度・表示情報から判定を下す
///
/// 表示情報が無い場合は確信度に関係なく `DataError`。
/// 空の表示情報は確信度が閾値以上のときだけ問題になる。
pub fn decide(class_index: ClassIndex, confidence: f64, entry: Option<&SymbolEntry>) -> Verdict {
    let Some(entry) = entry else {
        return Verdict::DataError(DataIntegrityError::MissingLabel(class_index));
    };

    if confidence < CONFIDENCE_THRESHOLD {
        return Verdict::Unrecognized;
    }

    if entry.is_empty() {
        return Verdict::DataError(DataIntegrityError::EmptyLabel(class_index));
    }

    Verdict::Recognized {
        class_index,
        latex: entry.latex.clone(),
        unicode: entry.unicode.clone(),
        confidence,
    }
}
