use serde::{Deserialize, Serialize};

/// データセット側で定義された記号ID（疎で連続しない）
pub type SymbolId = i64;

/// モデルが実際に予測する連続したクラスインデックス
pub type ClassIndex = usize;

/// ラベル表の1行
///
/// HASYv2 の `hasy-data-labels.csv` 形式。`user_id` などの余分な列は無視する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// データセットディレクトリからの相対画像パス
    pub path: String,
    pub symbol_id: SymbolId,
    #[serde(default)]
    pub latex: String,
    // 列自体が無いデータセットもある
    #[serde(default)]
    pub unicode: Option<String>,
}

/// 表示用の記号情報（LaTeX ソースと Unicode グリフ）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    #[serde(default)]
    pub latex: String,
    #[serde(default)]
    pub unicode: String,
}

impl SymbolEntry {
    pub fn new(latex: impl Into<String>, unicode: impl Into<String>) -> Self {
        Self {
            latex: latex.into(),
            unicode: unicode.into(),
        }
    }

    /// LaTeX と Unicode の両方が空
    pub fn is_empty(&self) -> bool {
        self.latex.is_empty() && self.unicode.is_empty()
    }
}
