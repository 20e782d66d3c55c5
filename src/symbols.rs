//! 記号の表示情報（LaTeX / Unicode）
//!
//! ラベル表から記号ごとの表示情報を作り、`labels.json` として保存します。
//! ラベル表は記号IDで引くが、モデルはクラスインデックスを予測するので、
//! 保存前に [`SymbolTable::rekey_by_class_index`] でキーを振り直します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::label_map::LabelMapping;
use crate::types::{LabelRecord, SymbolEntry};

/// LaTeX コマンド → Unicode グリフ
const LATEX_TO_UNICODE: &[(&str, &str)] = &[
    // ギリシャ文字（小文字）
    ("\\alpha", "α"), ("\\beta", "β"), ("\\gamma", "γ"), ("\\delta", "δ"),
    ("\\epsilon", "ε"), ("\\zeta", "ζ"), ("\\eta", "η"), ("\\theta", "θ"),
    ("\\iota", "ι"), ("\\kappa", "κ"), ("\\lambda", "λ"), ("\\mu", "μ"),
    ("\\nu", "ν"), ("\\xi", "ξ"), ("\\pi", "π"), ("\\rho", "ρ"),
    ("\\sigma", "σ"), ("\\tau", "τ"), ("\\upsilon", "υ"), ("\\phi", "φ"),
    ("\\chi", "χ"), ("\\psi", "ψ"), ("\\omega", "ω"),
    // ギリシャ文字（大文字）
    ("\\Gamma", "Γ"), ("\\Delta", "Δ"), ("\\Theta", "Θ"), ("\\Lambda", "Λ"),
    ("\\Xi", "Ξ"), ("\\Pi", "Π"), ("\\Sigma", "Σ"), ("\\Phi", "Φ"),
    ("\\Psi", "Ψ"), ("\\Omega", "Ω"),
    // 演算子
    ("\\sum", "∑"), ("\\prod", "∏"), ("\\int", "∫"), ("\\oint", "∮"),
    ("\\infty", "∞"), ("\\partial", "∂"), ("\\nabla", "∇"),
    ("\\pm", "±"), ("\\mp", "∓"), ("\\times", "×"), ("\\div", "÷"),
    ("\\cdot", "·"), ("\\ast", "∗"),
    // 関係
    ("\\neq", "≠"), ("\\leq", "≤"), ("\\geq", "≥"), ("\\ll", "≪"), ("\\gg", "≫"),
    ("\\approx", "≈"), ("\\equiv", "≡"), ("\\sim", "∼"), ("\\simeq", "≃"),
    ("\\propto", "∝"),
    // 論理
    ("\\forall", "∀"), ("\\exists", "∃"), ("\\neg", "¬"),
    ("\\wedge", "∧"), ("\\vee", "∨"),
    // 集合
    ("\\emptyset", "∅"), ("\\cap", "∩"), ("\\cup", "∪"),
    ("\\subset", "⊂"), ("\\supset", "⊃"),
    ("\\subseteq", "⊆"), ("\\supseteq", "⊇"),
    ("\\in", "∈"), ("\\notin", "∉"), ("\\ni", "∋"),
    // 矢印
    ("\\rightarrow", "→"), ("\\leftarrow", "←"), ("\\uparrow", "↑"), ("\\downarrow", "↓"),
    ("\\Rightarrow", "⇒"), ("\\Leftarrow", "⇐"),
    ("\\leftrightarrow", "↔"), ("\\Leftrightarrow", "⇔"),
    ("\\to", "→"), ("\\gets", "←"), ("\\mapsto", "↦"),
    // 幾何
    ("\\angle", "∠"), ("\\perp", "⊥"), ("\\parallel", "∥"), ("\\triangle", "△"),
];

/// そのまま表示できる記号
const LITERAL_PUNCTUATION: &str = "+-=<>()[]{}/*^_!?.,:;";

/// LaTeX ソースに対応する Unicode グリフを探す
///
/// 数字・英字・基本的な記号はそれ自身を返す。
pub fn unicode_for_latex(latex: &str) -> Option<&str> {
    if let Some((_, glyph)) = LATEX_TO_UNICODE.iter().find(|(cmd, _)| *cmd == latex) {
        return Some(*glyph);
    }

    let mut chars = latex.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() || LITERAL_PUNCTUATION.contains(c) => {
            Some(latex)
        }
        _ => None,
    }
}

fn is_blank_unicode(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v == "nan",
    }
}

/// 記号表示情報の表（キーは文字列化した ID）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolTable {
    entries: BTreeMap<String, SymbolEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl ToString, entry: SymbolEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    pub fn get(&self, key: impl ToString) -> Option<&SymbolEntry> {
        self.entries.get(&key.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 記号IDキーの表をクラスインデックスキーに振り直す
    ///
    /// 表に無い記号IDのクラスは含めない（推論時に data_error になる）。
    pub fn rekey_by_class_index(&self, mapping: &LabelMapping) -> Self {
        let mut rekeyed = Self::new();

        for (index, &symbol_id) in mapping.reverse().iter().enumerate() {
            match self.get(symbol_id) {
                Some(entry) => rekeyed.insert(index, entry.clone()),
                None => warn!("記号ID {} (クラス {}) の表示情報がありません", symbol_id, index),
            }
        }

        rekeyed
    }

    /// JSON ファイルに保存（UTF-8 のまま、エスケープしない）
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("記号表の保存に失敗: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("記号表を開けません: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("記号表の形式が不正です: {}", path.display()))
    }
}

/// ラベル表から記号IDキーの表示情報を作る
///
/// 同じ記号IDが複数行にある場合は最初の行を使う。
/// Unicode 列が空か "nan" の場合は LaTeX から変換表で補う。
pub fn build_symbol_table(records: &[LabelRecord]) -> SymbolTable {
    let mut table = SymbolTable::new();

    for row in records {
        if table.get(row.symbol_id).is_some() {
            continue;
        }

        let unicode = if is_blank_unicode(row.unicode.as_deref()) {
            unicode_for_latex(&row.latex).unwrap_or_default().to_string()
        } else {
            row.unicode.clone().unwrap_or_default()
        };

        table.insert(row.symbol_id, SymbolEntry::new(row.latex.clone(), unicode));
    }

    table
}
