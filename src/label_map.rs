//! 記号IDとクラスインデックスの相互変換
//!
//! データセットの記号IDは疎で連続しないため、観測された ID を昇順に並べ、
//! その位置をクラスインデックス（0..K）として使います。

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::types::{ClassIndex, SymbolId};

/// 記号ID ⇔ クラスインデックスの全単射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMapping {
    forward: BTreeMap<SymbolId, ClassIndex>,
    /// 位置 = クラスインデックス、値 = 記号ID（昇順）
    reverse: Vec<SymbolId>,
}

impl LabelMapping {
    /// 観測された記号ID列から対応表を作る
    pub fn from_symbol_ids(symbol_ids: &[SymbolId]) -> Self {
        let distinct: BTreeSet<SymbolId> = symbol_ids.iter().copied().collect();
        Self::from_sorted(distinct.into_iter().collect())
    }

    /// クラスインデックス順の記号ID列から復元
    pub fn from_reverse(reverse: Vec<SymbolId>) -> Result<Self> {
        let distinct: BTreeSet<SymbolId> = reverse.iter().copied().collect();
        if distinct.len() != reverse.len() {
            anyhow::bail!("逆引き表に重複した記号IDがあります");
        }
        if !reverse.windows(2).all(|w| w[0] < w[1]) {
            anyhow::bail!("逆引き表の記号IDが昇順ではありません");
        }
        Ok(Self::from_sorted(reverse))
    }

    fn from_sorted(reverse: Vec<SymbolId>) -> Self {
        let forward = reverse
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();
        Self { forward, reverse }
    }

    /// クラス数 K
    pub fn num_classes(&self) -> usize {
        self.reverse.len()
    }

    pub fn class_index(&self, symbol_id: SymbolId) -> Option<ClassIndex> {
        self.forward.get(&symbol_id).copied()
    }

    pub fn symbol_id(&self, class_index: ClassIndex) -> Option<SymbolId> {
        self.reverse.get(class_index).copied()
    }

    /// クラスインデックス順の記号ID
    pub fn reverse(&self) -> &[SymbolId] {
        &self.reverse
    }

    /// 記号ID列をクラスインデックス列に変換
    pub fn remap(&self, symbol_ids: &[SymbolId]) -> Result<Vec<ClassIndex>> {
        symbol_ids
            .iter()
            .map(|&id| {
                self.class_index(id)
                    .ok_or_else(|| anyhow::anyhow!("記号ID {} は対応表にありません", id))
            })
            .collect()
    }

    /// `reverse_mapping.json` 形式（"インデックス" → 記号ID）
    pub fn reverse_table(&self) -> BTreeMap<String, SymbolId> {
        self.reverse
            .iter()
            .enumerate()
            .map(|(index, &id)| (index.to_string(), id))
            .collect()
    }

    pub fn save_reverse_mapping(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.reverse_table())?;
        std::fs::write(path, json)
            .with_context(|| format!("逆引き表の保存に失敗: {}", path.display()))?;
        Ok(())
    }

    pub fn load_reverse_mapping(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("逆引き表を開けません: {}", path.display()))?;
        let table: BTreeMap<String, SymbolId> = serde_json::from_str(&content)?;

        let mut pairs = table
            .into_iter()
            .map(|(key, id)| {
                key.parse::<ClassIndex>()
                    .map(|index| (index, id))
                    .with_context(|| format!("不正なクラスインデックス: {}", key))
            })
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_unstable_by_key(|(index, _)| *index);

        if pairs.iter().enumerate().any(|(i, (index, _))| i != *index) {
            anyhow::bail!("逆引き表のインデックスが 0 から連続していません");
        }

        Self::from_reverse(pairs.into_iter().map(|(_, id)| id).collect())
    }
}

/// 記号ID列を連続したクラスインデックスに振り直す
pub fn remap_labels(symbol_ids: &[SymbolId]) -> Result<(Vec<ClassIndex>, LabelMapping)> {
    let mapping = LabelMapping::from_symbol_ids(symbol_ids);
    let labels = mapping.remap(symbol_ids)?;
    Ok((labels, mapping))
}
