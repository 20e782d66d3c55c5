use crate::types::LabelRecord;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::path::Path;

/// ラベル表（CSV）を読み込む
///
/// ヘッダー名で列を対応付けるため、列順や余分な列には依存しない。
pub fn load_label_table(path: &Path) -> Result<Vec<LabelRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .with_context(|| format!("ラベル表を開けません: {}", path.display()))?;

    let mut records = Vec::new();

    for (line, result) in reader.deserialize::<LabelRecord>().enumerate() {
        // ヘッダー行を含めた行番号
        let record = result.with_context(|| format!("ラベル表の {} 行目が不正です", line + 2))?;
        records.push(record);
    }

    Ok(records)
}
