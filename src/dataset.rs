//! データセット読み込み
//!
//! ラベル表に記載された画像を読み込み、正規化済みテンソル列と
//! 記号ID列（同じ順序）を返します。シャッフルはしません。

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::csv_loader::load_label_table;
use crate::preprocess::load_and_normalize_image;
use crate::types::{ClassIndex, LabelRecord, SymbolId};

/// 進捗ログを出す間隔（処理した行数）
pub const PROGRESS_INTERVAL: usize = 10_000;

/// 読み込み済みデータセット
#[derive(Debug, Clone, Default)]
pub struct LoadedDataset {
    /// 正規化済み 32x32 画像（行優先で平坦化）
    pub images: Vec<Vec<f32>>,
    /// `images` と同じ順序の記号ID
    pub symbol_ids: Vec<SymbolId>,
    /// ラベル表の全行（ファイルが無かった行も含む）
    pub table: Vec<LabelRecord>,
}

impl LoadedDataset {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// データセットディレクトリから画像とラベルを読み込む
///
/// 画像ファイルが存在しない行は黙ってスキップする。
/// 存在するのにデコードできない画像はエラー。
pub fn load_dataset(base_dir: &Path, labels_file: &str) -> Result<LoadedDataset> {
    info!("データセットを読み込みます: {}", base_dir.display());

    let table = load_label_table(&base_dir.join(labels_file))?;

    let mut images = Vec::with_capacity(table.len());
    let mut symbol_ids = Vec::with_capacity(table.len());

    for (idx, row) in table.iter().enumerate() {
        let img_path = base_dir.join(&row.path);

        if img_path.exists() {
            images.push(load_and_normalize_image(&img_path)?);
            symbol_ids.push(row.symbol_id);
        }

        if (idx + 1) % PROGRESS_INTERVAL == 0 {
            info!("{} 行処理しました（読み込み済み {} 枚）", idx + 1, images.len());
        }
    }

    info!(
        "読み込み完了: {} 枚 / ラベル表 {} 行",
        images.len(),
        table.len()
    );

    Ok(LoadedDataset {
        images,
        symbol_ids,
        table,
    })
}

/// クラスごとの比率を保ったまま学習用と検証用のインデックスに分割
///
/// 各クラスで `round(n * validation_ratio)` 件を検証用に回すが、
/// 学習用には必ず1件以上残す。同じシードなら結果は常に同じ。
pub fn stratified_split(
    labels: &[ClassIndex],
    validation_ratio: f32,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<ClassIndex, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut valid = Vec::new();

    for indices in by_class.values_mut() {
        indices.shuffle(&mut rng);

        let n = indices.len();
        let n_valid = ((n as f64 * validation_ratio as f64).round() as usize).min(n - 1);

        valid.extend_from_slice(&indices[..n_valid]);
        train.extend_from_slice(&indices[n_valid..]);
    }

    // クラス順に並んだままにしない
    train.shuffle(&mut rng);
    valid.shuffle(&mut rng);

    (train, valid)
}
