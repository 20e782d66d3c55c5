//! 画像の前処理と入力チェック
//!
//! 学習時のデータ読み込みと推論サーバーで同じ正規化を使います。
//! 画像はグレースケール化 → 32x32 へ無条件にリサイズ（縦横比は保持しない）
//! → 0.0〜1.0 の f32 に正規化され、行優先で平坦化されます。

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage};
use std::path::Path;

/// モデル入力の一辺のピクセル数
pub const IMAGE_SIZE: usize = 32;

/// 1画像あたりのピクセル数
pub const PIXELS_PER_IMAGE: usize = IMAGE_SIZE * IMAGE_SIZE;

/// この値より暗いピクセルを前景（インク）とみなす
pub const INK_THRESHOLD: f32 = 0.85;

/// 前景比率の下限（これ未満はほぼ白紙）
pub const MIN_FOREGROUND_FRACTION: f64 = 0.02;

/// 前景比率の上限（これを超えるとほぼ塗りつぶし・写真）
pub const MAX_FOREGROUND_FRACTION: f64 = 0.60;

/// 標準偏差の下限（これ未満はコントラスト不足）
pub const MIN_STD_DEV: f64 = 0.05;

/// デコード済み画像を正規化済みピクセル列に変換
pub fn normalize_image(img: &DynamicImage) -> Vec<f32> {
    let gray = img.to_luma8();
    let size = IMAGE_SIZE as u32;
    let resized = image::imageops::resize(&gray, size, size, FilterType::Triangle);

    resized.pixels().map(|p| p[0] as f32 / 255.0).collect()
}

/// 画像ファイルを読み込んで正規化
pub fn load_and_normalize_image(path: &Path) -> Result<Vec<f32>> {
    let img = image::open(path).with_context(|| format!("画像の読み込みに失敗: {}", path.display()))?;
    Ok(normalize_image(&img))
}

/// アップロードされたバイト列をデコードして正規化
pub fn decode_and_normalize(bytes: &[u8]) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("画像のデコードに失敗しました")?;
    Ok(normalize_image(&img))
}

/// 白紙・塗りつぶし判定に使う画像統計量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStats {
    /// `INK_THRESHOLD` より暗いピクセルの割合
    pub foreground_fraction: f64,
    /// 輝度の標準偏差（母標準偏差）
    pub std_dev: f64,
}

impl ImageStats {
    pub fn from_pixels(pixels: &[f32]) -> Self {
        if pixels.is_empty() {
            return Self {
                foreground_fraction: 0.0,
                std_dev: 0.0,
            };
        }

        let n = pixels.len() as f64;
        let dark = pixels.iter().filter(|&&p| p < INK_THRESHOLD).count();
        let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
        let variance = pixels
            .iter()
            .map(|&p| {
                let d = p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        Self {
            foreground_fraction: dark as f64 / n,
            std_dev: variance.sqrt(),
        }
    }

    /// 推論に回す価値のある入力かどうか
    ///
    /// 境界値（前景比率ちょうど 0.02 / 0.60）は受け入れる。
    pub fn looks_like_symbol(&self) -> bool {
        !(self.std_dev < MIN_STD_DEV
            || self.foreground_fraction < MIN_FOREGROUND_FRACTION
            || self.foreground_fraction > MAX_FOREGROUND_FRACTION)
    }
}
