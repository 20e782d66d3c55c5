//! 学習時のデータ拡張
//!
//! 32x32 の正規化済み画像に対してランダムな回転・拡大縮小・平行移動・
//! コントラスト変更をかけます。推論時は使いません。
//! 範囲外の参照は端で折り返し（reflect）、補間は双線形。

use rand::Rng;

use crate::preprocess::IMAGE_SIZE;

/// 回転角の最大値（1回転に対する割合）
pub const ROTATION_FACTOR: f32 = 0.15;
/// 拡大縮小率の最大変化量
pub const ZOOM_FACTOR: f32 = 0.15;
/// 平行移動量の最大値（画像サイズに対する割合）
pub const TRANSLATION_FACTOR: f32 = 0.1;
/// コントラスト倍率の最大変化量
pub const CONTRAST_FACTOR: f32 = 0.25;

/// 1枚分の拡張パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// 回転角（ラジアン）
    pub angle: f32,
    /// 拡大率（1.0 で等倍）
    pub scale: f32,
    /// 平行移動量（ピクセル）
    pub shift_x: f32,
    pub shift_y: f32,
    /// コントラスト倍率（1.0 で変化なし）
    pub contrast: f32,
}

impl AugmentParams {
    pub const IDENTITY: Self = Self {
        angle: 0.0,
        scale: 1.0,
        shift_x: 0.0,
        shift_y: 0.0,
        contrast: 1.0,
    };

    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let max_angle = ROTATION_FACTOR * std::f32::consts::TAU;
        let max_shift = TRANSLATION_FACTOR * IMAGE_SIZE as f32;

        Self {
            angle: rng.gen_range(-max_angle..=max_angle),
            scale: rng.gen_range(1.0 - ZOOM_FACTOR..=1.0 + ZOOM_FACTOR),
            shift_x: rng.gen_range(-max_shift..=max_shift),
            shift_y: rng.gen_range(-max_shift..=max_shift),
            contrast: rng.gen_range(1.0 - CONTRAST_FACTOR..=1.0 + CONTRAST_FACTOR),
        }
    }
}

/// 折り返し（d c b a | a b c d | d c b a）でインデックスを範囲内に収める
fn reflect_index(i: i64, n: i64) -> usize {
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

fn sample_bilinear(pixels: &[f32], size: usize, x: f32, y: f32) -> f32 {
    let n = size as i64;
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let at = |xi: i64, yi: i64| pixels[reflect_index(yi, n) * size + reflect_index(xi, n)];
    let (xi, yi) = (x0 as i64, y0 as i64);

    let top = at(xi, yi) * (1.0 - fx) + at(xi + 1, yi) * fx;
    let bottom = at(xi, yi + 1) * (1.0 - fx) + at(xi + 1, yi + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// 正方形画像に拡張をかけた新しいピクセル列を返す
pub fn apply(pixels: &[f32], params: &AugmentParams) -> Vec<f32> {
    let size = (pixels.len() as f64).sqrt() as usize;
    debug_assert_eq!(size * size, pixels.len());

    let center = (size as f32 - 1.0) / 2.0;
    let (sin, cos) = params.angle.sin_cos();
    let inv_scale = 1.0 / params.scale;

    // 出力座標 -> 入力座標の逆変換
    let mut warped = Vec::with_capacity(pixels.len());
    for y in 0..size {
        for x in 0..size {
            let dx = (x as f32 - center - params.shift_x) * inv_scale;
            let dy = (y as f32 - center - params.shift_y) * inv_scale;
            let src_x = cos * dx + sin * dy + center;
            let src_y = -sin * dx + cos * dy + center;
            warped.push(sample_bilinear(pixels, size, src_x, src_y));
        }
    }

    let mean = warped.iter().sum::<f32>() / warped.len().max(1) as f32;
    warped
        .into_iter()
        .map(|p| ((p - mean) * params.contrast + mean).clamp(0.0, 1.0))
        .collect()
}

/// ランダムなパラメータで拡張する
pub fn augment<R: Rng + ?Sized>(pixels: &[f32], rng: &mut R) -> Vec<f32> {
    apply(pixels, &AugmentParams::sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PIXELS_PER_IMAGE;
    use rand::SeedableRng;

    fn stroke_image() -> Vec<f32> {
        let mut pixels = vec![1.0f32; PIXELS_PER_IMAGE];
        for y in 8..24 {
            pixels[y * IMAGE_SIZE + 15] = 0.0;
            pixels[y * IMAGE_SIZE + 16] = 0.0;
        }
        pixels
    }

    #[test]
    fn test_identity_keeps_image() {
        let pixels = stroke_image();
        let out = apply(&pixels, &AugmentParams::IDENTITY);
        for (a, b) in pixels.iter().zip(&out) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_output_stays_in_unit_range() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let pixels = stroke_image();
        for _ in 0..50 {
            let out = augment(&pixels, &mut rng);
            assert_eq!(out.len(), PIXELS_PER_IMAGE);
            assert!(out.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_same_seed_same_result() {
        let pixels = stroke_image();
        let a = augment(&pixels, &mut rand::rngs::StdRng::seed_from_u64(3));
        let b = augment(&pixels, &mut rand::rngs::StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sampled_params_within_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let p = AugmentParams::sample(&mut rng);
            assert!(p.angle.abs() <= ROTATION_FACTOR * std::f32::consts::TAU);
            assert!((0.85..=1.15).contains(&p.scale));
            assert!(p.shift_x.abs() <= 3.2 + 1e-5 && p.shift_y.abs() <= 3.2 + 1e-5);
            assert!((0.75..=1.25).contains(&p.contrast));
        }
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }
}
