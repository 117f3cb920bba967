//! 画像の前処理とデータ拡張
//!
//! 学習時: リサイズ(+24) → ランダムクロップ → 水平/垂直反転 → 回転(±30°)
//! → カラージッター → 確率的ガウシアンブラー → 正規化
//! 検証/推論時: リサイズ → 正規化

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;

use crate::types::Split;

/// ImageNetの平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// ランダムクロップ用にリサイズ時に足す余白
pub const CROP_MARGIN: u32 = 24;

/// 回転角の最大値（度）
pub const MAX_ROTATION_DEGREES: f32 = 30.0;

/// カラージッターの強さ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.1,
            hue: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum JitterOp {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

impl ColorJitter {
    /// 4種類の調整をランダムな順序で適用
    pub fn apply<R: Rng + ?Sized>(&self, img: &mut RgbImage, rng: &mut R) {
        let mut ops = [
            JitterOp::Brightness,
            JitterOp::Contrast,
            JitterOp::Saturation,
            JitterOp::Hue,
        ];
        ops.shuffle(rng);

        for op in ops {
            match op {
                JitterOp::Brightness if self.brightness > 0.0 => {
                    let factor = rng.gen_range(1.0 - self.brightness..=1.0 + self.brightness);
                    adjust_brightness(img, factor);
                }
                JitterOp::Contrast if self.contrast > 0.0 => {
                    let factor = rng.gen_range(1.0 - self.contrast..=1.0 + self.contrast);
                    adjust_contrast(img, factor);
                }
                JitterOp::Saturation if self.saturation > 0.0 => {
                    let factor = rng.gen_range(1.0 - self.saturation..=1.0 + self.saturation);
                    adjust_saturation(img, factor);
                }
                JitterOp::Hue if self.hue > 0.0 => {
                    let shift = rng.gen_range(-self.hue..=self.hue);
                    adjust_hue(img, shift);
                }
                _ => {}
            }
        }
    }
}

/// 確率 `p` で適用されるガウシアンブラー
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomGaussianBlur {
    pub p: f64,
    pub sigma: (f32, f32),
}

impl Default for RandomGaussianBlur {
    fn default() -> Self {
        Self {
            p: 0.5,
            sigma: (0.1, 2.0),
        }
    }
}

impl RandomGaussianBlur {
    pub fn apply<R: Rng + ?Sized>(&self, img: RgbImage, rng: &mut R) -> RgbImage {
        if rng.gen_bool(self.p) {
            let sigma = rng.gen_range(self.sigma.0..=self.sigma.1);
            imageops::blur(&img, sigma)
        } else {
            img
        }
    }
}

/// 前処理パイプライン
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// 学習用（データ拡張あり）
    Train {
        image_size: u32,
        jitter: ColorJitter,
        blur: RandomGaussianBlur,
    },
    /// 検証・推論用（決定的）
    Eval { image_size: u32 },
}

impl Transform {
    pub fn train(image_size: u32) -> Self {
        Transform::Train {
            image_size,
            jitter: ColorJitter::default(),
            blur: RandomGaussianBlur::default(),
        }
    }

    pub fn eval(image_size: u32) -> Self {
        Transform::Eval { image_size }
    }

    pub fn for_split(split: Split, image_size: u32) -> Self {
        match split {
            Split::Train => Self::train(image_size),
            Split::Validation => Self::eval(image_size),
        }
    }

    pub fn image_size(&self) -> u32 {
        match self {
            Transform::Train { image_size, .. } | Transform::Eval { image_size } => *image_size,
        }
    }

    /// 1枚あたりの要素数 (3 * size * size)
    pub fn num_values(&self) -> usize {
        let size = self.image_size() as usize;
        3 * size * size
    }

    /// 画像ファイルを読み込んで変換
    pub fn load<R: Rng + ?Sized>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?
            .to_rgb8();
        Ok(self.apply(img, rng))
    }

    /// 変換を適用し、正規化済みの (C, H, W) 順データを返す
    pub fn apply<R: Rng + ?Sized>(&self, img: RgbImage, rng: &mut R) -> Vec<f32> {
        match *self {
            Transform::Eval { image_size } => {
                let img = imageops::resize(&img, image_size, image_size, FilterType::Triangle);
                normalize_chw(&img)
            }
            Transform::Train {
                image_size,
                jitter,
                blur,
            } => {
                let padded = image_size + CROP_MARGIN;
                let img = imageops::resize(&img, padded, padded, FilterType::Triangle);
                let mut img = random_crop(&img, image_size, rng);

                if rng.gen_bool(0.5) {
                    imageops::flip_horizontal_in_place(&mut img);
                }
                if rng.gen_bool(0.5) {
                    imageops::flip_vertical_in_place(&mut img);
                }

                let angle = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES);
                let mut img = rotate_nearest(&img, angle);

                jitter.apply(&mut img, rng);
                let img = blur.apply(img, rng);
                normalize_chw(&img)
            }
        }
    }
}

/// ランダムな位置から `size x size` を切り出す
pub fn random_crop<R: Rng + ?Sized>(img: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
    let (width, height) = img.dimensions();
    let size_w = size.min(width);
    let size_h = size.min(height);
    let x = rng.gen_range(0..=width - size_w);
    let y = rng.gen_range(0..=height - size_h);
    imageops::crop_imm(img, x, y, size_w, size_h).to_image()
}

/// 中心回りに回転（最近傍補間、はみ出し部分は黒）
pub fn rotate_nearest(img: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let mut out = RgbImage::new(width, height);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        // 出力座標から入力座標への逆写像
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cos * dx + sin * dy + cx).round();
        let sy = (-sin * dx + cos * dy + cy).round();

        if sx >= 0.0 && sy >= 0.0 && (sx as u32) < width && (sy as u32) < height {
            *pixel = *img.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}

fn grayscale(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

pub fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_u8(p[c] as f32 * factor);
        }
    }
}

pub fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    let n = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(grayscale).sum::<f32>() / n;
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_u8(factor * p[c] as f32 + (1.0 - factor) * mean);
        }
    }
}

pub fn adjust_saturation(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        let gray = grayscale(p);
        for c in 0..3 {
            p[c] = clamp_u8(factor * p[c] as f32 + (1.0 - factor) * gray);
        }
    }
}

/// 色相を `shift`（1周 = 1.0）だけ回す
pub fn adjust_hue(img: &mut RgbImage, shift: f32) {
    for p in img.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
        let h = (h + shift).rem_euclid(1.0);
        let (r, g, b) = hsv_to_rgb(h, s, v);
        *p = Rgb([r, g, b]);
    }
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let h6 = h * 6.0;
    let sector = h6.floor() as i32 % 6;
    let f = h6 - h6.floor();
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match sector {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    (clamp_u8(r * 255.0), clamp_u8(g * 255.0), clamp_u8(b * 255.0))
}

/// RGB画像をImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化
pub fn normalize_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn test_eval_transform_normalizes_solid_image() {
        let mut rng = StdRng::seed_from_u64(0);
        let data = Transform::eval(8).apply(solid(20, 13, [255, 0, 128]), &mut rng);

        assert_eq!(data.len(), 3 * 8 * 8);
        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((data[0] - expected_r).abs() < 1e-5);
        assert!((data[64] - expected_g).abs() < 1e-5);
    }

    #[test]
    fn test_eval_transform_is_deterministic() {
        let img = RgbImage::from_fn(30, 30, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 77]));
        let a = Transform::eval(16).apply(img.clone(), &mut StdRng::seed_from_u64(1));
        let b = Transform::eval(16).apply(img, &mut StdRng::seed_from_u64(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_transform_output_size() {
        let mut rng = StdRng::seed_from_u64(3);
        let img = RgbImage::from_fn(50, 40, |x, y| Rgb([x as u8, y as u8, 10]));
        let transform = Transform::train(32);
        for _ in 0..5 {
            let data = transform.apply(img.clone(), &mut rng);
            assert_eq!(data.len(), transform.num_values());
            assert!(data.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_random_crop_size() {
        let mut rng = StdRng::seed_from_u64(4);
        let crop = random_crop(&solid(48, 48, [1, 2, 3]), 24, &mut rng);
        assert_eq!(crop.dimensions(), (24, 24));
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let img = RgbImage::from_fn(9, 7, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]));
        assert_eq!(rotate_nearest(&img, 0.0), img);
    }

    #[test]
    fn test_rotate_leaves_black_corners() {
        let rotated = rotate_nearest(&solid(21, 21, [200, 200, 200]), 30.0);
        assert_eq!(*rotated.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*rotated.get_pixel(10, 10), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_neutral_jitter_factors() {
        let original = RgbImage::from_fn(6, 6, |x, y| Rgb([x as u8 * 40, y as u8 * 40, 90]));
        let mut img = original.clone();
        adjust_brightness(&mut img, 1.0);
        adjust_contrast(&mut img, 1.0);
        adjust_saturation(&mut img, 1.0);
        assert_eq!(img, original);
    }

    #[test]
    fn test_hue_roundtrip() {
        let original = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8 * 60, y as u8 * 60, 200]));
        let mut img = original.clone();
        adjust_hue(&mut img, 0.0);
        for (a, b) in img.pixels().zip(original.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn test_saturation_zero_is_gray() {
        let mut img = solid(2, 2, [255, 0, 0]);
        adjust_saturation(&mut img, 0.0);
        let p = img.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Transform::eval(8)
            .load(Path::new("/nonexistent/image.png"), &mut rng)
            .is_err());
    }
}
