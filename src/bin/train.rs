//! 数式記号分類モデルの学習
//!
//! 使い方:
//!   train [--config config.json] [--dataset dataset/HASYv2] [--models-dir models]
//!         [--epochs 50] [--device wgpu|cpu]

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{Autodiff, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::Parser;
use tracing::info;

use math_ocr_lib::dataset::load_dataset;
use math_ocr_lib::label_map::{remap_labels, LabelMapping};
use math_ocr_lib::ml::{checkpoint_path, save_all, train};
use math_ocr_lib::model::{AppConfig, DeviceType};
use math_ocr_lib::symbols::build_symbol_table;
use math_ocr_lib::types::ClassIndex;

/// 記号表の出力ファイル名
const LABELS_FILE: &str = "labels.json";

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train the handwritten math symbol classifier on HASYv2")]
#[command(version)]
struct Args {
    /// 設定ファイル（既定: config.json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// データセットディレクトリ
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// モデル出力先
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// 最大エポック数
    #[arg(short, long)]
    epochs: Option<usize>,

    /// 計算デバイス (wgpu / cpu)
    #[arg(short, long)]
    device: Option<DeviceType>,
}

fn run<B: AutodiffBackend>(
    images: Vec<Vec<f32>>,
    labels: Vec<ClassIndex>,
    mapping: &LabelMapping,
    config: &AppConfig,
    device: B::Device,
) -> Result<()> {
    let models_dir = &config.paths.models_dir;
    let checkpoint = checkpoint_path(models_dir);

    let (model, report) = train::<B, _>(
        images,
        labels,
        mapping.num_classes(),
        &config.training,
        &config.model,
        &checkpoint,
        &device,
        |_| {},
    )?;

    if report.stopped_early {
        info!("{} エポックで早期終了しました", report.epochs_run);
    }
    if let Some(best) = report.best_val_accuracy {
        info!("最良の検証精度: {:.2}%", best * 100.0);
    }

    let saved = save_all(model, mapping, &report, models_dir)?;
    info!("主形式: {}", saved.primary.display());
    info!("バンドル: {}", saved.bundle.display());
    info!("軽量形式: {}", saved.compact.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    math_ocr_lib::init_logging();

    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default_from(&config_path);
    if let Some(dataset) = args.dataset {
        config.paths.dataset_dir = dataset;
    }
    if let Some(models_dir) = args.models_dir {
        config.paths.models_dir = models_dir;
    }
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(device) = args.device {
        config.device_type = device;
    }
    config.log_summary();

    let dataset = load_dataset(&config.paths.dataset_dir, &config.paths.labels_file)?;
    if dataset.is_empty() {
        anyhow::bail!(
            "画像が1枚も読み込めませんでした: {}",
            config.paths.dataset_dir.display()
        );
    }

    let (labels, mapping) = remap_labels(&dataset.symbol_ids)?;
    info!("クラス数: {}", mapping.num_classes());

    // サーバーはクラスインデックスで引くので、ここで振り直してから保存する
    std::fs::create_dir_all(&config.paths.models_dir)?;
    let symbols = build_symbol_table(&dataset.table).rekey_by_class_index(&mapping);
    let labels_path = config.paths.models_dir.join(LABELS_FILE);
    symbols.save(&labels_path)?;
    info!("記号表を保存しました: {} ({} 件)", labels_path.display(), symbols.len());

    let images = dataset.images;
    match config.device_type {
        DeviceType::Wgpu => run::<Autodiff<Wgpu>>(images, labels, &mapping, &config, WgpuDevice::default()),
        DeviceType::Cpu => run::<Autodiff<NdArray<f32>>>(images, labels, &mapping, &config, NdArrayDevice::Cpu),
    }
}
