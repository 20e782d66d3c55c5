//! モデル学習
//!
//! `split` → `compiled` → `fitting` → `evaluated` の順に進む学習ループ。
//! エポックごとに検証し、チェックポイント保存・学習率減衰・早期終了を判定します。

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{
        BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, NamedMpkFileRecorder,
        NamedMpkGzFileRecorder, Recorder,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    train::ClassificationOutput,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, info, warn};

use crate::dataset::stratified_split;
use crate::label_map::LabelMapping;
use crate::ml::augment;
use crate::ml::ml_model::{MathSymbolCnn, ModelConfig};
use crate::monitor::{CheckpointPolicy, EarlyStopping, ReduceLrOnPlateau, StoppingDecision};
use crate::model::{save_model_with_metadata, ModelMetadata, ModelSettings, TrainingSettings};
use crate::preprocess::IMAGE_SIZE;
use crate::types::ClassIndex;

/// 主形式（NamedMpk, 全精度）のファイル名（拡張子なし）
pub const PRIMARY_MODEL_STEM: &str = "math_ocr_model";
/// 軽量形式（半精度 + gzip）のファイル名（拡張子なし）
pub const COMPACT_MODEL_STEM: &str = "math_ocr_model_compact";
/// 学習中のチェックポイント（拡張子なし）
pub const CHECKPOINT_STEM: &str = "best_model";
/// 逆引き表
pub const REVERSE_MAPPING_FILE: &str = "reverse_mapping.json";

/// Adam の epsilon
const ADAM_EPSILON: f32 = 1e-7;
/// 学習率減衰の判定に使う最小改善幅
const LR_MIN_DELTA: f64 = 1e-4;

/// チェックポイントの保存先（拡張子は Recorder が付ける）
pub fn checkpoint_path(models_dir: &Path) -> PathBuf {
    models_dir.join(CHECKPOINT_STEM)
}

/// 学習の段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Split,
    Compiled,
    Fitting,
    Evaluated,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingPhase::Split => "split",
            TrainingPhase::Compiled => "compiled",
            TrainingPhase::Fitting => "fitting",
            TrainingPhase::Evaluated => "evaluated",
        };
        f.write_str(name)
    }
}

fn enter_phase(phase: TrainingPhase) {
    info!("=== 学習フェーズ: {} ===", phase);
}

/// 学習データセット（画像本体は共有し、インデックスだけを持つ）
#[derive(Clone)]
pub struct SymbolDataset {
    images: Arc<Vec<Vec<f32>>>,
    labels: Arc<Vec<ClassIndex>>,
    indices: Vec<usize>,
}

impl SymbolDataset {
    fn new(images: Arc<Vec<Vec<f32>>>, labels: Arc<Vec<ClassIndex>>, indices: Vec<usize>) -> Self {
        Self {
            images,
            labels,
            indices,
        }
    }
}

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct SymbolItem {
    pub pixels: Vec<f32>,
    pub label: ClassIndex,
}

impl Dataset<SymbolItem> for SymbolDataset {
    fn get(&self, index: usize) -> Option<SymbolItem> {
        let actual_index = *self.indices.get(index)?;
        Some(SymbolItem {
            pixels: self.images.get(actual_index)?.clone(),
            label: *self.labels.get(actual_index)?,
        })
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SymbolBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone)]
pub struct SymbolBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SymbolBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn batch_items(&self, items: Vec<SymbolItem>) -> SymbolBatch<B> {
        self.batch(items, &self.device)
    }
}

impl<B: Backend> Batcher<B, SymbolItem, SymbolBatch<B>> for SymbolBatcher<B> {
    fn batch(&self, items: Vec<SymbolItem>, device: &B::Device) -> SymbolBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * IMAGE_SIZE * IMAGE_SIZE);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, 1, IMAGE_SIZE, IMAGE_SIZE]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        SymbolBatch { images, targets }
    }
}

/// 1エポック分の結果
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 検証結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

/// 学習全体の結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_val_accuracy: Option<f64>,
    /// 学習後（最良重み復元後）の検証結果
    pub evaluation: Evaluation,
    pub history: Vec<EpochReport>,
}

/// 損失と正解数を積み上げる
#[derive(Default)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl RunningMetrics {
    fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size, _] = output.output.dims();
        let loss: f64 = output.loss.clone().into_scalar().elem();
        let correct: i64 = output
            .output
            .clone()
            .argmax(1)
            .reshape([batch_size])
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct.max(0) as usize;
        self.seen += batch_size;
    }

    fn finish(&self) -> Evaluation {
        if self.seen == 0 {
            return Evaluation {
                loss: f64::NAN,
                accuracy: 0.0,
            };
        }
        Evaluation {
            loss: self.loss_sum / self.seen as f64,
            accuracy: self.correct as f64 / self.seen as f64,
        }
    }
}

/// 推論モードのモデルで検証データを評価
fn evaluate<B: Backend>(
    model: &MathSymbolCnn<B>,
    dataset: &SymbolDataset,
    batcher: &SymbolBatcher<B>,
    batch_size: usize,
    label_smoothing: f32,
    l2_penalty: f64,
) -> Evaluation {
    let mut metrics = RunningMetrics::default();
    let indices: Vec<usize> = (0..dataset.len()).collect();

    for chunk in indices.chunks(batch_size) {
        let items = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
        let batch = batcher.batch_items(items);
        let output =
            model.forward_classification(batch.images, batch.targets, label_smoothing, l2_penalty);
        metrics.update(&output);
    }

    metrics.finish()
}

/// モデルを学習する
///
/// # 引数
/// - `images`: 正規化済み画像（各 32x32）
/// - `labels`: 連続したクラスインデックス
/// - `checkpoint`: 検証精度が向上するたびに重みを書き出す先
/// - `on_epoch`: エポックごとの進捗コールバック
///
/// # 戻り値
/// 学習済みモデル（早期終了時は検証損失が最良だった重み）と学習結果
#[allow(clippy::too_many_arguments)]
pub fn train<B, F>(
    images: Vec<Vec<f32>>,
    labels: Vec<ClassIndex>,
    num_classes: usize,
    training: &TrainingSettings,
    model_settings: &ModelSettings,
    checkpoint: &Path,
    device: &B::Device,
    mut on_epoch: F,
) -> Result<(MathSymbolCnn<B>, TrainingReport)>
where
    B: AutodiffBackend,
    F: FnMut(&EpochReport),
{
    if images.len() != labels.len() {
        anyhow::bail!(
            "画像数とラベル数が一致しません: images={}, labels={}",
            images.len(),
            labels.len()
        );
    }
    if images.is_empty() {
        anyhow::bail!("学習データがありません");
    }
    if training.batch_size == 0 {
        anyhow::bail!("バッチサイズは1以上にしてください");
    }

    // === split ===
    enter_phase(TrainingPhase::Split);
    let (train_indices, valid_indices) =
        stratified_split(&labels, training.validation_ratio, training.seed);
    if valid_indices.is_empty() {
        anyhow::bail!("検証データが0件です（各クラス2枚以上の画像が必要です）");
    }

    let images = Arc::new(images);
    let labels = Arc::new(labels);
    let train_set = SymbolDataset::new(images.clone(), labels.clone(), train_indices);
    let valid_set = SymbolDataset::new(images, labels, valid_indices);
    info!("学習データ: {} 枚", train_set.len());
    info!("検証データ: {} 枚", valid_set.len());

    // === compiled ===
    enter_phase(TrainingPhase::Compiled);
    let model_config = ModelConfig::new(num_classes).with_dropout(model_settings.dropout);
    let mut model = model_config.init::<B>(device);
    let mut optim = AdamConfig::new()
        .with_epsilon(ADAM_EPSILON)
        .init::<B, MathSymbolCnn<B>>();
    info!(
        "モデル設定: {} クラス, dropout={}, L2={}, パラメータ数={}",
        num_classes,
        model_settings.dropout,
        model_settings.l2_penalty,
        model.num_params()
    );
    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}, ラベルスムージング: {}",
        training.num_epochs, training.batch_size, training.learning_rate, training.label_smoothing
    );

    let train_batcher = SymbolBatcher::<B>::new(device.clone());
    let valid_batcher = SymbolBatcher::<B::InnerBackend>::new(device.clone());

    let mut checkpoint_policy = CheckpointPolicy::default();
    let mut plateau = ReduceLrOnPlateau::new(
        training.lr_reduce_factor,
        training.lr_patience,
        training.min_learning_rate,
        LR_MIN_DELTA,
    );
    let mut early_stopping = EarlyStopping::new(training.early_stopping_patience, 0.0);

    // === fitting ===
    enter_phase(TrainingPhase::Fitting);
    let mut rng = StdRng::seed_from_u64(training.seed);
    let mut learning_rate = training.learning_rate;
    let mut best_weights: Option<MathSymbolCnn<B>> = None;
    let mut history = Vec::with_capacity(training.num_epochs);
    let mut stopped_early = false;
    let mut order: Vec<usize> = (0..train_set.len()).collect();

    for epoch in 1..=training.num_epochs {
        order.shuffle(&mut rng);
        let mut train_metrics = RunningMetrics::default();

        for chunk in order.chunks(training.batch_size) {
            let items: Vec<SymbolItem> = chunk
                .iter()
                .filter_map(|&i| train_set.get(i))
                .map(|mut item| {
                    if training.augment {
                        item.pixels = augment::augment(&item.pixels, &mut rng);
                    }
                    item
                })
                .collect();

            let batch = train_batcher.batch_items(items);
            let output = model.forward_classification(
                batch.images,
                batch.targets,
                training.label_smoothing,
                model_settings.l2_penalty,
            );
            train_metrics.update(&output);

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(learning_rate, model, grads);
        }

        let train_eval = train_metrics.finish();
        let val = evaluate(
            &model.valid(),
            &valid_set,
            &valid_batcher,
            training.batch_size,
            training.label_smoothing,
            model_settings.l2_penalty,
        );

        let report = EpochReport {
            epoch,
            train_loss: train_eval.loss,
            train_accuracy: train_eval.accuracy,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            learning_rate,
        };
        info!(
            "Epoch {}/{}: loss={:.4}, acc={:.2}%, val_loss={:.4}, val_acc={:.2}%, lr={:.2e}",
            epoch,
            training.num_epochs,
            report.train_loss,
            report.train_accuracy * 100.0,
            report.val_loss,
            report.val_accuracy * 100.0,
            learning_rate
        );
        on_epoch(&report);
        history.push(report);

        if checkpoint_policy.should_save(val.accuracy) {
            model
                .clone()
                .save_file(checkpoint, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;
            info!(
                "検証精度が向上しました ({:.2}%)。チェックポイントを保存: {}",
                val.accuracy * 100.0,
                checkpoint.display()
            );
        }

        if let Some(new_lr) = plateau.step(val.loss, learning_rate) {
            info!("検証損失が停滞しているため学習率を下げます: {:.2e} -> {:.2e}", learning_rate, new_lr);
            learning_rate = new_lr;
        }

        match early_stopping.check(val.loss) {
            StoppingDecision::NewBest => best_weights = Some(model.clone()),
            StoppingDecision::NoImprovement(wait) => {
                debug!("検証損失の改善なし: {}/{}", wait, training.early_stopping_patience);
            }
            StoppingDecision::Stop => {
                info!("早期終了: {} エポック改善がありませんでした", training.early_stopping_patience);
                stopped_early = true;
                break;
            }
        }
    }

    if stopped_early {
        match best_weights {
            Some(best) => {
                info!(
                    "検証損失が最良だった重みを復元します (val_loss={:.4})",
                    early_stopping.best_loss().unwrap_or(f64::NAN)
                );
                model = best;
            }
            None => warn!("最良の重みが記録されていないため、最終エポックの重みを使います"),
        }
    }

    // === evaluated ===
    enter_phase(TrainingPhase::Evaluated);
    let evaluation = evaluate(
        &model.valid(),
        &valid_set,
        &valid_batcher,
        training.batch_size,
        training.label_smoothing,
        model_settings.l2_penalty,
    );
    info!(
        "最終評価: 検証損失 {:.4}, 検証精度 {:.2}%",
        evaluation.loss,
        evaluation.accuracy * 100.0
    );

    let report = TrainingReport {
        epochs_run: history.len(),
        stopped_early,
        best_val_accuracy: checkpoint_policy.best_accuracy(),
        evaluation,
        history,
    };

    Ok((model, report))
}

/// 保存したファイル
#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub primary: PathBuf,
    pub bundle: PathBuf,
    pub compact: PathBuf,
    pub reverse_mapping: PathBuf,
}

/// 学習済みモデルを3形式と逆引き表で保存
///
/// 既存のファイルは上書きする。
pub fn save_all<B: Backend>(
    model: MathSymbolCnn<B>,
    mapping: &LabelMapping,
    report: &TrainingReport,
    models_dir: &Path,
) -> Result<SavedArtifacts> {
    std::fs::create_dir_all(models_dir)?;

    let primary = models_dir.join(format!("{}.mpk", PRIMARY_MODEL_STEM));
    model
        .clone()
        .save_file(models_dir.join(PRIMARY_MODEL_STEM), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;
    info!("モデルを保存しました: {}", primary.display());

    let compact = models_dir.join(format!("{}.mpk.gz", COMPACT_MODEL_STEM));
    model
        .clone()
        .save_file(models_dir.join(COMPACT_MODEL_STEM), &NamedMpkGzFileRecorder::<HalfPrecisionSettings>::new())?;
    info!("軽量モデルを保存しました: {}", compact.display());

    let model_binary = BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
    let metadata = ModelMetadata::new(
        mapping.reverse().to_vec(),
        IMAGE_SIZE as u32,
        report.epochs_run as u32,
        report.evaluation.loss,
        report.evaluation.accuracy,
    );
    let bundle = save_model_with_metadata(&models_dir.join(PRIMARY_MODEL_STEM), &metadata, &model_binary)?;

    let reverse_mapping = models_dir.join(REVERSE_MAPPING_FILE);
    mapping.save_reverse_mapping(&reverse_mapping)?;
    info!("逆引き表を保存しました: {}", reverse_mapping.display());

    Ok(SavedArtifacts {
        primary,
        bundle,
        compact,
        reverse_mapping,
    })
}
