//! モデル推論機能

use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use burn::{
    backend::Wgpu,
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use tracing::{info, warn};

use crate::ml::ml_model::{MathSymbolCnn, ModelConfig};
use crate::model::{load_model_with_metadata, log_metadata_info, DeviceType, ModelMetadata};
use crate::preprocess::{IMAGE_SIZE, PIXELS_PER_IMAGE};
use crate::service::SymbolClassifier;

/// 推論エンジン
///
/// モデル本体は `Sync` でないため `Mutex` で包む。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<MathSymbolCnn<B>>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルバンドル（tar.gz）を読み込んで推論エンジンを初期化
    pub fn load(bundle_path: &Path, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(bundle_path)?;
        log_metadata_info(&metadata);
        Self::from_parts(metadata, model_binary, device)
    }

    /// メタデータと重みバイナリから初期化
    pub fn from_parts(metadata: ModelMetadata, model_binary: Vec<u8>, device: B::Device) -> Result<Self> {
        // 推論時はドロップアウトが効かないので率は関係ない
        let model = ModelConfig::new(metadata.num_classes).init::<B>(&device);

        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!("推論エンジンを初期化しました ({} クラス)", metadata.num_classes);

        Ok(Self {
            model: Mutex::new(model),
            metadata,
            device,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 正規化済み 32x32 画像1枚のクラス確率
    pub fn probabilities(&self, pixels: &[f32]) -> Result<Vec<f32>> {
        if pixels.len() != PIXELS_PER_IMAGE {
            anyhow::bail!(
                "入力画像のサイズが不正です: {} ピクセル (期待: {})",
                pixels.len(),
                PIXELS_PER_IMAGE
            );
        }

        let tensor = Tensor::<B, 1>::from_floats(pixels, &self.device)
            .reshape([1, 1, IMAGE_SIZE, IMAGE_SIZE]);

        let model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("モデルのロックが破損しています"))?;
        let output = model.forward_probabilities(tensor);

        output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
    }
}

impl<B: Backend> SymbolClassifier for InferenceEngine<B> {
    fn predict(&self, pixels: &[f32]) -> Result<Vec<f64>> {
        Ok(self.probabilities(pixels)?.into_iter().map(f64::from).collect())
    }

    fn num_classes(&self) -> usize {
        self.metadata.num_classes
    }
}

/// 設定されたデバイスでモデルバンドルを読み込む
///
/// GPU アダプタが無いと wgpu バックエンドは初期化時に panic するため、
/// その場合は CPU で読み込み直す。
pub fn load_classifier(bundle_path: &Path, device_type: DeviceType) -> Result<Arc<dyn SymbolClassifier>> {
    info!("モデルを読み込みます: {} ({})", bundle_path.display(), device_type);

    let classifier: Arc<dyn SymbolClassifier> = match device_type {
        DeviceType::Wgpu => {
            let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
                InferenceEngine::<Wgpu>::load(bundle_path, WgpuDevice::default())
            }));
            match loaded {
                Ok(engine) => Arc::new(engine?),
                Err(cause) => {
                    warn!(
                        "wgpu デバイスを初期化できませんでした ({})。CPU で読み込みます",
                        panic_message(cause.as_ref())
                    );
                    load_on_cpu(bundle_path)?
                }
            }
        }
        DeviceType::Cpu => load_on_cpu(bundle_path)?,
    };
    Ok(classifier)
}

fn load_on_cpu(bundle_path: &Path) -> Result<Arc<dyn SymbolClassifier>> {
    Ok(Arc::new(InferenceEngine::<NdArray<f32>>::load(
        bundle_path,
        NdArrayDevice::Cpu,
    )?))
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_map::LabelMapping;
    use crate::ml::training::{save_all, Evaluation, TrainingReport};

    type TestBackend = NdArray<f32>;

    fn report() -> TrainingReport {
        TrainingReport {
            epochs_run: 1,
            stopped_early: false,
            best_val_accuracy: None,
            evaluation: Evaluation {
                loss: 2.0,
                accuracy: 0.25,
            },
            history: Vec::new(),
        }
    }

    fn sample_pixels() -> Vec<f32> {
        (0..PIXELS_PER_IMAGE).map(|i| ((i * 7) % 13) as f32 / 12.0).collect()
    }

    #[test]
    fn test_bundle_round_trip_keeps_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(4).init::<TestBackend>(&device);

        let pixels = sample_pixels();
        let input = Tensor::<TestBackend, 1>::from_floats(pixels.as_slice(), &device)
            .reshape([1, 1, IMAGE_SIZE, IMAGE_SIZE]);
        let expected = model
            .forward_probabilities(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();

        let mapping = LabelMapping::from_symbol_ids(&[10, 20, 30, 40]);
        let saved = save_all(model, &mapping, &report(), dir.path()).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&saved.bundle, device).unwrap();
        assert_eq!(engine.num_classes(), 4);
        assert_eq!(engine.metadata().class_symbol_ids, vec![10, 20, 30, 40]);

        let probs = engine.predict(&pixels).unwrap();
        assert_eq!(probs.len(), 4);
        for (a, b) in probs.iter().zip(&expected) {
            assert!((a - f64::from(*b)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_wrong_input_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = ModelConfig::new(2).init::<TestBackend>(&NdArrayDevice::Cpu);
        let mapping = LabelMapping::from_symbol_ids(&[1, 2]);
        let saved = save_all(model, &mapping, &report(), dir.path()).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&saved.bundle, NdArrayDevice::Cpu).unwrap();
        assert!(engine.probabilities(&[0.5; 10]).is_err());
    }

    #[test]
    fn test_load_classifier_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_classifier(&dir.path().join("absent.tar.gz"), DeviceType::Cpu);
        assert!(result.is_err());

        let result = load_classifier(&dir.path().join("absent.tar.gz"), DeviceType::Wgpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_classifier_with_default_device() {
        let dir = tempfile::tempdir().unwrap();
        let model = ModelConfig::new(3).init::<TestBackend>(&NdArrayDevice::Cpu);
        let mapping = LabelMapping::from_symbol_ids(&[5, 6, 7]);
        let saved = save_all(model, &mapping, &report(), dir.path()).unwrap();

        // GPU の無い環境でも CPU に切り替わって読み込める
        let classifier = load_classifier(&saved.bundle, DeviceType::default()).unwrap();
        assert_eq!(classifier.num_classes(), 3);
        let probs = classifier.predict(&sample_pixels()).unwrap();
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_service_starts_with_default_config() {
        use crate::model::AppConfig;
        use crate::service::ServiceContext;
        use crate::symbols::SymbolTable;
        use crate::types::SymbolEntry;

        let dir = tempfile::tempdir().unwrap();
        let model = ModelConfig::new(2).init::<TestBackend>(&NdArrayDevice::Cpu);
        let mapping = LabelMapping::from_symbol_ids(&[31, 82]);
        let saved = save_all(model, &mapping, &report(), dir.path()).unwrap();

        let mut symbols = SymbolTable::new();
        symbols.insert(0, SymbolEntry::new("A", "A"));
        symbols.insert(1, SymbolEntry::new("\\alpha", "α"));
        let labels_path = dir.path().join("labels.json");
        symbols.save(&labels_path).unwrap();

        let mut config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        config.server.model_path = saved.bundle;
        config.server.labels_path = labels_path;

        let ctx = ServiceContext::from_config(&config);
        assert!(ctx.model_loaded());
        assert!(ctx.labels_loaded());
        assert_eq!(ctx.num_classes(), 2);
    }
}
