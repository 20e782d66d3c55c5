//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・パス・学習設定・サーバー設定を JSON 形式で保存・読み込みします。
//! 設定ファイルが無ければ既定値（固定の定数と同じ値）を使います。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("不明なデバイス: {}", other)),
        }
    }
}

/// ファイル配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// データセットディレクトリ
    pub dataset_dir: PathBuf,
    /// データセットディレクトリ内のラベル表ファイル名
    pub labels_file: String,
    /// 学習済みモデルの出力先
    pub models_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset/HASYv2"),
            labels_file: "hasy-data-labels.csv".to_string(),
            models_dir: PathBuf::from("models"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// ドロップアウト率
    pub dropout: f64,
    /// 隠れ層の重みにかける L2 正則化係数
    pub l2_penalty: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dropout: 0.5,
            l2_penalty: 1e-4,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 最大エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 初期学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_ratio: f32,
    /// ラベルスムージング
    pub label_smoothing: f32,
    /// 学習率を下げる倍率
    pub lr_reduce_factor: f64,
    /// 学習率を下げるまでの停滞エポック数
    pub lr_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// 早期終了までの停滞エポック数
    pub early_stopping_patience: usize,
    /// 学習時のデータ拡張
    #[serde(default = "default_augment")]
    pub augment: bool,
}

fn default_augment() -> bool {
    true
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            batch_size: 128,
            learning_rate: 1e-3,
            seed: 42,
            validation_ratio: 0.2,
            label_smoothing: 0.1,
            lr_reduce_factor: 0.5,
            lr_patience: 5,
            min_learning_rate: 1e-6,
            early_stopping_patience: 10,
            augment: true,
        }
    }
}

/// 推論サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// 推論に使うモデルバンドル（metadata.json + model.bin の tar.gz）
    pub model_path: PathBuf,
    /// クラスインデックスをキーとする記号表
    pub labels_path: PathBuf,
    /// アップロードの最大バイト数
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            model_path: PathBuf::from("models/math_ocr_model.tar.gz"),
            labels_path: PathBuf::from("models/labels.json"),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        info!("計算デバイス: {}", self.device_type);
        info!(
            "データセット: {} ({})",
            self.paths.dataset_dir.display(),
            self.paths.labels_file
        );
        info!("モデル出力先: {}", self.paths.models_dir.display());
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.num_epochs, 50);
        assert_eq!(config.training.batch_size, 128);
        assert_eq!(config.training.early_stopping_patience, 10);
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.paths.labels_file, deserialized.paths.labels_file);
        assert_eq!(config.server.model_path, deserialized.server.model_path);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"device_type": "Cpu"}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.learning_rate, 1e-3);
    }

    #[test]
    fn test_broken_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_device_type_display_and_parse() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
        assert_eq!("cpu".parse::<DeviceType>(), Ok(DeviceType::Cpu));
        assert!("tpu".parse::<DeviceType>().is_err());
    }
}
