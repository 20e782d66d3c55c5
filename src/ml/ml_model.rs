//! 数式記号分類用 CNN の定義
//!
//! # アーキテクチャ
//! - {Conv 3x3 (same padding, バイアス無し) + BatchNorm + ReLU + MaxPool 2x2} x 3層 (32/64/128)
//! - Conv 3x3 (256, バイアス無し) + BatchNorm + ReLU
//! - Global Average Pooling
//! - FC: 256 -> 256 + ReLU + BatchNorm + Dropout
//! - FC: 256 -> num_classes
//! - Softmax (推論時)
//!
//! データ拡張は学習バッチ作成時に CPU 側で行う（[`crate::ml::augment`]）。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

/// 畳み込みブロックのフィルタ数（最後のブロックのみプーリング無し）
const BLOCK_FILTERS: [usize; 4] = [32, 64, 128, 256];

/// 全結合隠れ層のユニット数
const HIDDEN_UNITS: usize = 256;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MathSymbolCnn<B> {
        let mut blocks = Vec::with_capacity(BLOCK_FILTERS.len());
        let mut in_channels = 1;

        for (i, &filters) in BLOCK_FILTERS.iter().enumerate() {
            let downsample = i + 1 < BLOCK_FILTERS.len();
            blocks.push(ConvBlock::new(in_channels, filters, downsample, device));
            in_channels = filters;
        }

        MathSymbolCnn {
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(in_channels, HIDDEN_UNITS).init(device),
            hidden_norm: BatchNormConfig::new(HIDDEN_UNITS).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// Conv + BatchNorm + ReLU (+ MaxPool)
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
    activation: Relu,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, downsample: bool, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            activation: Relu::new(),
            pool: downsample.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// 数式記号分類用CNNモデル
#[derive(Module, Debug)]
pub struct MathSymbolCnn<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    global_pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    hidden_norm: BatchNorm<B>,
    dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> MathSymbolCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 32, 32]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }

        // [batch, 256, 1, 1] -> [batch, 256]
        let x = self.global_pool.forward(x);
        let [_, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);

        // BatchNorm はチャネル次元を2番目に持つ4次元で適用する
        let x = x.reshape([batch_size, HIDDEN_UNITS, 1, 1]);
        let x = self.hidden_norm.forward(x);
        let x = x.reshape([batch_size, HIDDEN_UNITS]);

        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 隠れ層の重みに対する L2 正則化項 `coefficient * Σw²`
    pub fn l2_penalty(&self, coefficient: f64) -> Tensor<B, 1> {
        self.hidden
            .weight
            .val()
            .powf_scalar(2.0)
            .sum()
            .mul_scalar(coefficient)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失 = ラベルスムージング付き交差エントロピー + L2 正則化項
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        label_smoothing: f32,
        l2_penalty: f64,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let smoothing = (label_smoothing > 0.0).then_some(label_smoothing);
        let loss = CrossEntropyLossConfig::new()
            .with_smoothing(smoothing)
            .init(&output.device())
            .forward(output.clone(), targets.clone());
        let loss = loss + self.l2_penalty(l2_penalty);

        ClassificationOutput::new(loss, output, targets)
    }
}
