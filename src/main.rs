//! 手書き数式記号の推論サーバー
//!
//! 使い方:
//!   math_ocr [--config config.json] [--host 0.0.0.0] [--port 5000]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use math_ocr_lib::model::AppConfig;
use math_ocr_lib::server;
use math_ocr_lib::service::ServiceContext;

#[derive(Parser)]
#[command(name = "math_ocr")]
#[command(about = "Handwritten math symbol recognition server")]
#[command(version)]
struct Args {
    /// 設定ファイル（既定: config.json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 待ち受けアドレス（設定ファイルより優先）
    #[arg(long)]
    host: Option<String>,

    /// 待ち受けポート（設定ファイルより優先）
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    math_ocr_lib::init_logging();

    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default_from(&config_path);
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("{}", "=".repeat(50));
    info!("数式記号認識モデルを読み込みます...");
    let ctx = ServiceContext::from_config(&config);
    if !ctx.model_loaded() {
        warn!("モデル無しで起動します。/predict はエラーを返します");
    }
    if !ctx.labels_loaded() {
        warn!("記号表無しで起動します");
    }
    info!("{}", "=".repeat(50));

    server::serve(&config.server, Arc::new(ctx)).await
}
