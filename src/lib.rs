#![recursion_limit = "256"]

pub mod types;
pub mod csv_loader;
pub mod preprocess;
pub mod dataset;
pub mod label_map;
pub mod symbols;
pub mod monitor;
pub mod verdict;

// 推論サーバー
pub mod error;
pub mod service;
pub mod server;

pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

use tracing_subscriber::EnvFilter;

/// ログ出力を初期化（`RUST_LOG` が無ければ info）
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
