// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use clap::Parser;
use shanan_defacer::{DefaceConfig, config};
use url::Url;

/// Shanan 遮面服务参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测引擎参数
  /// - blob:                     使用内置参数
  /// - blob:///path/params.json  从文件加载参数
  #[arg(long, default_value = "blob:", value_name = "DETECTOR")]
  pub detector: Url,

  /// 叠加图，例如 image:///path/overlay.png；缺省时使用内置叠加图
  #[arg(long, value_name = "OVERLAY")]
  pub overlay: Option<Url>,

  /// 输入图像，例如 image:///path/in.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出路径，例如 image:///path/out.png 或 folder:///dir?record
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 检测工作线程数量
  #[arg(long, default_value_t = config::DEFAULT_WORKER_COUNT, value_name = "COUNT")]
  pub workers: usize,

  /// 缩放合并最短等待时间（毫秒）
  #[arg(long, default_value = "10", value_name = "MILLIS")]
  pub coalesce_backoff_ms: u64,
}

impl Args {
  pub fn config(&self) -> DefaceConfig {
    DefaceConfig::default()
      .with_worker_count(self.workers)
      .with_coalesce_backoff(
        Duration::from_millis(self.coalesce_backoff_ms),
        config::COALESCE_MAX_BACKOFF,
      )
  }
}
