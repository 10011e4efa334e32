// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续处理目录中的图像
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_defacer::{
  DefaceConfig, Defacer, FromUrl, Metrics,
  input::{InputWrapper, load_overlay},
  model::BlobDetectorBuilder,
  output::OutputWrapper,
  task::{ContinuousTask, Task},
};
use tracing::info;

/// Shanan 遮面参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测引擎参数
  #[arg(long, default_value = "blob:", value_name = "DETECTOR")]
  pub detector: Url,
  /// 叠加图
  #[arg(long, value_name = "OVERLAY")]
  pub overlay: Option<Url>,
  /// 输入来源，例如 folder:///path/images
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 folder:///path/out?record
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 检测工作线程数量
  #[arg(long, default_value = "4", value_name = "COUNT")]
  pub workers: usize,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测引擎: {}", args.detector);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let builder = BlobDetectorBuilder::from_url(&args.detector)?;
  let overlay = load_overlay(args.overlay.as_ref())?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let metrics = Metrics::new();
  let config = DefaceConfig::default().with_worker_count(args.workers);
  let defacer = Defacer::with_pool(&config, overlay, move |_| builder.build(), metrics.clone())?;

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .run_task(input, &defacer, output)?;

  info!("统计: {:?}", metrics.snapshot());
  Ok(())
}
