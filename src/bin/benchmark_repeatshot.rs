// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 并发重复处理基准
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_defacer::{
  DefaceConfig, Defacer, FromUrl, Metrics,
  input::{InputWrapper, load_overlay},
  model::BlobDetectorBuilder,
  output::OutputWrapper,
  task::{RepeatShotTask, Task},
};
use tracing::info;

/// Shanan 遮面基准参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测引擎参数
  #[arg(long, default_value = "blob:", value_name = "DETECTOR")]
  pub detector: Url,
  /// 叠加图
  #[arg(long, value_name = "OVERLAY")]
  pub overlay: Option<Url>,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，只保存第一次的结果
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 检测工作线程数量
  #[arg(long, default_value = "16", value_name = "COUNT")]
  pub workers: usize,
  /// 并发调用线程数量
  #[arg(long, default_value = "8", value_name = "COUNT")]
  pub concurrency: usize,
  /// 每个线程的重复次数
  #[arg(long, default_value = "100", value_name = "COUNT")]
  pub repeat: usize,
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

  let config = DefaceConfig::default().with_worker_count(args.workers);
  let defacer = Defacer::with_pool(&config, overlay, move |_| builder.build(), Metrics::new())?;

  RepeatShotTask {
    repeat: args.repeat,
    concurrency: args.concurrency,
  }
  .run_task(input, &defacer, output)?;

  Ok(())
}
