// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shanan_defacer::{
  Defacer, FromUrl, Metrics,
  input::{InputWrapper, load_overlay},
  model::BlobDetectorBuilder,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("检测引擎: {}", args.detector);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("工作线程数量: {}", args.workers);

  let builder = BlobDetectorBuilder::from_url(&args.detector)?;
  let overlay = load_overlay(args.overlay.as_ref())?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let metrics = Metrics::new();
  let defacer = Defacer::with_pool(
    &args.config(),
    overlay,
    move |_| builder.build(),
    metrics.clone(),
  )?;

  OneShotTask.run_task(input, &defacer, output)?;

  info!("统计: {:?}", metrics.snapshot());
  Ok(())
}
