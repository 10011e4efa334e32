// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 遮面任务
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

use std::{
  thread,
  time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{deface::Defacer, input::InputFrame, output::Render, pool::RegionSource};

pub trait Task<I, S, O>: Sized {
  type Error;
  fn run_task(self, input: I, defacer: &Defacer<S>, output: O) -> Result<(), Self::Error>;
}

pub struct OneShotTask;

impl<S, RE, I, O> Task<I, S, O> for OneShotTask
where
  S: RegionSource,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = InputFrame>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, defacer: &Defacer<S>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧 {} 获取成功，开始处理...", frame.name);
    let now = Instant::now();
    let result = defacer.process_detailed(frame.bytes)?;
    let elapsed = now.elapsed();
    info!(
      "处理完成，检测到 {} 个区域，耗时: {:.2?}",
      result.regions.len(),
      elapsed
    );
    output.render_result(&result)?;
    info!("渲染完成，总耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 多线程重复处理同一帧，用于测量吞吐与合并效果
pub struct RepeatShotTask {
  pub repeat: usize,
  pub concurrency: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      repeat: 1000,
      concurrency: 8,
    }
  }
}

impl<S, RE, I, O> Task<I, S, O> for RepeatShotTask
where
  S: RegionSource,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = InputFrame>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, defacer: &Defacer<S>, output: O) -> Result<(), Self::Error> {
    if self.repeat == 0 || self.concurrency == 0 {
      anyhow::bail!("重复次数与并发数必须大于 0");
    }

    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!(
      "输入帧 {} 获取成功，{} 个线程各处理 {} 次...",
      frame.name, self.concurrency, self.repeat
    );

    let first = defacer.process_detailed(frame.bytes.clone())?;
    output.render_result(&first)?;

    let repeat = self.repeat;
    let started = Instant::now();
    let times = thread::scope(|scope| -> anyhow::Result<Vec<Duration>> {
      let handles: Vec<_> = (0..self.concurrency)
        .map(|worker| {
          let bytes = &frame.bytes;
          scope.spawn(move || -> anyhow::Result<Vec<Duration>> {
            let mut times = Vec::with_capacity(repeat);
            for i in 0..repeat {
              let now = Instant::now();
              defacer.process(bytes.clone())?;
              let elapsed = now.elapsed();
              debug!("({}/{})处理完成，耗时: {:.2?}", worker, i, elapsed);
              times.push(elapsed);
            }
            Ok(times)
          })
        })
        .collect();

      let mut times = Vec::new();
      for handle in handles {
        let worker_times = handle
          .join()
          .map_err(|_| anyhow::anyhow!("处理线程异常退出"))??;
        times.extend(worker_times);
      }
      Ok(times)
    })?;
    let total = started.elapsed();

    let mean = times.iter().sum::<Duration>() / times.len() as u32;
    warn!("平均处理时间: {:.2?}", mean);
    warn!(
      "总耗时: {:.2?}，吞吐: {:.1} 张/秒",
      total,
      times.len() as f64 / total.as_secs_f64()
    );

    let snapshot = defacer.metrics().snapshot();
    warn!(
      "缓存命中率: {:.1}%，缩放计算 {} 次，合并 {} 次",
      snapshot.cache_hit_ratio() * 100.0,
      snapshot.resize_computations,
      snapshot.coalesced_resizes
    );

    Ok(())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<S, RE, I, O> Task<I, S, O> for ContinuousTask
where
  S: RegionSource,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = InputFrame>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, defacer: &Defacer<S>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = crossbeam::channel::bounded(1);

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.try_send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let mut frame_index = 0usize;
    for frame in input {
      frame_index = frame_index.wrapping_add(1);
      info!("处理第 {} 帧图像: {}", frame_index, frame.name);
      let now = Instant::now();
      match defacer.process_detailed(frame.bytes) {
        Ok(result) => {
          let elapsed_a = now.elapsed();
          output.render_result(&result)?;
          info!(
            "处理完成，{} 个区域，耗时: {:.2?} / {:.2?}",
            result.regions.len(),
            elapsed_a,
            now.elapsed()
          );
        }
        // 单帧失败不影响后续帧
        Err(e) => warn!("第 {} 帧处理失败: {}", frame_index, e),
      }
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，退出");
    Ok(())
  }
}
