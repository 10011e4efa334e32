// 该文件是 Shanan （山南西风） 项目的一部分。
// src/resize.rs - 叠加图缩放合并调度
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

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, after, bounded, select};
use image::{RgbaImage, imageops::FilterType};
use tracing::{debug, error, info, warn};

use crate::{
  cache::{Overlay, OverlayCache},
  config::DefaceConfig,
  error::Result,
  metrics::Metrics,
  model::OverlaySize,
};

const INBOX_CAPACITY: usize = 1000;
const BACKOFF_FACTOR: u32 = 2;

struct ResizeRequest {
  size: OverlaySize,
  reply: Sender<Overlay>,
}

/// 两次派发之间累积的请求，按尺寸分组；每次派发后整体丢弃
type ResizeBatch = HashMap<OverlaySize, Vec<Sender<Overlay>>>;

#[derive(Debug, Clone, Copy)]
pub struct CoalescePolicy {
  pub min_backoff: Duration,
  pub max_backoff: Duration,
  pub max_delay: Duration,
}

impl From<&DefaceConfig> for CoalescePolicy {
  fn from(config: &DefaceConfig) -> Self {
    Self {
      min_backoff: config.coalesce_min_backoff,
      max_backoff: config.coalesce_max_backoff,
      max_delay: config.coalesce_max_delay,
    }
  }
}

/// 空批次时等待间隔按固定倍数增长，不超过上限
fn grow_backoff(current: Duration, max: Duration) -> Duration {
  current.saturating_mul(BACKOFF_FACTOR).min(max)
}

struct ResizeShared {
  source: Overlay,
  cache: Arc<OverlayCache>,
  metrics: Metrics,
}

impl ResizeShared {
  fn compute(&self, size: OverlaySize) -> Overlay {
    self.metrics.inc_resize_computations();
    if size.width == 0 || size.height == 0 {
      return Arc::new(RgbaImage::new(size.width, size.height));
    }
    Arc::new(image::imageops::resize(
      &*self.source,
      size.width,
      size.height,
      FilterType::CatmullRom,
    ))
  }

  /// 同一尺寸只计算一次，所有等待者拿到同一份结果
  fn serve(&self, size: OverlaySize, waiters: Vec<Sender<Overlay>>) {
    let bitmap = match self.cache.get(size) {
      Some(bitmap) => bitmap,
      None => {
        let bitmap = self.compute(size);
        self.cache.set(size, bitmap.clone());
        bitmap
      }
    };

    for waiter in &waiters {
      // 调用方可能已经放弃等待
      let _ = waiter.send(bitmap.clone());
    }
    if waiters.len() > 1 {
      self.metrics.add_coalesced_resizes(waiters.len() as u64 - 1);
    }
  }
}

/// 叠加图缩放合并调度器
///
/// 单线程循环累积请求，空闲计时器到期后按尺寸分组派发，
/// 每个尺寸在独立线程上计算一次。
pub struct ResizeCoalescer {
  inbox: Sender<ResizeRequest>,
  shared: Arc<ResizeShared>,
}

impl ResizeCoalescer {
  pub fn new(
    source: RgbaImage,
    cache: Arc<OverlayCache>,
    policy: CoalescePolicy,
    metrics: Metrics,
  ) -> Result<Self> {
    let (inbox, requests) = bounded(INBOX_CAPACITY);
    let shared = Arc::new(ResizeShared {
      source: Arc::new(source),
      cache,
      metrics,
    });

    let loop_shared = shared.clone();
    thread::Builder::new()
      .name("resize-coalescer".to_string())
      .spawn(move || coalesce(requests, loop_shared, policy))?;
    info!(
      "缩放合并调度器已启动，源图尺寸 {}x{}",
      shared.source.width(),
      shared.source.height()
    );

    Ok(Self { inbox, shared })
  }

  pub fn source(&self) -> &RgbaImage {
    &self.shared.source
  }

  /// 阻塞直到本次请求所在批次完成，返回精确尺寸的叠加图
  pub fn resize(&self, size: OverlaySize) -> Overlay {
    let (reply, response) = bounded(1);
    if self.inbox.send(ResizeRequest { size, reply }).is_ok()
      && let Ok(bitmap) = response.recv()
    {
      return bitmap;
    }

    warn!(
      "合并调度不可用，直接缩放 {}x{}",
      size.width, size.height
    );
    self.shared.compute(size)
  }
}

fn coalesce(requests: Receiver<ResizeRequest>, shared: Arc<ResizeShared>, policy: CoalescePolicy) {
  let mut backoff = policy.min_backoff;
  let mut batch = ResizeBatch::new();
  let mut opened: Option<Instant> = None;

  loop {
    let wait = match opened {
      Some(start) => backoff.min(policy.max_delay.saturating_sub(start.elapsed())),
      None => backoff,
    };

    select! {
      recv(requests) -> request => match request {
        Ok(ResizeRequest { size, reply }) => {
          batch.entry(size).or_default().push(reply);
          opened.get_or_insert_with(Instant::now);
          backoff = policy.min_backoff;
        }
        Err(_) => {
          if !batch.is_empty() {
            dispatch(&shared, std::mem::take(&mut batch));
          }
          break;
        }
      },
      recv(after(wait)) -> _ => {
        if batch.is_empty() {
          backoff = grow_backoff(backoff, policy.max_backoff);
        } else {
          dispatch(&shared, std::mem::take(&mut batch));
          opened = None;
        }
      }
    }
  }

  debug!("缩放合并调度器退出");
}

fn dispatch(shared: &Arc<ResizeShared>, batch: ResizeBatch) {
  debug!(
    "派发缩放批次: {} 种尺寸, {} 个请求",
    batch.len(),
    batch.values().map(Vec::len).sum::<usize>()
  );

  for (size, waiters) in batch {
    let task_shared = shared.clone();
    let spawned = thread::Builder::new()
      .name(format!("resize-{}x{}", size.width, size.height))
      .spawn(move || task_shared.serve(size, waiters));
    if let Err(e) = spawned {
      // 等待者的通道随闭包一起被丢弃，调用方会自行回退到直接缩放
      error!("无法启动缩放任务 {}x{}: {}", size.width, size.height, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;
  use std::sync::Barrier;

  const HOUR: Duration = Duration::from_secs(3600);

  fn coalescer(min_backoff: Duration, metrics: &Metrics) -> ResizeCoalescer {
    let cache = Arc::new(OverlayCache::new(HOUR, HOUR, metrics.clone()));
    let policy = CoalescePolicy {
      min_backoff,
      max_backoff: Duration::from_secs(1),
      max_delay: Duration::from_secs(1),
    };
    let source = RgbaImage::from_fn(32, 32, |x, y| Rgba([x as u8 * 8, y as u8 * 8, 128, 200]));
    ResizeCoalescer::new(source, cache, policy, metrics.clone()).unwrap()
  }

  #[test]
  fn backoff_grows_geometrically_and_is_capped() {
    let max = Duration::from_millis(100);
    let mut backoff = Duration::from_millis(10);
    let mut seen = Vec::new();
    for _ in 0..6 {
      backoff = grow_backoff(backoff, max);
      seen.push(backoff.as_millis());
    }
    assert_eq!(seen, vec![20, 40, 80, 100, 100, 100]);
  }

  #[test]
  fn resize_returns_exact_size() {
    let metrics = Metrics::new();
    let coalescer = coalescer(Duration::from_millis(10), &metrics);
    let bitmap = coalescer.resize(OverlaySize::new(101, 102));
    assert_eq!(bitmap.dimensions(), (101, 102));
  }

  #[test]
  fn distinct_sizes_never_mix() {
    let metrics = Metrics::new();
    let coalescer = Arc::new(coalescer(Duration::from_millis(10), &metrics));
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12u32)
      .map(|i| {
        let coalescer = coalescer.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          let size = OverlaySize::new(10 + i % 3, 20 + i % 4);
          barrier.wait();
          (size, coalescer.resize(size))
        })
      })
      .collect();

    for handle in handles {
      let (size, bitmap) = handle.join().unwrap();
      assert_eq!(bitmap.dimensions(), (size.width, size.height));
    }
  }

  #[test]
  fn identical_sizes_share_one_computation() {
    const CALLERS: usize = 16;
    let metrics = Metrics::new();
    let coalescer = Arc::new(coalescer(Duration::from_millis(100), &metrics));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
      .map(|_| {
        let coalescer = coalescer.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          coalescer.resize(OverlaySize::new(64, 48))
        })
      })
      .collect();
    let results: Vec<Overlay> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for bitmap in &results[1..] {
      assert!(Arc::ptr_eq(bitmap, &results[0]));
    }
    let snap = metrics.snapshot();
    assert_eq!(snap.resize_computations, 1);
    assert_eq!(snap.cache_misses, 1);
    assert_eq!(snap.coalesced_resizes, CALLERS as u64 - 1);
  }

  #[test]
  fn repeated_size_is_served_from_cache() {
    let metrics = Metrics::new();
    let coalescer = coalescer(Duration::from_millis(5), &metrics);
    let first = coalescer.resize(OverlaySize::new(7, 7));
    let second = coalescer.resize(OverlaySize::new(7, 7));

    assert!(Arc::ptr_eq(&first, &second));
    let snap = metrics.snapshot();
    assert_eq!(snap.resize_computations, 1);
    assert_eq!(snap.cache_hits, 1);
  }
}
