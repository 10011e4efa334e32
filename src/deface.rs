// 该文件是 Shanan （山南西风） 项目的一部分。
// src/deface.rs - 遮面流程编排
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

use std::sync::Arc;
use std::thread;

use image::{Rgba, RgbaImage, imageops};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
  cache::OverlayCache,
  config::DefaceConfig,
  error::Result,
  metrics::Metrics,
  model::{Detector, Region},
  pool::{DetectorPool, RegionSource},
  resize::{CoalescePolicy, ResizeCoalescer},
};

/// 一次处理的结果：合成后的图像与绘制过的区域
#[derive(Debug, Clone)]
pub struct Defaced {
  pub image: RgbaImage,
  pub regions: Vec<Region>,
}

/// "over" 合成，叠加图的 alpha 同时作为源与遮罩，有效覆盖率为 a·a
fn blend_masked(dst: &mut Rgba<u8>, src: &Rgba<u8>) {
  let alpha = src[3] as f32 / 255.0;
  if alpha == 0.0 {
    return;
  }
  let coverage = alpha * alpha;
  let dst_alpha = dst[3] as f32 / 255.0;
  let out_alpha = coverage + dst_alpha * (1.0 - coverage);

  for c in 0..3 {
    let premul = src[c] as f32 / 255.0 * coverage
      + dst[c] as f32 / 255.0 * dst_alpha * (1.0 - coverage);
    dst[c] = (premul / out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
  }
  dst[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
}

fn draw_region(canvas: &mut RgbaImage, overlay: &RgbaImage, region: &Region) {
  for (x, y, pixel) in overlay.enumerate_pixels() {
    let (cx, cy) = (region.min_x + x, region.min_y + y);
    if cx < canvas.width() && cy < canvas.height() {
      blend_masked(canvas.get_pixel_mut(cx, cy), pixel);
    }
  }
}

/// 检测并在每个区域上叠加缩放后的叠加图
pub struct Defacer<S> {
  source: S,
  coalescer: Arc<ResizeCoalescer>,
  metrics: Metrics,
}

impl<S: RegionSource> Defacer<S> {
  pub fn new(source: S, coalescer: Arc<ResizeCoalescer>, metrics: Metrics) -> Self {
    Self {
      source,
      coalescer,
      metrics,
    }
  }

  /// 按配置创建叠加图缓存与缩放合并调度器
  pub fn with_source(
    config: &DefaceConfig,
    overlay: RgbaImage,
    source: S,
    metrics: Metrics,
  ) -> Result<Self> {
    let cache = Arc::new(OverlayCache::new(
      config.cache_ttl,
      config.cache_sweep_interval,
      metrics.clone(),
    ));
    let coalescer = ResizeCoalescer::new(
      overlay,
      cache,
      CoalescePolicy::from(config),
      metrics.clone(),
    )?;
    Ok(Self::new(source, Arc::new(coalescer), metrics))
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn metrics(&self) -> &Metrics {
    &self.metrics
  }

  pub fn process(&self, bytes: Vec<u8>) -> Result<RgbaImage> {
    Ok(self.process_detailed(bytes)?.image)
  }

  pub fn process_detailed(&self, bytes: Vec<u8>) -> Result<Defaced> {
    let detected = self.source.scan(bytes)?;
    let image = self.composite(&detected.image, &detected.regions);
    Ok(Defaced {
      image,
      regions: detected.regions,
    })
  }

  /// 把叠加图画到源图副本上
  ///
  /// 一个区域时在当前线程绘制；多个区域时每个区域一个线程，
  /// 共享同一块画布，写入由一把锁串行化。返回前等待全部区域完成。
  pub fn composite(&self, image: &RgbaImage, regions: &[Region]) -> RgbaImage {
    let mut canvas = RgbaImage::new(image.width(), image.height());
    imageops::replace(&mut canvas, image, 0, 0);

    match regions {
      [] => canvas,
      [region] => {
        let overlay = self.coalescer.resize(region.size());
        draw_region(&mut canvas, &overlay, region);
        canvas
      }
      _ => {
        debug!("并发绘制 {} 个区域", regions.len());
        let canvas = Mutex::new(canvas);
        thread::scope(|scope| {
          for region in regions {
            let canvas = &canvas;
            let coalescer = &self.coalescer;
            let draw = move || {
              let overlay = coalescer.resize(region.size());
              draw_region(&mut canvas.lock(), &overlay, region);
            };
            let spawned = thread::Builder::new()
              .name(format!("draw-{}x{}", region.width(), region.height()))
              .spawn_scoped(scope, draw.clone());
            if let Err(e) = spawned {
              warn!("无法启动绘制线程，改为同步绘制: {}", e);
              draw();
            }
          }
        });
        canvas.into_inner()
      }
    }
  }
}

impl Defacer<DetectorPool> {
  /// 创建检测工作池以及叠加图缩放链路
  pub fn with_pool<F, D, E>(
    config: &DefaceConfig,
    overlay: RgbaImage,
    factory: F,
    metrics: Metrics,
  ) -> Result<Self>
  where
    F: Fn(usize) -> std::result::Result<D, E> + Send + Sync + 'static,
    D: Detector + 'static,
    D::Error: std::error::Error + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
  {
    let pool = DetectorPool::new(config.worker_count, factory, metrics.clone())?;
    Self::with_source(config, overlay, pool, metrics)
  }
}
