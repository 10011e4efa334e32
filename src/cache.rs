// 该文件是 Shanan （山南西风） 项目的一部分。
// src/cache.rs - 叠加图缓存
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
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{metrics::Metrics, model::OverlaySize};

/// 缩放后的叠加图，所有等待者共享同一份像素
pub type Overlay = Arc<RgbaImage>;

struct CacheEntry {
  bitmap: Overlay,
  last_access: Instant,
}

struct CacheInner {
  entries: Mutex<HashMap<OverlaySize, CacheEntry>>,
  ttl: Duration,
  metrics: Metrics,
}

impl CacheInner {
  /// 删除 `now - last_access > ttl` 的条目，返回删除数量
  fn sweep(&self, now: Instant) -> usize {
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.ttl);
    let evicted = before - entries.len();
    drop(entries);

    if evicted > 0 {
      self.metrics.sub_cache_items(evicted);
    }
    evicted
  }
}

/// 按精确尺寸索引的叠加图缓存
///
/// 后台清扫线程在第一次访问时才启动，且只会启动一次。
/// 清扫线程只持有弱引用，缓存被丢弃后随之退出。
pub struct OverlayCache {
  inner: Arc<CacheInner>,
  sweep_interval: Duration,
  sweeper: Once,
}

impl OverlayCache {
  pub fn new(ttl: Duration, sweep_interval: Duration, metrics: Metrics) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        entries: Mutex::new(HashMap::new()),
        ttl,
        metrics,
      }),
      sweep_interval,
      sweeper: Once::new(),
    }
  }

  pub fn get(&self, size: OverlaySize) -> Option<Overlay> {
    self.start_sweeper();

    let hit = {
      let mut entries = self.inner.entries.lock();
      entries.get_mut(&size).map(|entry| {
        entry.last_access = Instant::now();
        entry.bitmap.clone()
      })
    };

    match hit {
      Some(_) => self.inner.metrics.inc_cache_hits(),
      None => self.inner.metrics.inc_cache_misses(),
    }
    hit
  }

  pub fn set(&self, size: OverlaySize, bitmap: Overlay) {
    self.start_sweeper();

    let replaced = self.inner.entries.lock().insert(
      size,
      CacheEntry {
        bitmap,
        last_access: Instant::now(),
      },
    );

    if replaced.is_none() {
      self.inner.metrics.inc_cache_items();
    }
  }

  pub fn len(&self) -> usize {
    self.inner.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[cfg(test)]
  fn sweeper_started(&self) -> bool {
    self.sweeper.is_completed()
  }

  fn start_sweeper(&self) {
    self.sweeper.call_once(|| {
      let inner = Arc::downgrade(&self.inner);
      let interval = self.sweep_interval;
      let spawned = thread::Builder::new()
        .name("overlay-cache-sweep".to_string())
        .spawn(move || sweep_loop(inner, interval));
      match spawned {
        Ok(_) => info!("缓存清扫线程已启动，周期 {:?}", interval),
        Err(e) => error!("无法启动缓存清扫线程: {}", e),
      }
    });
  }
}

fn sweep_loop(inner: Weak<CacheInner>, interval: Duration) {
  let ticker = crossbeam::channel::tick(interval);
  for now in ticker.iter() {
    let Some(inner) = inner.upgrade() else {
      break;
    };
    let evicted = inner.sweep(now);
    if evicted > 0 {
      debug!("缓存清扫: 淘汰 {} 个条目", evicted);
    }
  }
  debug!("缓存已释放，清扫线程退出");
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  const HOUR: Duration = Duration::from_secs(3600);

  fn bitmap(size: OverlaySize) -> Overlay {
    Arc::new(RgbaImage::from_pixel(
      size.width,
      size.height,
      Rgba([1, 2, 3, 4]),
    ))
  }

  #[test]
  fn get_after_set_returns_same_bitmap() {
    let cache = OverlayCache::new(HOUR, HOUR, Metrics::new());
    let size = OverlaySize::new(10, 20);
    assert!(cache.get(size).is_none());

    let b = bitmap(size);
    cache.set(size, b.clone());
    let got = cache.get(size).unwrap();
    assert!(Arc::ptr_eq(&got, &b));
  }

  #[test]
  fn set_replaces_existing_entry() {
    let metrics = Metrics::new();
    let cache = OverlayCache::new(HOUR, HOUR, metrics.clone());
    let size = OverlaySize::new(4, 4);
    cache.set(size, bitmap(size));
    let second = bitmap(size);
    cache.set(size, second.clone());

    assert_eq!(cache.len(), 1);
    assert_eq!(metrics.snapshot().cache_items, 1);
    assert!(Arc::ptr_eq(&cache.get(size).unwrap(), &second));
  }

  #[test]
  fn neighbouring_sizes_are_distinct() {
    let cache = OverlayCache::new(HOUR, HOUR, Metrics::new());
    cache.set(OverlaySize::new(100, 100), bitmap(OverlaySize::new(100, 100)));
    assert!(cache.get(OverlaySize::new(100, 101)).is_none());
  }

  #[test]
  fn sweep_evicts_only_expired_entries() {
    let metrics = Metrics::new();
    let ttl = Duration::from_secs(300);
    let cache = OverlayCache::new(ttl, HOUR, metrics.clone());
    let size = OverlaySize::new(10, 20);
    cache.set(size, bitmap(size));

    assert_eq!(cache.inner.sweep(Instant::now() + ttl / 2), 0);
    assert!(cache.get(size).is_some());

    assert_eq!(cache.inner.sweep(Instant::now() + ttl + Duration::from_secs(1)), 1);
    assert!(cache.get(size).is_none());

    let snap = metrics.snapshot();
    assert_eq!(snap.cache_items, 0);
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.cache_misses, 1);
  }

  #[test]
  fn get_refreshes_last_access() {
    let ttl = Duration::from_millis(50);
    let cache = OverlayCache::new(ttl, HOUR, Metrics::new());
    let size = OverlaySize::new(3, 3);
    cache.set(size, bitmap(size));

    thread::sleep(Duration::from_millis(40));
    assert!(cache.get(size).is_some());

    // 按写入时间已过期，按最近访问时间仍然有效
    assert_eq!(cache.inner.sweep(Instant::now() + Duration::from_millis(20)), 0);
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn background_sweep_evicts_idle_entries() {
    let cache = OverlayCache::new(
      Duration::from_millis(20),
      Duration::from_millis(10),
      Metrics::new(),
    );
    let size = OverlaySize::new(8, 8);
    cache.set(size, bitmap(size));

    thread::sleep(Duration::from_millis(300));
    assert!(cache.is_empty());
    assert!(cache.get(size).is_none());
  }

  #[test]
  fn sweeper_waits_for_first_access() {
    let cache = OverlayCache::new(HOUR, Duration::from_millis(10), Metrics::new());
    thread::sleep(Duration::from_millis(30));
    assert!(!cache.sweeper_started());
    assert_eq!(cache.len(), 0);
    assert!(!cache.sweeper_started());

    assert!(cache.get(OverlaySize::new(3, 3)).is_none());
    assert!(cache.sweeper_started());
  }

  #[test]
  fn set_also_starts_sweeper() {
    let cache = OverlayCache::new(HOUR, HOUR, Metrics::new());
    assert!(!cache.sweeper_started());
    let size = OverlaySize::new(2, 5);
    cache.set(size, bitmap(size));
    assert!(cache.sweeper_started());
  }

  #[test]
  fn concurrent_first_access_is_safe() {
    let cache = Arc::new(OverlayCache::new(HOUR, HOUR, Metrics::new()));
    let handles: Vec<_> = (0..16u32)
      .map(|i| {
        let cache = cache.clone();
        thread::spawn(move || {
          let size = OverlaySize::new(i + 1, 1);
          cache.set(size, bitmap(size));
          cache.get(size).is_some()
        })
      })
      .collect();

    for handle in handles {
      assert!(handle.join().unwrap());
    }
    assert_eq!(cache.len(), 16);
  }
}
