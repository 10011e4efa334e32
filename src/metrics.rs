// 该文件是 Shanan （山南西风） 项目的一部分。
// src/metrics.rs - 计数器
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
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// 只写计数器，克隆后共享同一组原子量
#[derive(Clone, Default)]
pub struct Metrics {
  inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
  defaces: AtomicU64,
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  cache_items: AtomicI64,
  resize_computations: AtomicU64,
  coalesced_resizes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
  pub defaces: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_items: i64,
  pub resize_computations: u64,
  pub coalesced_resizes: u64,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn inc_defaces(&self) {
    self.inner.defaces.fetch_add(1, Ordering::Relaxed);
  }

  pub fn inc_cache_hits(&self) {
    self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn inc_cache_misses(&self) {
    self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn inc_cache_items(&self) {
    self.inner.cache_items.fetch_add(1, Ordering::Relaxed);
  }

  pub fn sub_cache_items(&self, n: usize) {
    self.inner.cache_items.fetch_sub(n as i64, Ordering::Relaxed);
  }

  pub fn inc_resize_computations(&self) {
    self
      .inner
      .resize_computations
      .fetch_add(1, Ordering::Relaxed);
  }

  pub fn add_coalesced_resizes(&self, n: u64) {
    self.inner.coalesced_resizes.fetch_add(n, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      defaces: self.inner.defaces.load(Ordering::Relaxed),
      cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
      cache_items: self.inner.cache_items.load(Ordering::Relaxed),
      resize_computations: self.inner.resize_computations.load(Ordering::Relaxed),
      coalesced_resizes: self.inner.coalesced_resizes.load(Ordering::Relaxed),
    }
  }
}

impl MetricsSnapshot {
  /// 缓存命中率，没有访问时为 0
  pub fn cache_hit_ratio(&self) -> f64 {
    let total = self.cache_hits + self.cache_misses;
    if total == 0 {
      0.0
    } else {
      self.cache_hits as f64 / total as f64
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_share_counters() {
    let metrics = Metrics::new();
    let other = metrics.clone();
    other.inc_cache_hits();
    other.inc_cache_items();
    other.inc_cache_items();
    metrics.sub_cache_items(1);
    metrics.inc_cache_misses();

    let snap = metrics.snapshot();
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.cache_items, 1);
    assert_eq!(snap.cache_hit_ratio(), 0.5);
  }
}
