// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 遮面服务可调参数
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

use std::time::Duration;

pub const DEFAULT_WORKER_COUNT: usize = 100;
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const COALESCE_MIN_BACKOFF: Duration = Duration::from_millis(10);
pub const COALESCE_MAX_BACKOFF: Duration = Duration::from_secs(1);
pub const COALESCE_MAX_DELAY: Duration = Duration::from_millis(100);

/// 遮面服务配置
#[derive(Debug, Clone)]
pub struct DefaceConfig {
  /// 检测工作线程数量，同时也是请求队列容量
  pub worker_count: usize,
  /// 缓存条目在无访问情况下的最长存活时间
  pub cache_ttl: Duration,
  /// 缓存清扫周期
  pub cache_sweep_interval: Duration,
  /// 合并调度的最小空闲等待
  pub coalesce_min_backoff: Duration,
  /// 空闲等待按倍数增长的上限
  pub coalesce_max_backoff: Duration,
  /// 批次中最早的请求最多等待多久就必须派发
  pub coalesce_max_delay: Duration,
}

impl Default for DefaceConfig {
  fn default() -> Self {
    Self {
      worker_count: DEFAULT_WORKER_COUNT,
      cache_ttl: CACHE_TTL,
      cache_sweep_interval: CACHE_SWEEP_INTERVAL,
      coalesce_min_backoff: COALESCE_MIN_BACKOFF,
      coalesce_max_backoff: COALESCE_MAX_BACKOFF,
      coalesce_max_delay: COALESCE_MAX_DELAY,
    }
  }
}

impl DefaceConfig {
  pub fn with_worker_count(mut self, worker_count: usize) -> Self {
    self.worker_count = worker_count;
    self
  }

  pub fn with_cache_policy(mut self, ttl: Duration, sweep_interval: Duration) -> Self {
    self.cache_ttl = ttl;
    self.cache_sweep_interval = sweep_interval;
    self
  }

  pub fn with_coalesce_backoff(mut self, min: Duration, max: Duration) -> Self {
    self.coalesce_min_backoff = min;
    self.coalesce_max_backoff = max.max(min);
    self
  }

  pub fn with_coalesce_max_delay(mut self, max_delay: Duration) -> Self {
    self.coalesce_max_delay = max_delay;
    self
  }
}
