// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 检测工作池
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

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded};
use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{
  error::{DefaceError, EnginePanic, Result},
  input::decode_image,
  metrics::Metrics,
  model::{Detector, Region},
};

/// 解码后的源图及其检测区域
#[derive(Debug, Clone)]
pub struct Detected {
  pub image: RgbaImage,
  pub regions: Vec<Region>,
}

/// 由图像字节得到源图与区域的检测步骤
pub trait RegionSource: Send + Sync {
  fn scan(&self, bytes: Vec<u8>) -> Result<Detected>;
}

fn decode_and_detect<D>(detector: &D, bytes: &[u8]) -> Result<Detected>
where
  D: Detector,
  D::Error: std::error::Error + Send + Sync + 'static,
{
  let image = decode_image(bytes)?;
  let result = detector.detect(&image).map_err(DefaceError::detection)?;
  let regions = result.regions(image.width(), image.height());
  Ok(Detected { image, regions })
}

/// 单个检测引擎，调用时独占
pub struct LockedDetector<D> {
  detector: Mutex<D>,
}

impl<D> LockedDetector<D> {
  pub fn new(detector: D) -> Self {
    Self {
      detector: Mutex::new(detector),
    }
  }
}

impl<D> RegionSource for LockedDetector<D>
where
  D: Detector + Send,
  D::Error: std::error::Error + Send + Sync + 'static,
{
  fn scan(&self, bytes: Vec<u8>) -> Result<Detected> {
    let image = decode_image(&bytes)?;
    let result = {
      let detector = self.detector.lock();
      catch_unwind(AssertUnwindSafe(|| detector.detect(&image)))
        .map_err(|payload| DefaceError::detection(EnginePanic::from_payload(payload)))?
        .map_err(DefaceError::detection)?
    };
    let regions = result.regions(image.width(), image.height());
    Ok(Detected { image, regions })
  }
}

struct DetectionJob {
  bytes: Vec<u8>,
  reply: Sender<Result<Detected>>,
}

/// 检测工作池
///
/// 每个工作线程在自己的线程里构建并独占一个检测引擎，引擎从不离开该线程。
/// 请求队列容量等于线程数，队列满时 `submit` 阻塞调用方。
pub struct DetectorPool {
  inbox: Option<Sender<DetectionJob>>,
  workers: Vec<JoinHandle<()>>,
}

impl DetectorPool {
  /// 构建全部工作线程；任一引擎初始化失败则整体失败，且不留下任何线程
  pub fn new<F, D, E>(worker_count: usize, factory: F, metrics: Metrics) -> Result<Self>
  where
    F: Fn(usize) -> std::result::Result<D, E> + Send + Sync + 'static,
    D: Detector + 'static,
    D::Error: std::error::Error + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
  {
    if worker_count == 0 {
      return Err(DefaceError::InvalidConfig(
        "工作线程数量必须大于 0".to_string(),
      ));
    }

    info!("创建检测工作池: {} 个工作线程", worker_count);
    let (inbox, jobs) = bounded::<DetectionJob>(worker_count);
    let (ready, readiness) = bounded::<Result<()>>(worker_count);
    let factory = Arc::new(factory);

    let mut pool = DetectorPool {
      inbox: Some(inbox),
      workers: Vec::with_capacity(worker_count),
    };

    for index in 0..worker_count {
      let jobs = jobs.clone();
      let ready = ready.clone();
      let factory = factory.clone();
      let metrics = metrics.clone();
      let spawned = thread::Builder::new()
        .name(format!("detector-{}", index))
        .spawn(move || run_worker(index, factory.as_ref(), jobs, ready, metrics));
      match spawned {
        Ok(handle) => pool.workers.push(handle),
        Err(e) => {
          error!("无法启动工作线程 {}: {}", index, e);
          // pool 在此处被丢弃，已启动的线程随之退出并被回收
          return Err(e.into());
        }
      }
    }
    drop(jobs);
    drop(ready);

    let mut started = 0;
    let mut failure = None;
    while let Ok(report) = readiness.recv() {
      match report {
        Ok(()) => started += 1,
        Err(e) => {
          failure.get_or_insert(e);
        }
      }
    }

    if let Some(e) = failure {
      error!("检测工作池构建失败: {}", e);
      return Err(e);
    }
    if started != worker_count {
      error!("仅 {}/{} 个工作线程完成初始化", started, worker_count);
      return Err(DefaceError::InvalidConfig(format!(
        "仅 {}/{} 个工作线程完成初始化",
        started, worker_count
      )));
    }

    info!("检测工作池就绪");
    Ok(pool)
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }

  /// 解码并检测一张图像；队列满时阻塞，直到某个工作线程空出
  pub fn submit(&self, bytes: Vec<u8>) -> Result<Detected> {
    let inbox = self.inbox.as_ref().ok_or(DefaceError::PoolClosed)?;
    let (reply, response) = bounded(1);
    inbox
      .send(DetectionJob { bytes, reply })
      .map_err(|_| DefaceError::PoolClosed)?;
    response.recv().map_err(|_| DefaceError::PoolClosed)?
  }
}

impl RegionSource for DetectorPool {
  fn scan(&self, bytes: Vec<u8>) -> Result<Detected> {
    self.submit(bytes)
  }
}

impl Drop for DetectorPool {
  fn drop(&mut self) {
    self.inbox.take();
    for worker in self.workers.drain(..) {
      if worker.join().is_err() {
        error!("工作线程异常退出");
      }
    }
    debug!("检测工作池已关闭");
  }
}

fn run_worker<F, D, E>(
  index: usize,
  factory: &F,
  jobs: Receiver<DetectionJob>,
  ready: Sender<Result<()>>,
  metrics: Metrics,
) where
  F: Fn(usize) -> std::result::Result<D, E>,
  D: Detector,
  D::Error: std::error::Error + Send + Sync + 'static,
  E: std::error::Error + Send + Sync + 'static,
{
  let built = catch_unwind(AssertUnwindSafe(|| factory(index)))
    .map_err(|payload| DefaceError::engine_init(index, EnginePanic::from_payload(payload)))
    .and_then(|built| built.map_err(|e| DefaceError::engine_init(index, e)));
  let detector = match built {
    Ok(detector) => {
      let _ = ready.send(Ok(()));
      detector
    }
    Err(e) => {
      error!("工作线程 {} 检测引擎初始化失败: {}", index, e);
      let _ = ready.send(Err(e));
      return;
    }
  };
  drop(ready);
  debug!("工作线程 {} 就绪", index);

  for job in jobs.iter() {
    // 引擎 panic 只影响当前请求，工作线程继续服务
    let result = catch_unwind(AssertUnwindSafe(|| decode_and_detect(&detector, &job.bytes)))
      .unwrap_or_else(|payload| {
        error!("工作线程 {} 检测引擎 panic", index);
        Err(DefaceError::detection(EnginePanic::from_payload(payload)))
      });
    if let Err(e) = &result {
      debug!("工作线程 {} 请求失败: {}", index, e);
    }
    metrics.inc_defaces();
    // 调用方可能已经超时放弃
    let _ = job.reply.send(result);
  }

  debug!("工作线程 {} 退出", index);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{DetectItem, DetectResult};
  use crate::output::encode_png;
  use image::Rgba;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread::ThreadId;
  use std::time::Duration;

  #[derive(Debug, thiserror::Error)]
  enum StubError {
    #[error("引擎加载失败")]
    Load,
    #[error("引擎被跨线程调用")]
    WrongThread,
    #[error("无法处理宽度 {0}")]
    BadWidth(u32),
  }

  /// 记录构建线程，在其它线程上被调用时报错
  struct PinnedStub {
    home: ThreadId,
    live: Arc<AtomicUsize>,
  }

  impl PinnedStub {
    fn new(live: Arc<AtomicUsize>) -> Self {
      live.fetch_add(1, Ordering::SeqCst);
      Self {
        home: thread::current().id(),
        live,
      }
    }
  }

  impl Drop for PinnedStub {
    fn drop(&mut self) {
      self.live.fetch_sub(1, Ordering::SeqCst);
    }
  }

  impl Detector for PinnedStub {
    type Error = StubError;

    fn detect(&self, image: &RgbaImage) -> std::result::Result<DetectResult, StubError> {
      if thread::current().id() != self.home {
        return Err(StubError::WrongThread);
      }
      if image.width() == 13 {
        return Err(StubError::BadWidth(13));
      }
      let items = if image.width() >= 8 {
        vec![DetectItem {
          score: 1.0,
          bbox: [1.2, 1.0, 4.5, 3.0],
        }]
      } else {
        Vec::new()
      };
      Ok(DetectResult {
        items: items.into_boxed_slice(),
      })
    }
  }

  fn png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&RgbaImage::from_pixel(width, height, Rgba([9, 9, 9, 255]))).unwrap()
  }

  fn pinned_pool(workers: usize) -> (DetectorPool, Arc<AtomicUsize>) {
    let live = Arc::new(AtomicUsize::new(0));
    let counter = live.clone();
    let pool = DetectorPool::new(
      workers,
      move |_| Ok::<_, StubError>(PinnedStub::new(counter.clone())),
      Metrics::new(),
    )
    .unwrap();
    (pool, live)
  }

  #[test]
  fn submit_decodes_and_detects() {
    let (pool, _) = pinned_pool(2);
    let detected = pool.submit(png(16, 8)).unwrap();
    assert_eq!(detected.image.dimensions(), (16, 8));
    assert_eq!(detected.regions, vec![Region::new(1, 1, 5, 3)]);
  }

  #[test]
  fn empty_detection_is_success() {
    let (pool, _) = pinned_pool(1);
    let detected = pool.submit(png(4, 4)).unwrap();
    assert!(detected.regions.is_empty());
  }

  #[test]
  fn garbage_bytes_are_decode_errors() {
    let (pool, _) = pinned_pool(1);
    let err = pool.submit(b"not an image".to_vec()).unwrap_err();
    assert!(matches!(err, DefaceError::Decode(_)));
  }

  #[test]
  fn detection_fault_is_isolated_to_its_request() {
    let (pool, _) = pinned_pool(1);
    assert!(matches!(
      pool.submit(png(13, 13)),
      Err(DefaceError::DetectionFault(_))
    ));
    assert!(pool.submit(png(16, 16)).is_ok());
  }

  /// 宽度为 13 的图像让引擎 panic
  struct PanickyStub;

  impl Detector for PanickyStub {
    type Error = StubError;

    fn detect(&self, image: &RgbaImage) -> std::result::Result<DetectResult, StubError> {
      if image.width() == 13 {
        panic!("引擎内部状态损坏");
      }
      Ok(DetectResult::default())
    }
  }

  #[test]
  fn engine_panic_is_isolated_to_its_request() {
    let pool = DetectorPool::new(1, |_| Ok::<_, StubError>(PanickyStub), Metrics::new()).unwrap();

    match pool.submit(png(13, 13)) {
      Err(DefaceError::DetectionFault(e)) => assert!(e.to_string().contains("引擎内部状态损坏")),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("panicking engine should fail the request"),
    }
    for _ in 0..3 {
      assert!(pool.submit(png(16, 16)).is_ok());
    }
  }

  #[test]
  fn locked_detector_survives_engine_panic() {
    let detector = LockedDetector::new(PanickyStub);
    assert!(matches!(
      detector.scan(png(13, 13)),
      Err(DefaceError::DetectionFault(_))
    ));
    assert!(detector.scan(png(16, 16)).is_ok());
  }

  #[test]
  fn engine_factory_panic_is_an_init_fault() {
    let live = Arc::new(AtomicUsize::new(0));
    let counter = live.clone();
    let result = DetectorPool::new(
      3,
      move |index| {
        if index == 1 {
          panic!("参数文件损坏");
        }
        Ok::<_, StubError>(PinnedStub::new(counter.clone()))
      },
      Metrics::new(),
    );

    match result {
      Err(DefaceError::EngineInitFault { worker, .. }) => assert_eq!(worker, 1),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("pool construction should fail"),
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn engines_stay_on_their_worker_thread() {
    let (pool, live) = pinned_pool(4);
    assert_eq!(live.load(Ordering::SeqCst), 4);
    let pool = Arc::new(pool);

    let handles: Vec<_> = (0..32)
      .map(|_| {
        let pool = pool.clone();
        thread::spawn(move || pool.submit(png(16, 16)))
      })
      .collect();
    for handle in handles {
      assert!(handle.join().unwrap().is_ok());
    }

    drop(pool);
    assert_eq!(live.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn failed_engine_init_leaves_no_workers() {
    let live = Arc::new(AtomicUsize::new(0));
    let counter = live.clone();
    let result = DetectorPool::new(
      4,
      move |index| {
        if index == 2 {
          Err(StubError::Load)
        } else {
          Ok(PinnedStub::new(counter.clone()))
        }
      },
      Metrics::new(),
    );

    match result {
      Err(DefaceError::EngineInitFault { worker, .. }) => assert_eq!(worker, 2),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("pool construction should fail"),
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn zero_workers_is_rejected() {
    let result = DetectorPool::new(
      0,
      |_| Ok::<_, StubError>(PinnedStub::new(Arc::new(AtomicUsize::new(0)))),
      Metrics::new(),
    );
    assert!(matches!(result, Err(DefaceError::InvalidConfig(_))));
  }

  struct GatedStub {
    gate: Receiver<()>,
  }

  impl Detector for GatedStub {
    type Error = StubError;

    fn detect(&self, _image: &RgbaImage) -> std::result::Result<DetectResult, StubError> {
      let _ = self.gate.recv();
      Ok(DetectResult::default())
    }
  }

  #[test]
  fn overload_blocks_instead_of_failing() {
    let (open, gate) = bounded::<()>(0);
    let pool = Arc::new(
      DetectorPool::new(
        1,
        move |_| {
          Ok::<_, StubError>(GatedStub {
            gate: gate.clone(),
          })
        },
        Metrics::new(),
      )
      .unwrap(),
    );

    let finished = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..3)
      .map(|_| {
        let pool = pool.clone();
        let finished = finished.clone();
        thread::spawn(move || {
          let result = pool.submit(png(4, 4));
          finished.fetch_add(1, Ordering::SeqCst);
          result
        })
      })
      .collect();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    for _ in 0..3 {
      open.send(()).unwrap();
    }
    for handle in handles {
      assert!(handle.join().unwrap().is_ok());
    }
    assert_eq!(finished.load(Ordering::SeqCst), 3);
  }
}
