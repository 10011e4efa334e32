// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbaImage;

/// 检测引擎
///
/// 引擎不要求 `Send`/`Sync`：工作池在工作线程内部构建引擎，
/// 之后引擎一直留在该线程上，从不跨线程移动。
pub trait Detector {
  type Error;

  fn detect(&self, image: &RgbaImage) -> Result<DetectResult, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct DetectItem {
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// 转换为图像内的整数区域，丢弃面积为零的框
  pub fn regions(&self, width: u32, height: u32) -> Vec<Region> {
    self
      .items
      .iter()
      .map(|item| Region::from_bbox(&item.bbox, width, height))
      .filter(|region| !region.is_empty())
      .collect()
  }
}

/// 叠加图尺寸，同时是缓存键；按值比较
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlaySize {
  pub width: u32,
  pub height: u32,
}

impl OverlaySize {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

/// 检测到的矩形区域，`max_*` 不包含在区域内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
  pub min_x: u32,
  pub min_y: u32,
  pub max_x: u32,
  pub max_y: u32,
}

impl Region {
  pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
    Self {
      min_x,
      min_y,
      max_x: max_x.max(min_x),
      max_y: max_y.max(min_y),
    }
  }

  /// 最小坐标向下取整、最大坐标向上取整，保证叠加图完全覆盖检测区域，
  /// 然后裁剪到图像范围内
  pub fn from_bbox(bbox: &[f32; 4], width: u32, height: u32) -> Self {
    let (w, h) = (width as f32, height as f32);

    let x_min = bbox[0].floor().clamp(0.0, w) as u32;
    let y_min = bbox[1].floor().clamp(0.0, h) as u32;
    let x_max = bbox[2].ceil().clamp(0.0, w) as u32;
    let y_max = bbox[3].ceil().clamp(0.0, h) as u32;

    Region::new(x_min, y_min, x_max, y_max)
  }

  pub fn width(&self) -> u32 {
    self.max_x.saturating_sub(self.min_x)
  }

  pub fn height(&self) -> u32 {
    self.max_y.saturating_sub(self.min_y)
  }

  pub fn is_empty(&self) -> bool {
    self.width() == 0 || self.height() == 0
  }

  pub fn size(&self) -> OverlaySize {
    OverlaySize::new(self.width(), self.height())
  }

  pub fn contains(&self, x: u32, y: u32) -> bool {
    x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
  }
}

#[cfg(feature = "model_blob")]
mod blob;
#[cfg(feature = "model_blob")]
pub use self::blob::{BlobDetector, BlobDetectorBuilder, BlobDetectorError, BlobParams};
