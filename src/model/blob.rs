// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/blob.rs - 肤色连通域检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::cell::RefCell;
use std::collections::HashMap;

use image::{GrayImage, Luma, RgbaImage};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectItem, DetectResult, Detector},
};

const MASK_ON: u8 = 255;
const MASK_OFF: u8 = 0;
const ALPHA_THRESHOLD: u8 = 128;

#[derive(Error, Debug)]
pub enum BlobDetectorError {
  #[error("参数文件加载错误: {0}")]
  ParamsLoadError(#[from] std::io::Error),
  #[error("参数文件解析错误: {0}")]
  ParamsParseError(#[from] serde_json::Error),
  #[error("参数无效: {0}")]
  ParamsInvalid(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

/// 检测参数，从外部 JSON 文件加载
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobParams {
  /// YCbCr 空间中 Cb 分量的闭区间
  pub cb: [u8; 2],
  /// YCbCr 空间中 Cr 分量的闭区间
  pub cr: [u8; 2],
  /// 连通域的最小像素数
  pub min_area: u32,
  /// 最多输出的区域数量，面积大者优先
  pub max_regions: usize,
}

impl Default for BlobParams {
  fn default() -> Self {
    Self {
      cb: [77, 127],
      cr: [133, 173],
      min_area: 64,
      max_regions: 32,
    }
  }
}

impl BlobParams {
  fn validate(&self) -> Result<(), BlobDetectorError> {
    if self.cb[0] > self.cb[1] || self.cr[0] > self.cr[1] {
      return Err(BlobDetectorError::ParamsInvalid(format!(
        "区间下界大于上界: cb={:?}, cr={:?}",
        self.cb, self.cr
      )));
    }
    if self.max_regions == 0 {
      return Err(BlobDetectorError::ParamsInvalid(
        "max_regions 必须大于 0".to_string(),
      ));
    }
    Ok(())
  }

  fn is_skin(&self, pixel: &[u8; 4]) -> bool {
    if pixel[3] < ALPHA_THRESHOLD {
      return false;
    }
    let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    let within = |v: f32, range: &[u8; 2]| v >= range[0] as f32 && v <= range[1] as f32;
    within(cb, &self.cb) && within(cr, &self.cr)
  }
}

/// 肤色连通域检测器
///
/// 内部复用一块掩码缓冲区，因此不是 `Sync` 的，同一实例不能被并发调用。
pub struct BlobDetector {
  params: BlobParams,
  mask: RefCell<GrayImage>,
}

pub struct BlobDetectorBuilder {
  params_path: Option<String>,
}

impl FromUrlWithScheme for BlobDetectorBuilder {
  const SCHEME: &'static str = "blob";
}

impl FromUrl for BlobDetectorBuilder {
  type Error = BlobDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(BlobDetectorError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let path = url.path();
    Ok(BlobDetectorBuilder {
      params_path: (!path.is_empty()).then(|| path.to_string()),
    })
  }
}

impl BlobDetectorBuilder {
  pub fn build(&self) -> Result<BlobDetector, BlobDetectorError> {
    let params = match &self.params_path {
      Some(path) => {
        info!("加载检测参数文件: {}", path);
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str::<BlobParams>(&text)?
      }
      None => {
        info!("使用内置检测参数");
        BlobParams::default()
      }
    };
    BlobDetector::new(params)
  }
}

impl BlobDetector {
  pub fn new(params: BlobParams) -> Result<Self, BlobDetectorError> {
    params.validate()?;
    debug!("检测参数: {:?}", params);
    Ok(Self {
      params,
      mask: RefCell::new(GrayImage::new(0, 0)),
    })
  }

  pub fn params(&self) -> &BlobParams {
    &self.params
  }
}

#[derive(Debug, Clone, Copy)]
struct Blob {
  min_x: u32,
  min_y: u32,
  max_x: u32,
  max_y: u32,
  area: u32,
}

impl Blob {
  fn at(x: u32, y: u32) -> Self {
    Blob {
      min_x: x,
      min_y: y,
      max_x: x,
      max_y: y,
      area: 0,
    }
  }

  fn grow(&mut self, x: u32, y: u32) {
    self.min_x = self.min_x.min(x);
    self.min_y = self.min_y.min(y);
    self.max_x = self.max_x.max(x);
    self.max_y = self.max_y.max(y);
    self.area += 1;
  }

  fn bbox_area(&self) -> u32 {
    (self.max_x - self.min_x + 1) * (self.max_y - self.min_y + 1)
  }
}

impl Detector for BlobDetector {
  type Error = BlobDetectorError;

  fn detect(&self, image: &RgbaImage) -> Result<DetectResult, Self::Error> {
    let (width, height) = image.dimensions();
    let mut mask = self.mask.borrow_mut();
    if mask.dimensions() != (width, height) {
      *mask = GrayImage::new(width, height);
    }

    for (x, y, pixel) in image.enumerate_pixels() {
      let on = if self.params.is_skin(&pixel.0) {
        MASK_ON
      } else {
        MASK_OFF
      };
      mask.put_pixel(x, y, Luma([on]));
    }

    let labels = connected_components(&*mask, Connectivity::Eight, Luma([MASK_OFF]));

    let mut blobs: HashMap<u32, Blob> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
      let label = label[0];
      if label == 0 {
        continue;
      }
      blobs.entry(label).or_insert_with(|| Blob::at(x, y)).grow(x, y);
    }

    let mut blobs: Vec<Blob> = blobs
      .into_values()
      .filter(|blob| blob.area >= self.params.min_area)
      .collect();
    blobs.sort_by(|a, b| b.area.cmp(&a.area));
    blobs.truncate(self.params.max_regions);

    let items: Vec<DetectItem> = blobs
      .iter()
      .map(|blob| DetectItem {
        score: blob.area as f32 / blob.bbox_area() as f32,
        bbox: [
          blob.min_x as f32,
          blob.min_y as f32,
          (blob.max_x + 1) as f32,
          (blob.max_y + 1) as f32,
        ],
      })
      .collect();

    debug!("检测到 {} 个区域", items.len());
    Ok(DetectResult {
      items: items.into_boxed_slice(),
    })
  }
}
