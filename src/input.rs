// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 图像输入
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

use image::{Rgba, RgbaImage};
use thiserror::Error;

use crate::FromUrl;

const DEFAULT_OVERLAY_SIDE: u32 = 256;
const DEFAULT_OVERLAY_COLOR: [u8; 3] = [24, 24, 24];
const DEFAULT_OVERLAY_ALPHA: u8 = 230;

/// 解码图像字节，格式自动识别
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
  Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// 一帧待处理的输入
#[derive(Debug, Clone)]
pub struct InputFrame {
  pub name: String,
  pub bytes: Vec<u8>,
}

/// 内置叠加图：深色半透明椭圆，椭圆外完全透明
pub fn default_overlay() -> RgbaImage {
  let side = DEFAULT_OVERLAY_SIDE;
  let center = side as f32 / 2.0;
  RgbaImage::from_fn(side, side, |x, y| {
    let dx = (x as f32 + 0.5 - center) / center;
    let dy = (y as f32 + 0.5 - center) / center;
    if dx * dx + dy * dy <= 1.0 {
      let [r, g, b] = DEFAULT_OVERLAY_COLOR;
      Rgba([r, g, b, DEFAULT_OVERLAY_ALPHA])
    } else {
      Rgba([0, 0, 0, 0])
    }
  })
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{DirectoryInput, ImageFileInput, ImageFileInputError, load_overlay};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_image_file")]
  ReadDirectory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
      if url.scheme() == DirectoryInput::SCHEME {
        let input = DirectoryInput::from_url(url)?;
        return Ok(InputWrapper::ReadDirectory(input));
      }
    }
    let _ = url;
    Err(InputError::SchemeMismatch)
  }
}

impl Iterator for InputWrapper {
  type Item = InputFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadDirectory(input) => input.next(),
      #[allow(unreachable_patterns)]
      _ => None,
    }
  }
}
