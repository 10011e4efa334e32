// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 遮面服务错误定义
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

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DefaceError {
  /// 输入字节无法解析为图像，换一张图之前重试没有意义
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
  /// 单次请求中检测引擎本身出错，不影响其它请求与工作线程
  #[error("检测引擎错误: {0}")]
  DetectionFault(BoxError),
  /// 构建工作池时某个检测引擎初始化失败，整个池构建失败
  #[error("检测引擎初始化错误 (工作线程 {worker}): {source}")]
  EngineInitFault { worker: usize, source: BoxError },
  #[error("检测工作池已关闭")]
  PoolClosed,
  #[error("配置无效: {0}")]
  InvalidConfig(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

impl DefaceError {
  pub fn detection<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
    DefaceError::DetectionFault(Box::new(e))
  }

  pub fn engine_init<E: std::error::Error + Send + Sync + 'static>(worker: usize, e: E) -> Self {
    DefaceError::EngineInitFault {
      worker,
      source: Box::new(e),
    }
  }
}

/// 检测引擎在调用中 panic，panic 信息转为普通错误
#[derive(Error, Debug)]
#[error("检测引擎 panic: {0}")]
pub struct EnginePanic(pub String);

impl EnginePanic {
  pub fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = match payload.downcast::<String>() {
      Ok(message) => *message,
      Err(payload) => payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .unwrap_or_else(|| "未知 panic".to_string()),
    };
    EnginePanic(message)
  }
}

pub type Result<T> = std::result::Result<T, DefaceError>;
