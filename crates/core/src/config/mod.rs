//! 配置模型与加载
//!
//! 配置来源依次为结构体默认值、TOML 文件和 `TASKQ_` 前缀的环境变量，
//! 每个配置段都提供 `validate()`。

pub mod models;

pub use models::*;
