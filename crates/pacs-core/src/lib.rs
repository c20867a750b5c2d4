//! # PACS Core
//!
//! 影像缓存同步系统的核心模块，提供远端资源模型、变更事件、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{PacsError, Result};
pub use models::*;
