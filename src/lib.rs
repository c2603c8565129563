//! Ridecast - Telegram → WhatsApp 群发中继
//!
//! 模块划分：
//! - **adapter**: 控制端出入站适配（Webhook 入站事件 + 回复推送）
//! - **bot**: 会话状态机与有界会话表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **dispatch**: 群发调度器（错峰扇出、计数器判完成）
//! - **probe**: 只读运行状态探针（/health、/status）
//! - **registry**: 操作员 / 群目标注册表（SQLite）
//! - **supervisor**: 下游连接监管（状态机、有界重连）
//! - **transport**: 下游传输契约与回环实现

pub mod adapter;
pub mod bot;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod probe;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use error::RelayError;
