//! 中继错误类型
//!
//! 处理约定：校验错误本地恢复并提示重试；下游不可用在发送前拒绝；
//! 存储错误向上传播，状态机回到 Idle。"未连接" 属于状态检查，不作为异常流程抛出。

use thiserror::Error;

/// 中继运行过程中可能出现的错误（校验、下游、存储、生命周期）
#[derive(Error, Debug)]
pub enum RelayError {
    /// 频道 ID 不符合 `<digits>@c.us` / `<digits>@g.us` 格式
    #[error("Invalid channel id: {0}")]
    InvalidChannelId(String),

    /// 频道 ID 在下游解析不到（机器人不在群内或 ID 写错）
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// 频道 ID 已被某个活跃目标占用
    #[error("Channel already registered: {0}")]
    DuplicateChannel(String),

    /// 发送速率低于下限
    #[error("Invalid send rate: {0}")]
    InvalidSendRate(String),

    /// 下游未连接，发送在进入网络前即被拒绝
    #[error("Downstream link not connected")]
    NotConnected,

    /// 下游传输层错误（连接、发送、登出）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 广播任务前置条件不满足（空目标列表、目标重复）
    #[error("Broadcast precondition failed: {0}")]
    BroadcastPrecondition(String),

    /// 注册表读写失败
    #[error("Registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    ConfigError(String),
}
