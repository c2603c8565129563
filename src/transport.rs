//! 下游传输层抽象
//!
//! 真实的下游客户端（WhatsApp Web 等）在仓库之外，这里只定义监管器依赖的
//! 最小契约：连接 / 发送 / 解析频道 / 登出，以及一条类型化的生命周期事件流。
//! 事件通过构造时注入的 mpsc 发送端上报，由监管器的单一分发循环消费。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// 频道元数据（resolve_channel 的返回）
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// 下游生命周期事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// 配对凭证已签发（扫码/配对码），尚未确认
    Challenge(String),
    /// 连接就绪，可以收发
    Ready,
    /// 鉴权通过
    Authenticated,
    /// 鉴权失败，不自动重试
    AuthFailure(String),
    /// 连接断开，附带原因
    Disconnected(String),
    /// 收到下游消息
    MessageReceived { from: String, text: String },
}

/// 下游传输契约
///
/// 连接资源由实现方持有；`release` 必须在任何路径上都能安全调用，
/// 即使当前并未连接。
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// 发起一次新的连接尝试（就绪与否通过事件上报）
    async fn connect(&self) -> Result<(), RelayError>;

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), RelayError>;

    /// 在线解析频道；找不到返回 Ok(None)
    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, RelayError>;

    /// 清空频道内的历史消息
    async fn clear_chat(&self, channel_id: &str) -> Result<(), RelayError>;

    async fn logout(&self) -> Result<(), RelayError>;

    /// 释放底层连接资源
    async fn release(&self) -> Result<(), RelayError>;
}

/// 校验频道 ID 格式：`<digits>@c.us`（私聊）或 `<digits>@g.us`（群）
pub fn is_valid_channel_id(channel_id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+@(c|g)\.us$").unwrap())
        .is_match(channel_id)
}

/// 回环传输：本地运行 / 联调用，所有发送仅写日志并立即成功
pub struct LoopbackTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ChannelTransport for LoopbackTransport {
    async fn connect(&self) -> Result<(), RelayError> {
        let _ = self.events.send(TransportEvent::Ready);
        Ok(())
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), RelayError> {
        tracing::info!(channel_id, len = text.len(), "loopback send");
        Ok(())
    }

    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, RelayError> {
        if !is_valid_channel_id(channel_id) {
            return Ok(None);
        }
        Ok(Some(ChannelInfo {
            id: channel_id.to_string(),
            name: format!("loopback:{}", channel_id),
        }))
    }

    async fn clear_chat(&self, channel_id: &str) -> Result<(), RelayError> {
        tracing::info!(channel_id, "loopback clear chat");
        Ok(())
    }

    async fn logout(&self) -> Result<(), RelayError> {
        let _ = self
            .events
            .send(TransportEvent::Disconnected("logout".into()));
        Ok(())
    }

    async fn release(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用假传输：可注入每个频道的发送延迟与失败，并记录发送顺序

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct FakeTransport {
        /// 发送前模拟的网络延迟
        pub latency: Mutex<HashMap<String, Duration>>,
        /// 发送必定失败的频道
        pub failing: Mutex<HashSet<String>>,
        /// 解析不到的频道
        pub unresolvable: Mutex<HashSet<String>>,
        /// 实际完成的发送（按完成顺序）
        pub sent: Mutex<Vec<(String, String)>>,
        /// connect 被调用的次数
        pub connect_calls: Mutex<u32>,
        /// release 被调用的次数
        pub release_calls: Mutex<u32>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_latency(&self, channel_id: &str, latency: Duration) {
            self.latency
                .lock()
                .unwrap()
                .insert(channel_id.to_string(), latency);
        }

        pub fn fail_channel(&self, channel_id: &str) {
            self.failing.lock().unwrap().insert(channel_id.to_string());
        }

        pub fn mark_unresolvable(&self, channel_id: &str) {
            self.unresolvable
                .lock()
                .unwrap()
                .insert(channel_id.to_string());
        }

        pub fn sent_channels(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(c, _)| c.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelTransport for FakeTransport {
        async fn connect(&self) -> Result<(), RelayError> {
            *self.connect_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn send(&self, channel_id: &str, text: &str) -> Result<(), RelayError> {
            let latency = self.latency.lock().unwrap().get(channel_id).copied();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if self.failing.lock().unwrap().contains(channel_id) {
                return Err(RelayError::Transport(format!("send to {} failed", channel_id)));
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn resolve_channel(
            &self,
            channel_id: &str,
        ) -> Result<Option<ChannelInfo>, RelayError> {
            if !is_valid_channel_id(channel_id)
                || self.unresolvable.lock().unwrap().contains(channel_id)
            {
                return Ok(None);
            }
            Ok(Some(ChannelInfo {
                id: channel_id.to_string(),
                name: format!("group {}", channel_id),
            }))
        }

        async fn clear_chat(&self, _channel_id: &str) -> Result<(), RelayError> {
            Ok(())
        }

        async fn logout(&self) -> Result<(), RelayError> {
            Ok(())
        }

        async fn release(&self) -> Result<(), RelayError> {
            *self.release_calls.lock().unwrap() += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_format() {
        assert!(is_valid_channel_id("120363025246125708@g.us"));
        assert!(is_valid_channel_id("972501234567@c.us"));
        assert!(!is_valid_channel_id("abc"));
        assert!(!is_valid_channel_id("12345@x.us"));
        assert!(!is_valid_channel_id("12345@g.us "));
        assert!(!is_valid_channel_id("@g.us"));
    }
}
