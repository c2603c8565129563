//! 连接监管器
//!
//! 进程内唯一共享的下游连接由这里负责生命周期管理：其它组件只通过
//! `send` / `resolve_channel` / `clear_chat` 只读地使用连接，任何重建、
//! 登出、释放都必须经过监管器。
//!
//! 下游生命周期通知进入一个类型化事件通道，由单一分发循环消费并翻译成
//! 显式状态迁移；意外断线按固定延迟调度重连，次数有界，超限后只能由
//! 操作员显式 `connect()` 重新开始。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::config::LinkSection;
use crate::error::RelayError;
use crate::transport::{ChannelInfo, ChannelTransport, TransportEvent};

/// 监管器状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// 初始 / 显式断开
    Disconnected,
    /// 配对凭证已签发，等待确认
    AwaitingChallenge,
    Connected,
    /// 鉴权失败，需手动重新初始化
    AuthFailed,
    /// 意外断线后等待定时重连
    Reconnecting,
}

/// 对订阅者重新发布的链路事件
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Challenge(String),
    Ready,
    Authenticated,
    AuthFailure(String),
    Disconnected(String),
    /// 自动重连次数用尽，需要操作员显式重连
    RetriesExhausted,
    MessageReceived { from: String, text: String },
}

/// 状态快照（只读探针用）
#[derive(Debug, Clone, serde::Serialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub pending_challenge: Option<String>,
}

struct LinkShared {
    state: LinkState,
    last_activity: Option<DateTime<Utc>>,
    pending_challenge: Option<String>,
    reconnect_attempts: u32,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn ChannelTransport>,
    shared: RwLock<LinkShared>,
    events: broadcast::Sender<LinkEvent>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl ConnectionSupervisor {
    /// 创建监管器并启动事件分发循环
    ///
    /// `event_rx` 是传输层上报事件的接收端；传输层持有对应的发送端。
    pub fn spawn(
        transport: Arc<dyn ChannelTransport>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
        link: &LinkSection,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let supervisor = Arc::new(Self {
            transport,
            shared: RwLock::new(LinkShared {
                state: LinkState::Disconnected,
                last_activity: None,
                pending_challenge: None,
                reconnect_attempts: 0,
            }),
            events: events_tx,
            reconnect_delay: Duration::from_secs(link.reconnect_delay_secs),
            max_reconnect_attempts: link.max_reconnect_attempts,
        });

        let dispatch = Arc::clone(&supervisor);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                dispatch.handle_event(event).await;
            }
        });

        supervisor
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Challenge(challenge) => {
                tracing::info!("downstream challenge issued");
                let mut shared = self.shared.write().await;
                shared.state = LinkState::AwaitingChallenge;
                shared.pending_challenge = Some(challenge.clone());
                drop(shared);
                let _ = self.events.send(LinkEvent::Challenge(challenge));
            }
            TransportEvent::Ready => {
                tracing::info!("downstream link ready");
                let mut shared = self.shared.write().await;
                shared.state = LinkState::Connected;
                shared.pending_challenge = None;
                shared.reconnect_attempts = 0;
                shared.last_activity = Some(Utc::now());
                drop(shared);
                let _ = self.events.send(LinkEvent::Ready);
            }
            TransportEvent::Authenticated => {
                let mut shared = self.shared.write().await;
                shared.last_activity = Some(Utc::now());
                drop(shared);
                let _ = self.events.send(LinkEvent::Authenticated);
            }
            TransportEvent::AuthFailure(reason) => {
                tracing::error!(%reason, "downstream authentication failed");
                let mut shared = self.shared.write().await;
                shared.state = LinkState::AuthFailed;
                shared.pending_challenge = None;
                drop(shared);
                let _ = self.events.send(LinkEvent::AuthFailure(reason));
            }
            TransportEvent::Disconnected(reason) => {
                tracing::warn!(%reason, "downstream link disconnected");
                let unexpected = {
                    let shared = self.shared.read().await;
                    matches!(shared.state, LinkState::Connected | LinkState::Reconnecting)
                };
                let _ = self.events.send(LinkEvent::Disconnected(reason));
                if unexpected {
                    self.schedule_reconnect().await;
                } else {
                    // 显式登出 / 销毁路径，状态已由调用方落定
                    let mut shared = self.shared.write().await;
                    shared.pending_challenge = None;
                }
            }
            TransportEvent::MessageReceived { from, text } => {
                let mut shared = self.shared.write().await;
                shared.last_activity = Some(Utc::now());
                drop(shared);
                let _ = self.events.send(LinkEvent::MessageReceived { from, text });
            }
        }
    }

    /// 意外断线：有界地调度一次定时重连
    fn schedule_reconnect<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let attempt = {
                let mut shared = self.shared.write().await;
                if shared.reconnect_attempts >= self.max_reconnect_attempts {
                    shared.state = LinkState::Disconnected;
                    None
                } else {
                    shared.reconnect_attempts += 1;
                    shared.state = LinkState::Reconnecting;
                    Some(shared.reconnect_attempts)
                }
            };

            let Some(attempt) = attempt else {
                tracing::error!(
                    max = self.max_reconnect_attempts,
                    "reconnect attempts exhausted, manual connect required"
                );
                let _ = self.events.send(LinkEvent::RetriesExhausted);
                return;
            };

            tracing::info!(attempt, max = self.max_reconnect_attempts, "scheduling reconnect");
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(supervisor.reconnect_delay).await;

                // 等待期间操作员可能已登出或重连成功
                if supervisor.shared.read().await.state != LinkState::Reconnecting {
                    return;
                }

                // 先释放旧资源再发起新连接
                if let Err(e) = supervisor.transport.release().await {
                    tracing::warn!(error = %e, "failed to release stale connection");
                }
                if let Err(e) = supervisor.transport.connect().await {
                    tracing::error!(attempt, error = %e, "reconnect attempt failed");
                    supervisor.schedule_reconnect().await;
                }
            });
        })
    }

    /// 操作员显式发起连接；清除 AuthFailed / 次数用尽的终止态
    pub async fn connect(&self) -> Result<(), RelayError> {
        {
            let mut shared = self.shared.write().await;
            shared.state = LinkState::Disconnected;
            shared.pending_challenge = None;
            shared.reconnect_attempts = 0;
        }
        self.transport.connect().await
    }

    /// 登出并释放连接资源；任何路径都必须释放
    pub async fn logout(&self) -> Result<(), RelayError> {
        {
            let mut shared = self.shared.write().await;
            shared.state = LinkState::Disconnected;
            shared.pending_challenge = None;
        }
        let logout_result = self.transport.logout().await;
        let release_result = self.transport.release().await;
        logout_result.and(release_result)
    }

    /// 强制销毁连接（不登出），资源照常释放
    pub async fn destroy(&self) -> Result<(), RelayError> {
        {
            let mut shared = self.shared.write().await;
            shared.state = LinkState::Disconnected;
            shared.pending_challenge = None;
        }
        self.transport.release().await
    }

    /// 连接未就绪时直接拒绝，不产生任何网络动作
    pub async fn send(&self, channel_id: &str, text: &str) -> Result<(), RelayError> {
        if !self.is_connected().await {
            return Err(RelayError::NotConnected);
        }
        self.transport.send(channel_id, text).await?;
        self.shared.write().await.last_activity = Some(Utc::now());
        Ok(())
    }

    pub async fn resolve_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelInfo>, RelayError> {
        if !self.is_connected().await {
            return Err(RelayError::NotConnected);
        }
        self.transport.resolve_channel(channel_id).await
    }

    pub async fn clear_chat(&self, channel_id: &str) -> Result<(), RelayError> {
        if !self.is_connected().await {
            return Err(RelayError::NotConnected);
        }
        self.transport.clear_chat(channel_id).await
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.read().await.state == LinkState::Connected
    }

    pub async fn state(&self) -> LinkState {
        self.shared.read().await.state
    }

    pub async fn status(&self) -> LinkStatus {
        let shared = self.shared.read().await;
        LinkStatus {
            connected: shared.state == LinkState::Connected,
            last_activity: shared.last_activity,
            pending_challenge: shared.pending_challenge.clone(),
        }
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.read().await.reconnect_attempts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::FakeTransport;

    fn link_section(delay_secs: u64, max_attempts: u32) -> LinkSection {
        LinkSection {
            reconnect_delay_secs: delay_secs,
            max_reconnect_attempts: max_attempts,
        }
    }

    async fn settle() {
        // 越过重连延迟，让分发循环与定时任务在虚拟时钟下跑完
        tokio::time::sleep(Duration::from_secs(31)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejected_before_network_when_not_connected() {
        let transport = Arc::new(FakeTransport::new());
        let (_tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport.clone(), rx, &link_section(30, 5));

        let err = sup.send("123@g.us", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
        assert!(transport.sent_channels().is_empty());
        assert_eq!(sup.reconnect_attempts().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_event_connects_and_stamps_activity() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport.clone(), rx, &link_section(30, 5));

        tx.send(TransportEvent::Challenge("pair-me".into())).unwrap();
        settle().await;
        let status = sup.status().await;
        assert!(!status.connected);
        assert_eq!(status.pending_challenge.as_deref(), Some("pair-me"));

        tx.send(TransportEvent::Ready).unwrap();
        settle().await;
        let status = sup.status().await;
        assert!(status.connected);
        assert!(status.last_activity.is_some());
        assert!(status.pending_challenge.is_none());

        sup.send("123@g.us", "hi").await.unwrap();
        assert_eq!(transport.sent_channels(), vec!["123@g.us".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_disconnect_schedules_bounded_reconnects() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport.clone(), rx, &link_section(30, 5));
        let mut events = sup.subscribe();

        tx.send(TransportEvent::Ready).unwrap();
        settle().await;

        // 连接从未恢复：每次断线消耗一次重连额度
        for _ in 0..5 {
            tx.send(TransportEvent::Disconnected("lost".into())).unwrap();
            settle().await;
        }
        assert_eq!(*transport.connect_calls.lock().unwrap(), 5);
        assert_eq!(sup.reconnect_attempts().await, 5);

        // 第 6 次断线不再调度新的尝试
        tx.send(TransportEvent::Disconnected("lost".into())).unwrap();
        settle().await;
        assert_eq!(*transport.connect_calls.lock().unwrap(), 5);
        assert_eq!(sup.state().await, LinkState::Disconnected);

        let mut exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LinkEvent::RetriesExhausted) {
                exhausted = true;
            }
        }
        assert!(exhausted);

        // 显式 connect 重新开始，Ready 归零计数
        sup.connect().await.unwrap();
        assert_eq!(*transport.connect_calls.lock().unwrap(), 6);
        tx.send(TransportEvent::Ready).unwrap();
        settle().await;
        assert_eq!(sup.reconnect_attempts().await, 0);
        assert!(sup.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_releases_resource_and_suppresses_reconnect() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport.clone(), rx, &link_section(30, 5));

        tx.send(TransportEvent::Ready).unwrap();
        settle().await;

        sup.logout().await.unwrap();
        assert_eq!(*transport.release_calls.lock().unwrap(), 1);
        assert_eq!(sup.state().await, LinkState::Disconnected);

        // 登出引发的断线事件不算意外断线
        tx.send(TransportEvent::Disconnected("logout".into())).unwrap();
        settle().await;
        assert_eq!(*transport.connect_calls.lock().unwrap(), 0);
        assert_eq!(sup.reconnect_attempts().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_terminal_until_manual_connect() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport.clone(), rx, &link_section(30, 5));

        tx.send(TransportEvent::AuthFailure("bad session".into())).unwrap();
        settle().await;
        assert_eq!(sup.state().await, LinkState::AuthFailed);
        assert_eq!(*transport.connect_calls.lock().unwrap(), 0);

        sup.connect().await.unwrap();
        assert_eq!(*transport.connect_calls.lock().unwrap(), 1);
    }
}
