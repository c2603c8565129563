//! 会话管理
//!
//! 每个操作员一个会话，保存当前工作流步骤与进行中的草稿。
//! 会话表按注入的策略做有界驱逐：先清空闲超时的，再按最近活跃度裁到容量内，
//! 避免惰性创建、永不销毁导致的无界增长。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// 工作流步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// 初始态，每轮交互结束后回到这里
    Idle,
    /// 等待操作员输入要群发的消息文本
    AwaitingRideMessage,
    /// 草稿已存，等待选择目标群
    AwaitingGroupSelection,
    /// 等待输入新的发送间隔（秒）
    AwaitingSendRateInput,
    /// 等待输入新群的频道 ID
    AwaitingNewGroupId,
}

/// 进行中的群发草稿；仅在 AwaitingGroupSelection 步骤存在
#[derive(Debug, Clone)]
pub struct Draft {
    pub message: String,
    /// 已选目标（有序）；确认发送时填充
    pub selected_target_ids: Vec<i64>,
}

/// 单个操作员的会话
#[derive(Debug)]
pub struct Session {
    /// 注册表中的操作员 ID
    pub operator_id: i64,
    pub step: Step,
    pub draft: Option<Draft>,
    pub last_active: Instant,
}

impl Session {
    fn new(operator_id: i64) -> Self {
        Self {
            operator_id,
            step: Step::Idle,
            draft: None,
            last_active: Instant::now(),
        }
    }

    /// 回到初始态并丢弃草稿
    pub fn reset(&mut self) {
        self.step = Step::Idle;
        self.draft = None;
    }
}

/// 会话驱逐策略（容量 + 空闲超时），由调用方注入
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            capacity: 1000,
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// 会话管理器（外部操作员 ID -> 会话）
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// 取出（或惰性创建）会话并在其上执行 f；顺带刷新活跃时间与容量约束
    pub async fn with_session<F, R>(&self, external_id: &str, operator_id: i64, f: F) -> R
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(external_id.to_string())
            .or_insert_with(|| Session::new(operator_id));
        session.last_active = Instant::now();
        let result = f(session);

        if sessions.len() > self.policy.capacity {
            evict_lru(&mut sessions, self.policy.capacity);
        }
        result
    }

    /// 当前步骤（无会话时视为 Idle 还未创建，返回 None）
    pub async fn step_of(&self, external_id: &str) -> Option<Step> {
        self.sessions.read().await.get(external_id).map(|s| s.step)
    }

    /// 清理空闲超时的会话，返回清掉的数量
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let timeout = self.policy.idle_timeout;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_active.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// 超出容量时移除最久未活跃的会话
fn evict_lru(sessions: &mut HashMap<String, Session>, capacity: usize) {
    while sessions.len() > capacity {
        let oldest = sessions
            .iter()
            .min_by_key(|(_, s)| s.last_active)
            .map(|(id, _)| id.clone());
        let Some(id) = oldest else { break };
        tracing::debug!(operator = %id, "evicting least recently active session");
        sessions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(capacity: usize, idle_secs: u64) -> SessionManager {
        SessionManager::new(SessionPolicy {
            capacity,
            idle_timeout: Duration::from_secs(idle_secs),
        })
    }

    #[tokio::test]
    async fn lazily_creates_and_tracks_step() {
        let mgr = manager(10, 3600);
        assert_eq!(mgr.step_of("op1").await, None);

        mgr.with_session("op1", 1, |s| s.step = Step::AwaitingRideMessage)
            .await;
        assert_eq!(mgr.step_of("op1").await, Some(Step::AwaitingRideMessage));
        assert_eq!(mgr.active_count().await, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_active() {
        let mgr = manager(2, 3600);
        mgr.with_session("a", 1, |_| ()).await;
        mgr.with_session("b", 2, |_| ()).await;
        // 触碰 a，让 b 成为最旧的
        mgr.with_session("a", 1, |_| ()).await;
        mgr.with_session("c", 3, |_| ()).await;

        assert_eq!(mgr.active_count().await, 2);
        assert!(mgr.step_of("a").await.is_some());
        assert!(mgr.step_of("b").await.is_none());
        assert!(mgr.step_of("c").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_idle_sessions() {
        let mgr = manager(10, 0);
        mgr.with_session("a", 1, |_| ()).await;
        mgr.with_session("b", 2, |_| ()).await;

        assert_eq!(mgr.cleanup_expired().await, 2);
        assert_eq!(mgr.active_count().await, 0);
    }

    #[tokio::test]
    async fn reset_discards_draft() {
        let mgr = manager(10, 3600);
        mgr.with_session("a", 1, |s| {
            s.step = Step::AwaitingGroupSelection;
            s.draft = Some(Draft {
                message: "נסיעה לתל אביב".into(),
                selected_target_ids: Vec::new(),
            });
        })
        .await;

        mgr.with_session("a", 1, |s| s.reset()).await;
        mgr.with_session("a", 1, |s| {
            assert_eq!(s.step, Step::Idle);
            assert!(s.draft.is_none());
        })
        .await;
    }
}
