//! 控制端出入站适配
//!
//! 控制端平台（Telegram 等）的具体接入在仓库之外；这里只定义状态机消费的
//! 入站事件形状与回发回复的契约。回复带可选按钮，按钮点击以动作名回流。

mod http;

pub use http::{create_router, AdapterState, WebhookAdapter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 入站事件：离散动作（按钮）或自由文本
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Inbound {
    Action { name: String },
    Text { value: String },
}

/// 回复里的可点按钮
#[derive(Debug, Clone, Serialize)]
pub struct ReplyButton {
    pub label: String,
    pub action: String,
}

impl ReplyButton {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// 出站契约：把状态机的回复送回控制端
///
/// 状态机从不等待回复被确认；实现方自行处理投递失败（记日志即可）。
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn reply(&self, operator_external_id: &str, text: &str, buttons: &[ReplyButton]);
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用适配器：按顺序记录所有回复

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct RecordedReply {
        pub operator: String,
        pub text: String,
        pub actions: Vec<String>,
    }

    #[derive(Default)]
    pub struct CapturingAdapter {
        pub replies: Mutex<Vec<RecordedReply>>,
    }

    impl CapturingAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn texts(&self) -> Vec<String> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.text.clone())
                .collect()
        }

        pub fn last(&self) -> Option<RecordedReply> {
            self.replies.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ChatAdapter for CapturingAdapter {
        async fn reply(&self, operator_external_id: &str, text: &str, buttons: &[ReplyButton]) {
            self.replies.lock().unwrap().push(RecordedReply {
                operator: operator_external_id.to_string(),
                text: text.to_string(),
                actions: buttons.iter().map(|b| b.action.clone()).collect(),
            });
        }
    }
}
