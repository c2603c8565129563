//! Webhook 适配器
//!
//! 入站：控制端网关把操作员事件 POST 到 `/event`，信封里带操作员外部 ID、
//! 可选显示名和事件本体；处理完立刻 204，状态机的回复走出站通道异步送达。
//! 出站：配置了 reply_url 时把回复 POST 过去，否则仅写日志（本地联调）。

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::adapter::{ChatAdapter, Inbound, ReplyButton};
use crate::bot::RelayEngine;

/// 入站事件信封
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub operator_id: String,
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub event: Inbound,
}

#[derive(Clone)]
pub struct AdapterState {
    pub engine: Arc<RelayEngine>,
}

pub fn create_router(state: AdapterState) -> Router {
    Router::new()
        .route("/event", post(handle_inbound))
        .with_state(state)
}

async fn handle_inbound(
    State(state): State<AdapterState>,
    Json(envelope): Json<InboundEnvelope>,
) -> StatusCode {
    tracing::debug!(operator = %envelope.operator_id, "inbound event");
    state
        .engine
        .handle_event(
            &envelope.operator_id,
            envelope.display_name.as_deref(),
            envelope.event,
        )
        .await;
    StatusCode::NO_CONTENT
}

/// 出站回复推送；reply_url 未配置时只写日志
pub struct WebhookAdapter {
    client: reqwest::Client,
    reply_url: Option<String>,
}

impl WebhookAdapter {
    pub fn new(reply_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            reply_url,
        }
    }
}

#[async_trait]
impl ChatAdapter for WebhookAdapter {
    async fn reply(&self, operator_external_id: &str, text: &str, buttons: &[ReplyButton]) {
        let Some(url) = &self.reply_url else {
            tracing::info!(operator = operator_external_id, text, "reply (log only)");
            return;
        };

        let payload = serde_json::json!({
            "operator_id": operator_external_id,
            "text": text,
            "buttons": buttons,
        });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    operator = operator_external_id,
                    status = %response.status(),
                    "reply webhook rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(operator = operator_external_id, error = %e, "reply webhook failed");
            }
        }
    }
}
