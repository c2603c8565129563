//! 中继状态机
//!
//! 消费适配器送来的 {操作员, 动作|文本} 事件，按当前步骤解释并驱动
//! 注册表与群发调度器，回复一律异步送回适配器，从不等待确认。
//!
//! 主流程：
//! Idle --compose--> AwaitingRideMessage --文本--> AwaitingGroupSelection
//! --选目标/全部--> 派发群发任务并立即回到 Idle（草稿在调度开始前已同步清空，
//! 所以新任务不会破坏在途任务）。

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{ChatAdapter, Inbound, ReplyButton};
use crate::bot::session::{Draft, SessionManager, SessionPolicy, Step};
use crate::dispatch::{self, BroadcastEvent, BroadcastTarget, Delivery};
use crate::error::RelayError;
use crate::registry::{Group, GroupRegistry, Operator};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{is_valid_channel_id, ChannelInfo};

pub struct RelayEngine {
    registry: Arc<dyn GroupRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    adapter: Arc<dyn ChatAdapter>,
    sessions: SessionManager,
    /// 为空时放行所有操作员
    allowed_operators: Vec<String>,
}

fn main_menu() -> Vec<ReplyButton> {
    vec![
        ReplyButton::new("🚗 פרסום נסיעה", "post_ride"),
        ReplyButton::new("👥 ניהול קבוצות", "manage_groups"),
        ReplyButton::new("⚡ שינוי קצב שליחה", "change_send_rate"),
        ReplyButton::new("🧹 ניקוי צ'אטים", "clean_chats"),
        ReplyButton::new("🔄 איתחול", "reset_link"),
        ReplyButton::new("🚪 התנתקות", "disconnect"),
    ]
}

fn not_connected_buttons() -> Vec<ReplyButton> {
    vec![
        ReplyButton::new("🔄 איתחול", "reset_link"),
        ReplyButton::new("◀️ חזור", "main_menu"),
    ]
}

fn back_button() -> Vec<ReplyButton> {
    vec![ReplyButton::new("◀️ חזור", "main_menu")]
}

impl RelayEngine {
    pub fn new(
        registry: Arc<dyn GroupRegistry>,
        supervisor: Arc<ConnectionSupervisor>,
        adapter: Arc<dyn ChatAdapter>,
        session_policy: SessionPolicy,
        allowed_operators: Vec<String>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            adapter,
            sessions: SessionManager::new(session_policy),
            allowed_operators,
        }
    }

    /// 周期清理空闲会话（由外层定时调用）
    pub async fn cleanup_sessions(&self) -> usize {
        self.sessions.cleanup_expired().await
    }

    #[cfg(test)]
    pub(crate) async fn step_of(&self, external_id: &str) -> Option<Step> {
        self.sessions.step_of(external_id).await
    }

    /// 入站事件入口
    pub async fn handle_event(
        &self,
        external_id: &str,
        display_name: Option<&str>,
        event: Inbound,
    ) {
        if !self.allowed_operators.is_empty()
            && !self.allowed_operators.iter().any(|id| id == external_id)
        {
            tracing::warn!(operator = external_id, "unauthorized access attempt");
            self.reply(external_id, "❌ אין לך הרשאה להשתמש בבוט.", &[]).await;
            return;
        }

        let operator = match self.registry.ensure_operator(external_id, display_name).await {
            Ok(op) => op,
            Err(e) => {
                tracing::error!(operator = external_id, error = %e, "registry failure");
                self.reply(external_id, "❌ שגיאת מסד נתונים. נסה שוב מאוחר יותר.", &[])
                    .await;
                return;
            }
        };

        match event {
            Inbound::Action { name } => self.handle_action(&operator, &name).await,
            Inbound::Text { value } => self.handle_text(&operator, &value).await,
        }
    }

    async fn handle_action(&self, operator: &Operator, action: &str) {
        let ext = operator.external_id.as_str();

        // 带 ID 后缀的动作；后缀不是数字时落到未识别分支
        if let Some(id) = action.strip_prefix("select_group_") {
            if let Ok(group_id) = id.parse::<i64>() {
                self.send_to_selected(operator, group_id).await;
                return;
            }
        } else if let Some(id) = action.strip_prefix("delete_group_") {
            if let Ok(group_id) = id.parse::<i64>() {
                self.delete_group(operator, group_id).await;
                return;
            }
        }

        match action {
            "main_menu" => {
                // 任意状态回主菜单都丢弃草稿
                self.sessions
                    .with_session(ext, operator.id, |s| s.reset())
                    .await;
                self.reply(ext, "📋 תפריט ראשי:", &main_menu()).await;
            }
            "start" | "help" => {
                self.sessions
                    .with_session(ext, operator.id, |s| s.reset())
                    .await;
                let name = operator.display_name.as_deref().unwrap_or("User");
                let text = format!(
                    "🚗 ברוכים הבאים לבוט ניהול נסיעות!\n\nשלום {}! 👋\n\n\
                     בוט זה מאפשר לפרסם נסיעות בקבוצות וואטסאפ ולנהל אותן.\n\n\
                     בחרו פעולה מהתפריט:",
                    name
                );
                self.reply(ext, &text, &main_menu()).await;
            }
            "post_ride" => {
                if !self.supervisor.is_connected().await {
                    self.reply(
                        ext,
                        "❌ וואטסאפ לא מחובר!\n\nיש להתחבר תחילה באמצעות \"איתחול\".",
                        &not_connected_buttons(),
                    )
                    .await;
                    return;
                }
                self.sessions
                    .with_session(ext, operator.id, |s| {
                        s.step = Step::AwaitingRideMessage;
                        s.draft = None;
                    })
                    .await;
                self.reply(
                    ext,
                    "🚗 פרסום נסיעה\n\nאנא שלח את הודעת הנסיעה שברצונך לפרסם:",
                    &back_button(),
                )
                .await;
            }
            "send_to_all" => self.send_to_all(operator).await,
            "manage_groups" | "refresh_groups" => self.show_groups(operator).await,
            "add_group" => {
                self.sessions
                    .with_session(ext, operator.id, |s| {
                        s.step = Step::AwaitingNewGroupId;
                        s.draft = None;
                    })
                    .await;
                self.reply(
                    ext,
                    "➕ הוספת קבוצה חדשה\n\nהזן את ID הקבוצה בוואטסאפ (לדוגמה: 120363025246125708@g.us):",
                    &back_button(),
                )
                .await;
            }
            "delete_group" => self.show_group_deletion(operator).await,
            "change_send_rate" => {
                self.sessions
                    .with_session(ext, operator.id, |s| {
                        s.step = Step::AwaitingSendRateInput;
                        s.draft = None;
                    })
                    .await;
                self.reply(
                    ext,
                    "⚡ שינוי קצב שליחה\n\nהזן את מספר השניות להמתנה בין שליחת הודעות (מינימום 5):",
                    &back_button(),
                )
                .await;
            }
            "clean_chats" => {
                if !self.supervisor.is_connected().await {
                    self.reply(
                        ext,
                        "❌ וואטסאפ לא מחובר!\n\nיש להתחבר תחילה.",
                        &not_connected_buttons(),
                    )
                    .await;
                    return;
                }
                self.reply(
                    ext,
                    "🧹 ניקוי צ'אטים\n\n⚠️ פעולה זו תמחק את כל ההודעות מהקבוצות!\n\nהאם אתה בטוח?",
                    &[
                        ReplyButton::new("✅ כן, נקה", "confirm_clean"),
                        ReplyButton::new("❌ ביטול", "main_menu"),
                    ],
                )
                .await;
            }
            "confirm_clean" => self.clean_chats(operator).await,
            "reset_link" => self.reset_link(operator).await,
            "disconnect" => {
                match self.supervisor.logout().await {
                    Ok(()) => {
                        tracing::info!(operator = ext, "operator disconnected downstream link");
                        self.reply(ext, "🚪 ההתנתקות הושלמה בהצלחה.", &main_menu()).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "logout failed");
                        self.reply(ext, "❌ שגיאה בהתנתקות.", &main_menu()).await;
                    }
                }
            }
            "status" => {
                let status = self.supervisor.status().await;
                let last = status
                    .last_activity
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "לא זמין".to_string());
                let text = format!(
                    "📊 סטטוס מערכת\n\n🟢 וואטסאפ: {}\n📅 פעילות אחרונה: {}",
                    if status.connected { "מחובר ✅" } else { "לא מחובר ❌" },
                    last
                );
                self.reply(ext, &text, &main_menu()).await;
            }
            other => {
                tracing::debug!(operator = ext, action = other, "unrecognized action");
                self.reply(ext, "❓ פעולה לא מזוהה.", &main_menu()).await;
            }
        }
    }

    async fn handle_text(&self, operator: &Operator, text: &str) {
        let ext = operator.external_id.as_str();
        let step = self
            .sessions
            .with_session(ext, operator.id, |s| s.step)
            .await;

        match step {
            Step::Idle => {
                self.reply(
                    ext,
                    "❓ הפקודה לא מזוהה. השתמש בתפריט הראשי.",
                    &main_menu(),
                )
                .await;
            }
            Step::AwaitingRideMessage => self.store_ride_draft(operator, text).await,
            Step::AwaitingGroupSelection => {
                // 这一步只接受按钮；自由文本不改变状态
                self.reply(ext, "👆 בחר קבוצה מהכפתורים למעלה.", &back_button()).await;
            }
            Step::AwaitingSendRateInput => self.change_send_rate(operator, text).await,
            Step::AwaitingNewGroupId => self.register_group(operator, text).await,
        }
    }

    /// AwaitingRideMessage：存草稿并列出目标选择
    async fn store_ride_draft(&self, operator: &Operator, message: &str) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };

        if groups.is_empty() {
            self.sessions
                .with_session(ext, operator.id, |s| s.reset())
                .await;
            self.reply(
                ext,
                "❌ לא נמצאו קבוצות!\n\nיש להוסיף קבוצות תחילה דרך \"ניהול קבוצות\".",
                &main_menu(),
            )
            .await;
            return;
        }

        self.sessions
            .with_session(ext, operator.id, |s| {
                s.step = Step::AwaitingGroupSelection;
                s.draft = Some(Draft {
                    message: message.to_string(),
                    selected_target_ids: Vec::new(),
                });
            })
            .await;

        let mut buttons: Vec<ReplyButton> = groups
            .iter()
            .map(|g| ReplyButton::new(format!("📱 {}", g.name), format!("select_group_{}", g.id)))
            .collect();
        buttons.push(ReplyButton::new("✅ שלח לכל הקבוצות", "send_to_all"));
        buttons.push(ReplyButton::new("◀️ חזור", "main_menu"));

        let text = format!(
            "👥 בחר קבוצות לשליחה:\n\nההודעה שתישלח:\n\n{}",
            message
        );
        self.reply(ext, &text, &buttons).await;
    }

    /// 取走草稿：同步清空会话里的草稿，调度开始前完成
    async fn take_draft(&self, operator: &Operator, selected: Vec<i64>) -> Option<Draft> {
        self.sessions
            .with_session(operator.external_id.as_str(), operator.id, |s| {
                let draft = s.draft.take().map(|mut d| {
                    d.selected_target_ids = selected;
                    d
                });
                s.reset();
                draft
            })
            .await
    }

    async fn send_to_all(&self, operator: &Operator) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };
        if groups.is_empty() {
            self.reply(ext, "❌ אין קבוצות זמינות.", &main_menu()).await;
            return;
        }

        let all_ids: Vec<i64> = groups.iter().map(|g| g.id).collect();
        let Some(draft) = self.take_draft(operator, all_ids).await else {
            // 草稿已被之前的发送消费掉（或从未存在）
            self.reply(ext, "❌ הודעה לא נמצאה.", &main_menu()).await;
            return;
        };

        let rate_ms = match self.registry.send_rate_ms(operator.id).await {
            Ok(rate) => rate,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };

        let targets: Vec<BroadcastTarget> = groups.into_iter().map(group_target).collect();
        let total = targets.len();
        match dispatch::broadcast(
            Arc::clone(&self.supervisor),
            draft.message,
            targets,
            Duration::from_millis(rate_ms),
        ) {
            Ok(rx) => {
                self.reply(ext, "🚀 שולח הודעה לכל הקבוצות...", &[]).await;
                tracing::info!(operator = ext, total, rate_ms, "ride broadcast started");
                self.relay_job_events(ext.to_string(), rx);
            }
            Err(e) => {
                tracing::error!(error = %e, "broadcast rejected");
                self.reply(ext, "❌ שגיאה בשליחת ההודעות.", &main_menu()).await;
            }
        }
    }

    async fn send_to_selected(&self, operator: &Operator, group_id: i64) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };
        let Some(group) = groups.into_iter().find(|g| g.id == group_id) else {
            self.reply(ext, "❌ קבוצה לא נמצאה.", &main_menu()).await;
            return;
        };

        let Some(draft) = self.take_draft(operator, vec![group_id]).await else {
            self.reply(ext, "❌ הודעה לא נמצאה.", &main_menu()).await;
            return;
        };

        self.reply(
            ext,
            &format!("🚀 שולח הודעה לקבוצה \"{}\"...", group.name),
            &[],
        )
        .await;
        let rx = dispatch::send_one(
            Arc::clone(&self.supervisor),
            draft.message,
            group_target(group),
        );
        self.relay_job_events(ext.to_string(), rx);
    }

    /// 把任务事件转回控制端：逐目标结果记日志，汇总作为最终回复
    fn relay_job_events(
        &self,
        external_id: String,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<BroadcastEvent>,
    ) {
        let adapter = Arc::clone(&self.adapter);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BroadcastEvent::Outcome(outcome) => {
                        if let Delivery::Failed(reason) = &outcome.delivery {
                            tracing::warn!(
                                operator = %external_id,
                                group = %outcome.target.name,
                                reason = %reason,
                                "target delivery failed"
                            );
                        }
                    }
                    BroadcastEvent::Summary(summary) => {
                        let text = format!(
                            "✅ שליחה הושלמה!\n\n🟢 נשלח בהצלחה: {}\n🔴 נכשל: {}\n📊 סה\"כ קבוצות: {}",
                            summary.sent, summary.failed, summary.total
                        );
                        adapter.reply(&external_id, &text, &main_menu()).await;
                        break;
                    }
                }
            }
        });
    }

    /// AwaitingSendRateInput：整数秒，最小 5；非法输入留在原步骤重试
    async fn change_send_rate(&self, operator: &Operator, text: &str) {
        let ext = operator.external_id.as_str();
        let rate_secs = match text.trim().parse::<u64>() {
            Ok(secs) if secs >= 5 => secs,
            _ => {
                self.reply(
                    ext,
                    "❌ קצב שליחה לא תקין!\n\nיש להזין מספר שניות (מינימום 5).",
                    &back_button(),
                )
                .await;
                return;
            }
        };

        if let Err(e) = self
            .registry
            .set_send_rate_ms(operator.id, rate_secs * 1000)
            .await
        {
            self.storage_failure(operator, &e).await;
            return;
        }

        self.sessions
            .with_session(ext, operator.id, |s| s.reset())
            .await;
        tracing::info!(operator = ext, rate_secs, "send rate changed");
        self.reply(
            ext,
            &format!("✅ קצב השליחה שונה ל-{} שניות בין הודעות.", rate_secs),
            &main_menu(),
        )
        .await;
    }

    /// 校验格式并在线解析；两类失败都以错误值返回，由调用方映射成提示
    async fn resolve_new_channel(&self, channel_id: &str) -> Result<ChannelInfo, RelayError> {
        if !is_valid_channel_id(channel_id) {
            return Err(RelayError::InvalidChannelId(channel_id.to_string()));
        }
        self.supervisor
            .resolve_channel(channel_id)
            .await?
            .ok_or_else(|| RelayError::ChannelNotFound(channel_id.to_string()))
    }

    /// AwaitingNewGroupId：格式校验 + 在线解析通过后才入库；失败留在原步骤重试
    async fn register_group(&self, operator: &Operator, text: &str) {
        let ext = operator.external_id.as_str();
        let channel_id = text.trim();

        let info = match self.resolve_new_channel(channel_id).await {
            Ok(info) => info,
            Err(RelayError::InvalidChannelId(_)) => {
                self.reply(
                    ext,
                    "❌ ID קבוצה לא תקין!\n\nהפורמט הנדרש: 120363025246125708@g.us",
                    &back_button(),
                )
                .await;
                return;
            }
            Err(RelayError::ChannelNotFound(_)) => {
                self.reply(
                    ext,
                    "❌ קבוצה לא נמצאה בוואטסאפ!\n\nוודא שהבוט חבר לקבוצה וש-ID נכון.",
                    &back_button(),
                )
                .await;
                return;
            }
            Err(RelayError::NotConnected) => {
                self.reply(
                    ext,
                    "❌ וואטסאפ לא מחובר!\n\nיש להתחבר תחילה באמצעות \"איתחול\".",
                    &not_connected_buttons(),
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::error!(channel_id, error = %e, "channel resolution failed");
                self.reply(ext, "❌ שגיאה בהוספת הקבוצה. נסה שוב.", &back_button()).await;
                return;
            }
        };

        match self
            .registry
            .create_group(operator.id, &info.name, channel_id)
            .await
        {
            Ok(group) => {
                self.sessions
                    .with_session(ext, operator.id, |s| s.reset())
                    .await;
                self.reply(
                    ext,
                    &format!("✅ הקבוצה \"{}\" נוספה בהצלחה!", group.name),
                    &main_menu(),
                )
                .await;
            }
            Err(RelayError::DuplicateChannel(_)) => {
                self.reply(ext, "❌ הקבוצה כבר רשומה.", &back_button()).await;
            }
            Err(e) => self.storage_failure(operator, &e).await,
        }
    }

    async fn show_groups(&self, operator: &Operator) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };

        let mut text = String::from("👥 ניהול קבוצות\n\n");
        if groups.is_empty() {
            text.push_str("אין קבוצות שמורות.");
        } else {
            text.push_str("קבוצות שמורות:\n");
            for (i, group) in groups.iter().enumerate() {
                text.push_str(&format!("{}. 📱 {}\n", i + 1, group.name));
            }
        }

        let mut buttons = vec![ReplyButton::new("➕ הוסף קבוצה חדשה", "add_group")];
        if !groups.is_empty() {
            buttons.push(ReplyButton::new("❌ מחק קבוצה", "delete_group"));
        }
        buttons.push(ReplyButton::new("🔄 רענן רשימה", "refresh_groups"));
        buttons.push(ReplyButton::new("◀️ חזור", "main_menu"));

        self.reply(ext, &text, &buttons).await;
    }

    async fn show_group_deletion(&self, operator: &Operator) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };
        if groups.is_empty() {
            self.reply(ext, "❌ אין קבוצות למחיקה.", &back_button()).await;
            return;
        }

        let mut buttons: Vec<ReplyButton> = groups
            .iter()
            .map(|g| ReplyButton::new(format!("❌ {}", g.name), format!("delete_group_{}", g.id)))
            .collect();
        buttons.push(ReplyButton::new("◀️ חזור", "manage_groups"));

        self.reply(ext, "❌ מחיקת קבוצה\n\nבחר קבוצה למחיקה:", &buttons).await;
    }

    async fn delete_group(&self, operator: &Operator, group_id: i64) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };
        let Some(group) = groups.into_iter().find(|g| g.id == group_id) else {
            self.reply(ext, "❌ קבוצה לא נמצאה.", &main_menu()).await;
            return;
        };

        if let Err(e) = self.registry.soft_delete_group(group.id).await {
            self.storage_failure(operator, &e).await;
            return;
        }
        tracing::info!(operator = ext, group = %group.name, "group deleted");
        self.reply(
            ext,
            &format!("✅ הקבוצה \"{}\" נמחקה בהצלחה!", group.name),
            &main_menu(),
        )
        .await;
    }

    async fn clean_chats(&self, operator: &Operator) {
        let ext = operator.external_id.as_str();
        let groups = match self.registry.list_groups(operator.id).await {
            Ok(groups) => groups,
            Err(e) => {
                self.storage_failure(operator, &e).await;
                return;
            }
        };
        if groups.is_empty() {
            self.reply(ext, "❌ אין קבוצות לניקוי.", &main_menu()).await;
            return;
        }

        self.reply(ext, "🧹 מנקה צ'אטים...", &[]).await;

        let total = groups.len();
        let mut cleaned = 0usize;
        let mut failed = 0usize;
        for group in &groups {
            match self.supervisor.clear_chat(&group.channel_id).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(group = %group.name, error = %e, "clear chat failed");
                }
            }
        }

        let text = format!(
            "✅ ניקוי הושלם!\n\n🟢 נוקו בהצלחה: {}\n🔴 נכשל: {}\n📊 סה\"כ קבוצות: {}",
            cleaned, failed, total
        );
        self.reply(ext, &text, &main_menu()).await;
    }

    /// 重建下游连接：销毁旧资源后重新发起
    async fn reset_link(&self, operator: &Operator) {
        let ext = operator.external_id.as_str();
        self.reply(ext, "🔄 איתחול\n\nמתחיל איתחול...", &[]).await;

        let result = async {
            self.supervisor.destroy().await?;
            self.supervisor.connect().await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(operator = ext, "downstream link reinitialized");
                self.reply(ext, "✅ איתחול הושלם בהצלחה!", &main_menu()).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "link reset failed");
                self.reply(ext, "❌ שגיאה באיתחול.\n\nנסה שוב מאוחר יותר.", &main_menu())
                    .await;
            }
        }
    }

    /// 存储错误：回 Idle，给通用失败提示
    async fn storage_failure(&self, operator: &Operator, error: &RelayError) {
        tracing::error!(operator = %operator.external_id, error = %error, "storage failure");
        self.sessions
            .with_session(operator.external_id.as_str(), operator.id, |s| s.reset())
            .await;
        self.reply(
            operator.external_id.as_str(),
            "❌ שגיאת מסד נתונים. נסה שוב מאוחר יותר.",
            &main_menu(),
        )
        .await;
    }

    async fn reply(&self, external_id: &str, text: &str, buttons: &[ReplyButton]) {
        self.adapter.reply(external_id, text, buttons).await;
    }
}

fn group_target(group: Group) -> BroadcastTarget {
    BroadcastTarget {
        id: group.id,
        name: group.name,
        channel_id: group.channel_id,
    }
}
