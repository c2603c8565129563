//! 群发调度器
//!
//! 一条消息扇出到 N 个目标：第 i 个目标在 `i × rate` 偏移处开始发送，
//! 发送彼此并发在途，只有起始时刻被错开；每个目标的结果独立记录。
//! 完成判定依据"已落定结果数 == N"的计数器，而不是调度位置——
//! 网络延迟下先调度的发送完全可能最后落定。
//!
//! 单个目标失败不致命也不重试，汇总里点名计数即可。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::supervisor::ConnectionSupervisor;

/// 调度间隔下限（毫秒）
pub const MIN_RATE: Duration = Duration::from_millis(1000);

/// 群发目标引用（注册表中的活跃群）
#[derive(Debug, Clone)]
pub struct BroadcastTarget {
    pub id: i64,
    pub name: String,
    pub channel_id: String,
}

/// 单目标投递结果
#[derive(Debug, Clone)]
pub enum Delivery {
    Sent,
    Failed(String),
}

/// 单目标结果事件
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target: BroadcastTarget,
    pub delivery: Delivery,
}

/// 全部 N 个结果落定后发出的汇总
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSummary {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
}

/// 任务事件流：N 个 Outcome 后恰好一个 Summary
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    Outcome(TargetOutcome),
    Summary(BroadcastSummary),
}

/// 扇出一条消息；返回任务事件流的接收端
///
/// 前置条件：目标非空且频道 ID 两两不同，`rate >= 1000ms`。
/// 一旦返回 Ok，任务不可中途取消。
pub fn broadcast(
    supervisor: Arc<ConnectionSupervisor>,
    message: String,
    targets: Vec<BroadcastTarget>,
    rate: Duration,
) -> Result<mpsc::UnboundedReceiver<BroadcastEvent>, RelayError> {
    if targets.is_empty() {
        return Err(RelayError::BroadcastPrecondition("empty target list".into()));
    }
    {
        let mut seen = std::collections::HashSet::new();
        for target in &targets {
            if !seen.insert(target.channel_id.as_str()) {
                return Err(RelayError::BroadcastPrecondition(format!(
                    "duplicate target {}",
                    target.channel_id
                )));
            }
        }
    }
    if rate < MIN_RATE {
        return Err(RelayError::InvalidSendRate(format!(
            "{}ms is below the {}ms floor",
            rate.as_millis(),
            MIN_RATE.as_millis()
        )));
    }

    let job_id = uuid::Uuid::new_v4();
    let total = targets.len();
    tracing::info!(%job_id, total, rate_ms = rate.as_millis() as u64, "broadcast dispatched");

    let (tx, rx) = mpsc::unbounded_channel();
    let message = Arc::new(message);
    let resolved = Arc::new(AtomicUsize::new(0));
    let sent = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    for (i, target) in targets.into_iter().enumerate() {
        let supervisor = Arc::clone(&supervisor);
        let message = Arc::clone(&message);
        let resolved = Arc::clone(&resolved);
        let sent = Arc::clone(&sent);
        let failed = Arc::clone(&failed);
        let tx = tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(rate * i as u32).await;

            let delivery = match supervisor.send(&target.channel_id, &message).await {
                Ok(()) => {
                    sent.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(%job_id, group = %target.name, "message sent");
                    Delivery::Sent
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(%job_id, group = %target.name, error = %e, "send failed");
                    Delivery::Failed(e.to_string())
                }
            };

            let _ = tx.send(BroadcastEvent::Outcome(TargetOutcome { target, delivery }));

            // 自己是最后一个落定者时负责发汇总
            if resolved.fetch_add(1, Ordering::SeqCst) + 1 == total {
                let summary = BroadcastSummary {
                    sent: sent.load(Ordering::SeqCst),
                    failed: failed.load(Ordering::SeqCst),
                    total,
                };
                tracing::info!(
                    %job_id,
                    sent = summary.sent,
                    failed = summary.failed,
                    total = summary.total,
                    "broadcast completed"
                );
                let _ = tx.send(BroadcastEvent::Summary(summary));
            }
        });
    }

    Ok(rx)
}

/// 单目标便捷发送：跳过排程立即发送，事件流形状与 broadcast 一致
pub fn send_one(
    supervisor: Arc<ConnectionSupervisor>,
    message: String,
    target: BroadcastTarget,
) -> mpsc::UnboundedReceiver<BroadcastEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let delivery = match supervisor.send(&target.channel_id, &message).await {
            Ok(()) => {
                tracing::info!(group = %target.name, "message sent");
                Delivery::Sent
            }
            Err(e) => {
                tracing::warn!(group = %target.name, error = %e, "send failed");
                Delivery::Failed(e.to_string())
            }
        };
        let summary = BroadcastSummary {
            sent: matches!(delivery, Delivery::Sent) as usize,
            failed: matches!(delivery, Delivery::Failed(_)) as usize,
            total: 1,
        };
        let _ = tx.send(BroadcastEvent::Outcome(TargetOutcome { target, delivery }));
        let _ = tx.send(BroadcastEvent::Summary(summary));
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkSection;
    use crate::transport::testing::FakeTransport;
    use crate::transport::TransportEvent;
    use tokio::sync::mpsc::unbounded_channel;

    fn target(id: i64, channel: &str) -> BroadcastTarget {
        BroadcastTarget {
            id,
            name: format!("group-{}", id),
            channel_id: channel.to_string(),
        }
    }

    async fn connected_supervisor(
        transport: Arc<FakeTransport>,
    ) -> Arc<ConnectionSupervisor> {
        let (tx, rx) = unbounded_channel();
        let sup = ConnectionSupervisor::spawn(transport, rx, &LinkSection::default());
        tx.send(TransportEvent::Ready).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        sup
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<BroadcastEvent>) -> Vec<BroadcastEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, BroadcastEvent::Summary(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn emits_n_outcomes_then_one_summary() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_channel("2@g.us");
        let sup = connected_supervisor(transport).await;

        let targets = vec![target(1, "1@g.us"), target(2, "2@g.us"), target(3, "3@g.us")];
        let rx = broadcast(sup, "נסיעה".into(), targets, Duration::from_secs(5)).unwrap();

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        assert!(events[..3]
            .iter()
            .all(|e| matches!(e, BroadcastEvent::Outcome(_))));
        let BroadcastEvent::Summary(summary) = &events[3] else {
            panic!("last event must be the summary");
        };
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn summary_waits_for_slow_early_target() {
        let transport = Arc::new(FakeTransport::new());
        // 第 0 个目标的网络延迟远超后续目标的调度偏移
        transport.set_latency("1@g.us", Duration::from_secs(30));
        let sup = connected_supervisor(transport.clone()).await;

        let targets = vec![target(1, "1@g.us"), target(2, "2@g.us"), target(3, "3@g.us")];
        let rx = broadcast(sup, "hello".into(), targets, Duration::from_secs(1)).unwrap();

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        // 落定顺序与调度顺序无关：目标 1 最后完成
        assert_eq!(
            transport.sent_channels(),
            vec!["2@g.us".to_string(), "3@g.us".to_string(), "1@g.us".to_string()]
        );
        let BroadcastEvent::Summary(summary) = &events[3] else {
            panic!("summary must come after every outcome");
        };
        assert_eq!((summary.sent, summary.failed, summary.total), (3, 0, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn starts_are_staggered_by_rate() {
        let transport = Arc::new(FakeTransport::new());
        let sup = connected_supervisor(transport).await;
        let start = tokio::time::Instant::now();

        let targets = vec![target(1, "1@g.us"), target(2, "2@g.us"), target(3, "3@g.us")];
        let rx = broadcast(sup, "hi".into(), targets, Duration::from_secs(5)).unwrap();
        collect(rx).await;

        // 最后一个目标在 2 × 5s 偏移处发出（发送本身零延迟）
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_bad_preconditions() {
        let transport = Arc::new(FakeTransport::new());
        let sup = connected_supervisor(transport).await;

        let err = broadcast(Arc::clone(&sup), "m".into(), vec![], Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, RelayError::BroadcastPrecondition(_)));

        let dup = vec![target(1, "1@g.us"), target(2, "1@g.us")];
        let err = broadcast(Arc::clone(&sup), "m".into(), dup, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, RelayError::BroadcastPrecondition(_)));

        let err = broadcast(sup, "m".into(), vec![target(1, "1@g.us")], Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidSendRate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_one_matches_broadcast_shape() {
        let transport = Arc::new(FakeTransport::new());
        let sup = connected_supervisor(transport).await;

        let rx = send_one(sup, "שלום".into(), target(7, "7@g.us"));
        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        let BroadcastEvent::Summary(summary) = &events[1] else {
            panic!("second event must be the summary");
        };
        assert_eq!((summary.sent, summary.failed, summary.total), (1, 0, 1));
    }
}
