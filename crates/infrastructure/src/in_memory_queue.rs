use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_core::{
    MessageHandler, MessageHeaders, MessageQueue, QueueMessage, SchedulerError, SchedulerResult,
    SubscribeOptions,
};

/// 内存消息总线实现
///
/// 适用于嵌入式部署和测试。消息在发布者的任务上依次投递给订阅者，
/// `publish` 返回时所有处理器都已执行完毕。
pub struct InMemoryMessageQueue {
    /// 主题 -> 订阅者列表（按订阅顺序）
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    /// 每个主题最近发布的消息
    history: RwLock<HashMap<String, VecDeque<QueueMessage>>>,
    config: InMemoryQueueConfig,
    next_sequence: AtomicU64,
    fail_publishes: AtomicBool,
    closed: AtomicBool,
}

#[derive(Clone)]
struct Subscriber {
    id: String,
    options: SubscribeOptions,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 每个主题保留的历史消息条数（0表示不保留）
    pub history_capacity: usize,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    /// 创建新的内存消息队列实例
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    /// 使用指定配置创建内存消息队列实例
    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("创建内存消息总线: {:?}", config);
        Self {
            topics: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            config,
            next_sequence: AtomicU64::new(1),
            fail_publishes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// 模拟总线不可达，之后的发布都会失败
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// 某个主题上保留的历史消息
    pub async fn published(&self, topic: &str) -> Vec<QueueMessage> {
        self.history
            .read()
            .await
            .get(topic)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 计算本条消息的接收者：全部共享订阅者，加上每个独占组中最早的订阅者
    fn recipients(subscribers: &[Subscriber]) -> Vec<Subscriber> {
        let mut seen_groups: Vec<&str> = Vec::new();
        let mut recipients = Vec::new();
        for subscriber in subscribers {
            if subscriber.options.exclusive {
                let group = subscriber.options.group.as_deref().unwrap_or("");
                if seen_groups.contains(&group) {
                    continue;
                }
                seen_groups.push(group);
            }
            recipients.push(subscriber.clone());
        }
        recipients
    }

    async fn record(&self, message: &QueueMessage) {
        if self.config.history_capacity == 0 {
            return;
        }
        let mut history = self.history.write().await;
        let messages = history.entry(message.topic.clone()).or_default();
        if messages.len() >= self.config.history_capacity {
            messages.pop_front();
        }
        messages.push_back(message.clone());
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(
        &self,
        topic: &str,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> SchedulerResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::MessageQueue("消息总线已关闭".to_string()));
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(SchedulerError::MessageQueue(format!(
                "发布消息到主题 {topic} 失败: 总线不可达"
            )));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let message = QueueMessage {
            id: format!("{sequence}-{}", Uuid::new_v4()),
            topic: topic.to_string(),
            headers: headers.clone(),
            payload: payload.to_vec(),
            published_at: Utc::now(),
        };
        self.record(&message).await;

        let recipients = {
            let topics = self.topics.read().await;
            topics
                .get(topic)
                .map(|subscribers| Self::recipients(subscribers))
                .unwrap_or_default()
        };

        for subscriber in recipients {
            if let Err(e) = subscriber.handler.handle(message.clone()).await {
                warn!(
                    topic = topic,
                    subscription_id = %subscriber.id,
                    "处理消息失败: {e}"
                );
            }
        }

        debug!("消息已发布到主题: {}", topic);
        Ok(message.id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> SchedulerResult<String> {
        let id = Uuid::new_v4().to_string();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                options,
                handler,
            });
        debug!("订阅主题 {}: {}", topic, id);
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> SchedulerResult<()> {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.id != subscription_id);
        }
        Ok(())
    }

    async fn close(&self) -> SchedulerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().await.clear();
        info!("内存消息总线已关闭");
        Ok(())
    }
}
