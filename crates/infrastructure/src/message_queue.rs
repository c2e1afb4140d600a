use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_core::{
    config::MessageQueueConfig, MessageHandler, MessageHeaders, MessageQueue, QueueMessage,
    SchedulerError, SchedulerResult, SubscribeOptions,
};

/// 独占订阅被其他消费者占用时的重试间隔
const EXCLUSIVE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// RabbitMQ消息总线实现
///
/// 每个主题对应一个fanout交换机。共享订阅各自声明一个匿名独占队列；
/// 独占订阅在 `<主题>.<组>` 队列上以独占消费者身份消费，占用失败时定期重试以实现故障转移。
pub struct RabbitMqMessageQueue {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: MessageQueueConfig,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RabbitMqMessageQueue {
    /// 创建新的RabbitMQ消息总线实例
    pub async fn new(config: MessageQueueConfig) -> SchedulerResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// 获取连接状态
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn declare_exchange(channel: &Channel, topic: &str) -> SchedulerResult<()> {
        channel
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("声明交换机 {topic} 失败: {e}")))
    }

    /// 声明并绑定订阅队列，返回队列名
    async fn declare_subscription_queue(
        channel: &Channel,
        topic: &str,
        options: &SubscribeOptions,
    ) -> SchedulerResult<String> {
        Self::declare_exchange(channel, topic).await?;

        let (name, declare_options) = if options.exclusive {
            let group = options.group.as_deref().unwrap_or("default");
            (
                format!("{topic}.{group}"),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            )
        } else {
            (
                String::new(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            )
        };

        let queue = channel
            .queue_declare(&name, declare_options, FieldTable::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("声明队列 {name} 失败: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                topic,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("绑定队列 {queue_name} 到 {topic} 失败: {e}"))
            })?;

        debug!("队列 {} 已绑定到主题 {}", queue_name, topic);
        Ok(queue_name)
    }

    fn to_field_table(headers: &MessageHeaders) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        table
    }

    fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
        let mut headers = HashMap::new();
        if let Some(table) = table {
            for (key, value) in table.inner() {
                if let AMQPValue::LongString(value) = value {
                    headers.insert(
                        key.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).to_string(),
                    );
                }
            }
        }
        headers
    }

    async fn consume(topic: String, mut consumer: Consumer, handler: Arc<dyn MessageHandler>) {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(topic = %topic, "接收消息失败: {e}");
                    break;
                }
            };
            let message = QueueMessage {
                id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_default(),
                topic: topic.clone(),
                headers: Self::from_field_table(delivery.properties.headers().as_ref()),
                payload: delivery.data.clone(),
                published_at: Utc::now(),
            };

            let outcome = handler.handle(message).await;
            let ack = match outcome {
                Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                Err(e) => {
                    warn!(topic = %topic, "处理消息失败: {e}");
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await
                }
            };
            if let Err(e) = ack {
                warn!(topic = %topic, "确认消息失败: {e}");
            }
        }
        debug!("主题 {} 的消费者已退出", topic);
    }
}

#[async_trait]
impl MessageQueue for RabbitMqMessageQueue {
    async fn publish(
        &self,
        topic: &str,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> SchedulerResult<String> {
        let channel = self.channel.lock().await;
        Self::declare_exchange(&channel, topic).await?;

        let message_id = Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // 2 = persistent
            .with_message_id(ShortString::from(message_id.clone()))
            .with_headers(Self::to_field_table(headers));

        let publish = async {
            let confirm = channel
                .basic_publish(topic, "", BasicPublishOptions::default(), payload, properties)
                .await
                .map_err(|e| {
                    SchedulerError::MessageQueue(format!("发布消息到主题 {topic} 失败: {e}"))
                })?;
            confirm
                .await
                .map_err(|e| SchedulerError::MessageQueue(format!("消息发布确认失败: {e}")))
        };
        tokio::time::timeout(self.config.publish_timeout(), publish)
            .await
            .map_err(|_| SchedulerError::Timeout(format!("发布消息到主题 {topic} 超时")))??;

        debug!("消息已发布到主题: {}", topic);
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> SchedulerResult<String> {
        let subscription_id = Uuid::new_v4().to_string();
        let queue_name = {
            let channel = self.channel.lock().await;
            Self::declare_subscription_queue(&channel, topic, &options).await?
        };

        let channel = self.channel.clone();
        let topic_name = topic.to_string();
        let consumer_tag = subscription_id.clone();
        let exclusive = options.exclusive;
        let handle = tokio::spawn(async move {
            loop {
                let consumer = {
                    let channel = channel.lock().await;
                    channel
                        .basic_consume(
                            &queue_name,
                            &consumer_tag,
                            BasicConsumeOptions {
                                exclusive,
                                ..Default::default()
                            },
                            FieldTable::default(),
                        )
                        .await
                };
                match consumer {
                    Ok(consumer) => {
                        info!("开始消费主题 {} (队列 {})", topic_name, queue_name);
                        Self::consume(topic_name.clone(), consumer, handler.clone()).await;
                    }
                    Err(e) if exclusive => {
                        debug!("独占队列 {} 暂被占用: {e}", queue_name);
                    }
                    Err(e) => {
                        warn!("创建消费者失败: {e}");
                        return;
                    }
                }
                tokio::time::sleep(EXCLUSIVE_RETRY_INTERVAL).await;
            }
        });

        self.subscriptions
            .lock()
            .await
            .insert(subscription_id.clone(), handle);
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> SchedulerResult<()> {
        if let Some(handle) = self.subscriptions.lock().await.remove(subscription_id) {
            handle.abort();
        }
        let channel = self.channel.lock().await;
        if let Err(e) = channel
            .basic_cancel(subscription_id, BasicCancelOptions::default())
            .await
        {
            debug!("取消主题 {} 的订阅 {} 失败: {e}", topic, subscription_id);
        }
        Ok(())
    }

    async fn close(&self) -> SchedulerResult<()> {
        for (_, handle) in self.subscriptions.lock().await.drain() {
            handle.abort();
        }
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}
