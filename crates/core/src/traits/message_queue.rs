use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// 消息头
pub type MessageHeaders = HashMap<String, String>;

/// 从总线收到的一条消息
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub headers: MessageHeaders,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl QueueMessage {
    /// 把负载按JSON反序列化
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// 订阅选项
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// 独占订阅：同一主题上同时只有一个独占订阅者收到消息，其余订阅者在其退出后接替
    pub exclusive: bool,
    /// 订阅组名称，独占订阅在组内竞争
    pub group: Option<String>,
}

impl SubscribeOptions {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn exclusive(group: impl Into<String>) -> Self {
        Self {
            exclusive: true,
            group: Some(group.into()),
        }
    }
}

/// 消息处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<()>;
}

/// 消息总线抽象接口
///
/// 投递语义（至少一次、顺序）由具体实现决定，调度核心不做额外保证。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定主题，返回消息ID
    async fn publish(&self, topic: &str, headers: &MessageHeaders, payload: &[u8])
        -> Result<String>;

    /// 订阅主题，返回订阅ID
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String>;

    /// 取消订阅
    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> Result<()>;

    /// 关闭连接
    async fn close(&self) -> Result<()>;
}
