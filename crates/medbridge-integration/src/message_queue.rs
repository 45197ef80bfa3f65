//! 事件总线集成模块
//!
//! 提供事件发布与订阅，支持：
//! - 进程内分区传输（测试与单机部署）
//! - RabbitMQ 传输，带发布确认
//! - 每个主题单一订阅者，消息逐条派发

use crate::events::{IntegrationEvent, Topic};
use async_trait::async_trait;
use lapin::{
    message::DeliveryResult, options::*, publisher_confirm::Confirmation, types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use medbridge_core::{ComponentLogger, LoggerRegistry, MedbridgeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// 消费端通道容量
const CONSUMER_BUFFER: usize = 1024;

/// 进程内传输每个分区默认保留的消息数
pub const DEFAULT_MEMORY_RETENTION: usize = 1000;

/// 事件传输抽象
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// 发送一条带分区键的消息
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;

    /// 以消费组身份订阅主题，返回消息流
    async fn consume(&self, topic: &str, group: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    fn name(&self) -> &'static str;
}

/// 按分区键选择分区：SHA-256 前 8 字节取模
pub fn partition_for(key: &str, partitions: u32) -> usize {
    let partitions = partitions.max(1) as u64;
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions) as usize
}

struct TopicLog {
    partitions: Vec<VecDeque<Vec<u8>>>,
    groups: HashMap<String, mpsc::Sender<Vec<u8>>>,
}

impl TopicLog {
    fn for_topic(topic: &str) -> Self {
        let partitions = topic
            .parse::<Topic>()
            .map(|t| t.config().partitions)
            .unwrap_or(1);
        Self {
            partitions: vec![VecDeque::new(); partitions as usize],
            groups: HashMap::new(),
        }
    }

    /// 追加到分区尾部，超出保留上限时丢弃最旧的消息
    fn append(&mut self, index: usize, payload: Vec<u8>, retention: usize) -> usize {
        let partition = &mut self.partitions[index];
        partition.push_back(payload);
        let mut evicted = 0;
        while partition.len() > retention {
            partition.pop_front();
            evicted += 1;
        }
        evicted
    }
}

/// 进程内传输
///
/// 每个主题按配置的分区数保存消息日志；同一分区键总是落在同一分区，
/// 分区内保持发送顺序。每个分区只保留最近 `retention` 条消息。
/// 每个消费组收到订阅之后的每条消息一次。
pub struct InMemoryTransport {
    topics: RwLock<HashMap<String, TopicLog>>,
    retention: usize,
    logger: ComponentLogger,
}

impl InMemoryTransport {
    pub fn new(logging: &LoggerRegistry) -> Self {
        Self::with_retention(DEFAULT_MEMORY_RETENTION, logging)
    }

    /// 指定每个分区的保留条数（至少 1）
    pub fn with_retention(retention: usize, logging: &LoggerRegistry) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            retention: retention.max(1),
            logger: logging.scoped("InMemoryTransport"),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// 主题内所有消息（按分区拼接）
    pub async fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// 指定分区内的消息
    pub async fn partition(&self, topic: &str, partition: usize) -> Vec<Vec<u8>> {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition))
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(&LoggerRegistry::default())
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let receivers: Vec<(String, mpsc::Sender<Vec<u8>>)> = {
            let mut topics = self.topics.write().await;
            let log = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::for_topic(topic));
            let index = partition_for(key, log.partitions.len() as u32);
            if log.append(index, payload.clone(), self.retention) > 0 {
                self.logger.debug(format!(
                    "Partition {} of {} at retention limit, oldest message dropped",
                    index, topic
                ));
            }
            log.groups
                .iter()
                .map(|(group, sender)| (group.clone(), sender.clone()))
                .collect()
        };

        for (group, sender) in receivers {
            if sender.send(payload.clone()).await.is_err() {
                self.logger
                    .debug(format!("Consumer group {} on {} has gone away", group, topic));
                let mut topics = self.topics.write().await;
                if let Some(log) = topics.get_mut(topic) {
                    log.groups.remove(&group);
                }
            }
        }
        Ok(())
    }

    async fn consume(&self, topic: &str, group: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        let mut topics = self.topics.write().await;
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::for_topic(topic));
        log.groups.insert(group.to_string(), sender);
        self.logger
            .info(format!("Consumer group {} attached to {}", group, topic));
        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// RabbitMQ 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub heartbeat: u16,
    pub prefetch_count: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "medbridge.events".to_string(),
            heartbeat: 60,
            prefetch_count: 10,
        }
    }
}

impl AmqpConfig {
    /// 心跳通过连接 URI 参数传递
    fn connection_uri(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}heartbeat={}", self.url, separator, self.heartbeat)
    }
}

fn transport_error(err: lapin::Error) -> MedbridgeError {
    MedbridgeError::Transport(err.to_string())
}

/// RabbitMQ 传输
///
/// 主题映射为 topic 交换器上的路由键，每个 (主题, 消费组) 对应一个持久队列。
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    config: AmqpConfig,
    logger: ComponentLogger,
}

impl AmqpTransport {
    /// 连接并声明交换器
    pub async fn connect(config: AmqpConfig, logging: &LoggerRegistry) -> Result<Self> {
        let logger = logging.scoped("AmqpTransport");
        let connection =
            Connection::connect(&config.connection_uri(), ConnectionProperties::default())
                .await
                .map_err(transport_error)?;
        let channel = connection.create_channel().await.map_err(transport_error)?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(transport_error)?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(transport_error)?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        logger.info(format!(
            "Connected to message broker, exchange {}",
            config.exchange
        ));
        Ok(Self {
            connection,
            channel,
            config,
            logger,
        })
    }

    fn queue_name(topic: &str, group: &str) -> String {
        format!("{}.{}", topic, group)
    }

    async fn declare_group_queue(&self, topic: &str, group: &str) -> Result<String> {
        let queue = Self::queue_name(topic, group);
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;
        self.channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;
        Ok(queue)
    }

    /// 为全部主题的默认消费组声明队列
    pub async fn provision(&self) -> Result<()> {
        for topic in Topic::ALL {
            let queue = self
                .declare_group_queue(topic.as_str(), topic.consumer_group())
                .await?;
            self.logger.info(format!("Queue provisioned: {}", queue));
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(transport_error)?;
        self.logger.info("Disconnected from message broker");
        Ok(())
    }
}

#[async_trait]
impl EventTransport for AmqpTransport {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(key.to_string().into())
            .with_delivery_mode(2);

        let confirm = self
            .channel
            .basic_publish(
                &self.config.exchange,
                topic,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;

        match confirm {
            Confirmation::Ack(_) | Confirmation::NotRequested => {
                self.logger
                    .debug(format!("Message {} confirmed on {}", key, topic));
                Ok(())
            }
            Confirmation::Nack(_) => {
                self.logger
                    .error(format!("Message {} rejected by broker on {}", key, topic));
                Err(MedbridgeError::Transport(format!(
                    "broker rejected message {}",
                    key
                )))
            }
        }
    }

    async fn consume(&self, topic: &str, group: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let queue = self.declare_group_queue(topic, group).await?;
        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &format!("{}-consumer", group),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        let logger = self.logger.clone();
        consumer.set_delegate(move |delivery: DeliveryResult| {
            let sender = sender.clone();
            let logger = logger.clone();
            async move {
                let delivery = match delivery {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => return,
                    Err(e) => {
                        logger.error(format!("Consumer error: {}", e));
                        return;
                    }
                };

                let outcome = if sender.send(delivery.data.clone()).await.is_ok() {
                    delivery.ack(BasicAckOptions::default()).await
                } else {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                };
                if let Err(e) = outcome {
                    logger.error(format!("Failed to settle delivery: {}", e));
                }
            }
        });

        self.logger
            .info(format!("Started consuming from queue: {}", queue));
        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// 事件处理器接口
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: IntegrationEvent) -> Result<()>;
}

/// 事件发布器
///
/// 以 eventId 作为分区键发布；每个主题只允许一个订阅者。
pub struct EventPublisher {
    transport: Arc<dyn EventTransport>,
    subscriptions: RwLock<HashMap<Topic, JoinHandle<()>>>,
    logger: ComponentLogger,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn EventTransport>, logging: &LoggerRegistry) -> Self {
        Self {
            transport,
            subscriptions: RwLock::new(HashMap::new()),
            logger: logging.scoped("EventPublisher"),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// 发布到指定主题
    pub async fn publish(&self, topic: Topic, event: &IntegrationEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        if let Err(e) = self
            .transport
            .send(topic.as_str(), &event.event_id, payload)
            .await
        {
            self.logger
                .error(format!("Failed to publish event {}: {}", event.event_id, e));
            return Err(e);
        }

        self.logger.info(format!(
            "Event published: {} ({}) -> {}",
            event.event_id, event.event_type, topic
        ));
        Ok(())
    }

    /// 按事件类型路由发布
    pub async fn publish_event(&self, event: &IntegrationEvent) -> Result<Topic> {
        let topic = event.topic();
        self.publish(topic, event).await?;
        Ok(topic)
    }

    /// 注册主题处理器，消息逐条派发
    pub async fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&topic) {
            self.logger
                .warn(format!("Topic {} already has a subscriber", topic));
            return Err(MedbridgeError::AlreadySubscribed(topic.to_string()));
        }

        let mut receiver = self
            .transport
            .consume(topic.as_str(), topic.consumer_group())
            .await?;
        let logger = self.logger.clone();
        let task = tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                let event = match serde_json::from_slice::<IntegrationEvent>(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        logger.warn(format!("Discarding malformed event on {}: {}", topic, e));
                        continue;
                    }
                };
                let event_id = event.event_id.clone();
                if let Err(e) = handler.handle(event).await {
                    logger.error(format!("Handler failed for event {}: {}", event_id, e));
                }
            }
            logger.debug(format!("Subscription on {} closed", topic));
        });

        subscriptions.insert(topic, task);
        self.logger.info(format!("Subscribed to {}", topic));
        Ok(())
    }

    /// 停止全部订阅
    pub async fn shutdown(&self) {
        let mut subscriptions = self.subscriptions.write().await;
        for (topic, task) in subscriptions.drain() {
            task.abort();
            self.logger.info(format!("Unsubscribed from {}", topic));
        }
    }
}
