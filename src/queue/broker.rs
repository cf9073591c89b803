//! RabbitMQ bindings for the intake exchange and the deletion topic.
//!
//! The broker carries coarse cross-chapter priority; fine-grained per-bitrate
//! retry and backoff live in the Redis work queues.

use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::{ChapterTranscodeRequest, Priority};

pub const TRANSCODING_EXCHANGE: &str = "transcoding.exchange";
pub const DELETION_QUEUE: &str = "audiobook.chapters.deleted";

/// Reconnect policy: 5 s x 2^attempt, capped at 10 attempts.
const RECONNECT_BASE_DELAY_SECS: u64 = 5;
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

pub fn intake_queue_name(priority: Priority) -> String {
    format!("audiobook.transcode.{}", priority.routing_key())
}

pub struct Broker {
    url: String,
    message_ttl_ms: u32,
    connection: Mutex<Connection>,
}

impl Broker {
    /// Connect and declare the full topology, retrying with exponential
    /// backoff until the broker is reachable or attempts run out.
    pub async fn connect(url: &str, message_ttl_ms: u32) -> Result<Self> {
        let connection = Self::connect_with_retry(url).await?;
        let broker = Self {
            url: url.to_string(),
            message_ttl_ms,
            connection: Mutex::new(connection),
        };
        let channel = broker.channel().await?;
        broker.declare_topology(&channel).await?;
        info!("Connected to RabbitMQ and declared transcoding topology");
        Ok(broker)
    }

    async fn connect_with_retry(url: &str) -> Result<Connection> {
        let mut attempt: u32 = 0;
        loop {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt + 1 < RECONNECT_MAX_ATTEMPTS => {
                    let delay = RECONNECT_BASE_DELAY_SECS * (1u64 << attempt.min(6));
                    warn!(
                        "RabbitMQ connect failed (attempt {}/{}): {}; retrying in {}s",
                        attempt + 1,
                        RECONNECT_MAX_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(AppError::Broker(e)),
            }
        }
    }

    /// Open a fresh channel, transparently reconnecting if the underlying
    /// connection has died.
    pub async fn channel(&self) -> Result<Channel> {
        {
            let conn = self.connection.lock().await;
            if conn.status().connected() {
                return Ok(conn.create_channel().await?);
            }
        }
        self.reconnect().await?;
        let conn = self.connection.lock().await;
        Ok(conn.create_channel().await?)
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection lost, reconnecting");
        let fresh = Self::connect_with_retry(&self.url).await?;
        let channel = fresh.create_channel().await?;
        {
            let mut conn = self.connection.lock().await;
            *conn = fresh;
        }
        self.declare_topology(&channel).await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.status().connected()
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        channel
            .exchange_declare(
                TRANSCODING_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            // The low queue tolerates twice the backlog age.
            let ttl = if priority == Priority::Low {
                self.message_ttl_ms.saturating_mul(2)
            } else {
                self.message_ttl_ms
            };

            let mut args = FieldTable::default();
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl as i32));
            args.insert("x-max-priority".into(), AMQPValue::LongInt(10));

            let queue = intake_queue_name(priority);
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    args,
                )
                .await?;
            channel
                .queue_bind(
                    &queue,
                    TRANSCODING_EXCHANGE,
                    priority.routing_key(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .queue_declare(
                DELETION_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Publish an intake message routed by its priority. Messages are
    /// persistent JSON with `message_id = {chapter_id}-{epoch_ms}`.
    pub async fn publish_transcode_request(&self, request: &ChapterTranscodeRequest) -> Result<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AppError::Queue(format!("serialize intake message: {}", e)))?;

        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_priority(request.priority.numeric())
            .with_message_id(request.message_id().into());

        channel
            .basic_publish(
                TRANSCODING_EXCHANGE,
                request.priority.routing_key(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    /// Consumer with prefetch 1 for fair dispatch across workers.
    pub async fn consumer(&self, queue: &str, tag: &str) -> Result<Consumer> {
        let channel = self.channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        Ok(channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?)
    }
}
