//! Queue plumbing for reactive mode: one AMQP queue per manager unit,
//! at-least-once delivery, manual ack/nack with requeue.

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, message::Delivery};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::instrument;

use crate::github::JobRef;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport failure")]
    Transport(#[from] lapin::Error),

    #[error("queue consumer closed unexpectedly")]
    Closed,
}

/// Body of one queued job message.
#[derive(Clone, Debug, Deserialize)]
pub struct JobDetails {
    pub labels: Vec<String>,
    pub url: String,
}

/// What a worker should do with a message it pulled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Labels match and the URL resolves to a job: go pick it up.
    Proceed(JobRef),
    /// Not our labels; hand it back for a peer manager.
    Requeue,
    /// Unparsable: drop it, redelivery can never succeed.
    Malformed(String),
}

/// Decide a message's fate. The label check is case-insensitive and the
/// job's labels must be a subset of what this manager supports.
pub fn evaluate(details: &JobDetails, supported_labels: &[String]) -> Disposition {
    let supported: HashSet<String> = supported_labels
        .iter()
        .map(|label| label.to_lowercase())
        .collect();

    let ours = details
        .labels
        .iter()
        .all(|label| supported.contains(&label.to_lowercase()));
    if !ours {
        return Disposition::Requeue;
    }

    match JobRef::parse(&details.url) {
        Some(job) => Disposition::Proceed(job),
        None => Disposition::Malformed(format!("job url {:?} has no usable path", details.url)),
    }
}

pub struct QueueClient {
    // Dropping the connection tears down the channel, so it lives here.
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl QueueClient {
    /// `visibility_timeout` bounds how long the broker waits for an ack on
    /// an in-flight delivery before handing it to someone else.
    #[instrument(skip(uri))]
    pub async fn connect(
        uri: &str,
        queue: &str,
        visibility_timeout: Option<std::time::Duration>,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let mut arguments = FieldTable::default();
        if let Some(timeout) = visibility_timeout {
            arguments.insert(
                "x-consumer-timeout".into(),
                lapin::types::AMQPValue::LongLongInt(timeout.as_millis() as i64),
            );
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
        })
    }

    /// Messages currently waiting, read via a passive re-declare.
    pub async fn message_count(&self) -> Result<u32, QueueError> {
        let state = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(state.message_count())
    }

    /// Block until one message arrives. QoS of one keeps redeliveries fair
    /// across the worker pool.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn consume_one(&self, consumer_tag: &str) -> Result<Delivery, QueueError> {
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        match consumer.next().await {
            Some(Ok(delivery)) => Ok(delivery),
            Some(Err(e)) => Err(e.into()),
            None => Err(QueueError::Closed),
        }
    }
}

pub async fn ack(delivery: &Delivery) -> Result<(), QueueError> {
    delivery.ack(BasicAckOptions::default()).await?;
    Ok(())
}

pub async fn nack(delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
    delivery
        .nack(BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        })
        .await?;
    Ok(())
}
