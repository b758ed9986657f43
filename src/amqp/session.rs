//! [`Session`] on top of a [`lapin::Channel`].
use crate::{
    error::ProtocolError,
    transport::{Acker, Delivery, DeliveryStream, Session},
};
use amq_protocol_types::FieldTable;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    Channel,
};
use tracing::debug;

pub(super) struct AmqpSession {
    channel: Channel,
}

impl AmqpSession {
    pub(super) fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl Session for AmqpSession {
    async fn declare_queue(&self, queue_name: &str) -> Result<(), ProtocolError> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| match e {
                // The broker closes the channel with PRECONDITION_FAILED when properties differ.
                lapin::Error::ProtocolError(amqp_error) => ProtocolError::PreconditionFailed {
                    queue: queue_name.to_owned(),
                    reason: amqp_error.to_string(),
                },
                e => e.into(),
            })?;
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), ProtocolError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ProtocolError> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        let stream = consumer.map(|event| {
            event.map_err(ProtocolError::from).map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.redelivered,
                    delivery.data,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ProtocolError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Consumer stopped").await {
                debug!(error = %e, "Failed to close RabbitMQ channel");
            }
        }
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), ProtocolError> {
        // Never `multiple`: acknowledging one delivery must not settle the others in flight.
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), ProtocolError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
