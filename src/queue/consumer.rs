//! AMQP queue consumer
//!
//! Owns the broker connection: declares the durable queue, limits the
//! channel to one unacknowledged delivery, hands each delivery to
//! [`dispatch`], and reconnects after a fixed delay whenever the connection
//! drops.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{ConsumerEvent, ConsumerState};
use super::{dispatch, JobHandler};
use crate::config::BrokerConfig;
use crate::core::Disposition;

const CONSUMER_TAG: &str = "eval-worker";
/// Fair dispatch: at most one unacknowledged delivery per consumer
const PREFETCH_COUNT: u16 = 1;
const REPLY_SUCCESS: u16 = 200;

/// An open connection with a registered consumer
struct Session {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl Session {
    async fn close(self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "worker shutting down").await {
            debug!("Failed to close channel: {}", e);
        }
        if let Err(e) = self
            .connection
            .close(REPLY_SUCCESS, "worker shutting down")
            .await
        {
            debug!("Failed to close connection: {}", e);
        }
    }
}

/// Why a consume cycle ended
enum ConsumeEnd {
    Stopped,
    Lost(String),
}

pub struct QueueConsumer {
    config: BrokerConfig,
    handler: Arc<dyn JobHandler>,
    state: ConsumerState,
}

impl QueueConsumer {
    pub fn new(config: BrokerConfig, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            config,
            handler,
            state: ConsumerState::Disconnected,
        }
    }

    fn advance(&mut self, event: ConsumerEvent) {
        let next = self.state.transition(event);
        if next != self.state {
            debug!("Consumer {} -> {} ({:?})", self.state, next, event);
        }
        self.state = next;
    }

    /// Run connect/consume cycles until `shutdown` is cancelled.
    ///
    /// A job that is already running is finished and settled before the
    /// shutdown is observed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut session: Option<Session> = None;
        self.advance(ConsumerEvent::Retry);

        loop {
            match self.state {
                ConsumerState::Disconnected => {
                    tokio::select! {
                        _ = shutdown.cancelled() => self.advance(ConsumerEvent::StopRequested),
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {
                            self.advance(ConsumerEvent::Retry)
                        }
                    }
                }
                ConsumerState::Connecting => {
                    let connected = tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.advance(ConsumerEvent::StopRequested);
                            continue;
                        }
                        connected = self.connect() => connected,
                    };

                    match connected {
                        Ok(active) => {
                            info!("[*] Connected. Waiting for jobs...");
                            session = Some(active);
                            self.advance(ConsumerEvent::Connected);
                        }
                        Err(e) => {
                            warn!(
                                "[!] Connection failed: {}. Reconnecting in {}s...",
                                e,
                                self.config.reconnect_delay.as_secs()
                            );
                            self.advance(ConsumerEvent::ConnectFailed);
                        }
                    }
                }
                ConsumerState::Consuming => {
                    let Some(active) = session.as_mut() else {
                        self.advance(ConsumerEvent::ConnectionLost);
                        continue;
                    };

                    match self.consume(active, &shutdown).await {
                        ConsumeEnd::Stopped => self.advance(ConsumerEvent::StopRequested),
                        ConsumeEnd::Lost(reason) => {
                            warn!(
                                "[!] Connection lost: {}. Reconnecting in {}s...",
                                reason,
                                self.config.reconnect_delay.as_secs()
                            );
                            session = None;
                            self.advance(ConsumerEvent::ConnectionLost);
                        }
                    }
                }
                ConsumerState::ShuttingDown => {
                    info!("[*] Shutting down...");
                    if let Some(active) = session.take() {
                        active.close().await;
                    }
                    return;
                }
            }
        }
    }

    fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.config.user.clone(),
                    password: self.config.password.clone(),
                },
                host: self.config.host.clone(),
                port: self.config.port,
            },
            query: AMQPQueryString {
                heartbeat: Some(self.config.heartbeat_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn connect(&self) -> Result<Session, lapin::Error> {
        debug!(
            "Connecting to amqp://{}@{}:{}",
            self.config.user, self.config.host, self.config.port
        );

        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect_uri(self.amqp_uri(), properties).await?;
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Session {
            connection,
            channel,
            consumer,
        })
    }

    /// Process deliveries one at a time until shutdown or connection loss
    async fn consume(&self, session: &mut Session, shutdown: &CancellationToken) -> ConsumeEnd {
        loop {
            let delivery = match next_unless_stopped(&mut session.consumer, shutdown).await {
                Next::Stopped => return ConsumeEnd::Stopped,
                Next::Item(Ok(delivery)) => delivery,
                Next::Item(Err(e)) => return ConsumeEnd::Lost(e.to_string()),
                Next::Closed => return ConsumeEnd::Lost("consumer stream closed".into()),
            };

            debug!(
                "Received delivery {} ({} bytes)",
                delivery.delivery_tag,
                delivery.data.len()
            );
            let disposition = dispatch(self.handler.clone(), &delivery.data).await;

            if let Err(e) = settle(&delivery, disposition).await {
                return ConsumeEnd::Lost(format!("failed to settle delivery: {}", e));
            }
        }
    }
}

enum Next<T> {
    Item(T),
    Closed,
    Stopped,
}

/// Wait for the next stream item unless shutdown was requested.
///
/// Shutdown wins when both are ready, so no new delivery starts after an
/// interrupt.
async fn next_unless_stopped<S>(stream: &mut S, shutdown: &CancellationToken) -> Next<S::Item>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Next::Stopped,
        next = stream.next() => match next {
            Some(item) => Next::Item(item),
            None => Next::Closed,
        },
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), lapin::Error> {
    match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    }
}
