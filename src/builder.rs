// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Builder
//!
//! The builder owns the single broker connection of the runtime and wires every
//! other component on top of it. The connection is opened lazily on the first
//! channel request; each publisher, consumer and the queue API manager get a
//! dedicated channel of their own.
//!
//! It also holds the routing table, the queue to message type map used to turn
//! inbound payloads into typed messages.

use crate::{
    api_manager::{ManagementClient, QueueApiManager, RabbitMQApiManager, ReqwestManagementClient},
    channel::{AmqpChannel, AmqpConnection, ConnectionFactory, LapinConnectionFactory},
    config::{MessageBroker, MessagingConfig},
    consumer::{Consumer, RabbitMQConsumer},
    errors::AmqpError,
    message::{Message, MessageType},
    processor::MiddlewareChain,
    publisher::{Publisher, RabbitMQPublisher},
    serializer::{JsonSerializer, Serializer},
};
use async_trait::async_trait;
use reqwest::Url;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info};

const DEFAULT_API_USER: &str = "guest";
const DEFAULT_API_PASSWORD: &str = "guest";

/// Queue name to expected message type.
pub struct RoutingTable {
    entries: RwLock<HashMap<String, MessageType>>,
    serializer: Arc<dyn Serializer>,
}

impl RoutingTable {
    pub fn new(serializer: Arc<dyn Serializer>) -> RoutingTable {
        RoutingTable {
            entries: RwLock::new(HashMap::new()),
            serializer,
        }
    }

    /// Maps `queue` to `message_type`, replacing any previous entry.
    pub fn map(&self, queue: &str, message_type: MessageType) -> Result<(), AmqpError> {
        let mut entries = self.entries.write().map_err(|_| {
            error!("routing table lock poisoned");
            AmqpError::InternalError
        })?;

        entries.insert(queue.to_owned(), message_type);
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Result<Option<MessageType>, AmqpError> {
        let entries = self.entries.read().map_err(|_| {
            error!("routing table lock poisoned");
            AmqpError::InternalError
        })?;

        Ok(entries.get(queue).cloned())
    }

    /// Materializes `data` received on `queue` into a message of the mapped type.
    pub fn build_message(&self, queue: &str, version: u32, data: &[u8]) -> Result<Message, AmqpError> {
        let Some(message_type) = self.get(queue)? else {
            error!(queue, "no message type registered for queue");
            return Err(AmqpError::NotFoundError(queue.to_owned()));
        };

        debug!(
            "building {} message for queue: {}, version: {}",
            message_type.name(),
            queue,
            version
        );
        self.serializer.deserialize(&message_type, data)
    }
}

/// Factory of the messaging components.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Builder: Send + Sync {
    fn routing_table(&self) -> Arc<RoutingTable>;

    fn build_serializer(&self) -> Arc<dyn Serializer>;

    /// See [`RoutingTable::build_message`].
    fn build_message(&self, queue: &str, version: u32, data: &[u8]) -> Result<Message, AmqpError>;

    /// Publisher on a new channel.
    async fn build_publisher(&self) -> Result<Arc<dyn Publisher>, AmqpError>;

    /// Consumer on a new channel, with a publisher sharing that channel for replies.
    async fn build_consumer(&self) -> Result<Box<dyn Consumer>, AmqpError>;

    /// Shared queue API manager, created on first use.
    async fn build_api_manager(&self) -> Result<Arc<dyn QueueApiManager>, AmqpError>;

    /// Closes the broker connection. Later calls do nothing.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Returns the builder of the configured broker kind.
pub fn new_builder(
    config: MessagingConfig,
    middleware: MiddlewareChain,
) -> Result<Arc<dyn Builder>, AmqpError> {
    config.validate()?;

    match config.message_broker {
        MessageBroker::RabbitMq => Ok(Arc::new(RabbitMQBuilder::new(config, middleware))),
    }
}

/// RabbitMQ implementation of the Builder trait.
pub struct RabbitMQBuilder {
    config: MessagingConfig,
    factory: Arc<dyn ConnectionFactory>,
    client: Arc<dyn ManagementClient>,
    connection: Mutex<Option<Arc<dyn AmqpConnection>>>,
    api_manager: OnceCell<Arc<dyn QueueApiManager>>,
    routing: Arc<RoutingTable>,
    serializer: Arc<dyn Serializer>,
    middleware: MiddlewareChain,
    closed: AtomicBool,
}

impl RabbitMQBuilder {
    /// Creates a builder connecting through lapin and the reqwest management client.
    pub fn new(config: MessagingConfig, middleware: MiddlewareChain) -> RabbitMQBuilder {
        let factory = Arc::new(LapinConnectionFactory::new(
            &config.message_broker_url,
            &config.message_broker_connection_name,
        ));

        RabbitMQBuilder::with_parts(
            config,
            factory,
            Arc::new(ReqwestManagementClient::default()),
            Arc::new(JsonSerializer),
            middleware,
        )
    }

    /// Creates a builder from explicit collaborators.
    pub fn with_parts(
        config: MessagingConfig,
        factory: Arc<dyn ConnectionFactory>,
        client: Arc<dyn ManagementClient>,
        serializer: Arc<dyn Serializer>,
        middleware: MiddlewareChain,
    ) -> RabbitMQBuilder {
        RabbitMQBuilder {
            config,
            factory,
            client,
            connection: Mutex::new(None),
            api_manager: OnceCell::new(),
            routing: Arc::new(RoutingTable::new(serializer.clone())),
            serializer,
            middleware,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens a channel, connecting first if needed.
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut connection = self.connection.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            error!("builder already closed");
            return Err(AmqpError::ConnectionError);
        }

        let conn = match connection.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                info!("opening broker connection");
                let conn = self.factory.connect().await?;
                *connection = Some(conn.clone());
                conn
            }
        };
        drop(connection);

        conn.create_channel().await
    }

    fn publisher_on(
        &self,
        channel: Arc<dyn AmqpChannel>,
        manager: Arc<dyn QueueApiManager>,
    ) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::new(
            channel,
            self.serializer.clone(),
            manager,
            self.middleware.clone(),
        )
    }
}

/// Extracts the user and password embedded in a management API URL.
///
/// Returns the URL stripped of its credentials along with them; missing parts
/// default to `guest`.
pub fn api_credentials(api_url: &str) -> Result<(String, String, String), AmqpError> {
    let mut url = Url::parse(api_url).map_err(|err| {
        error!(error = err.to_string(), "invalid management api url");
        AmqpError::ConfigurationError(err.to_string())
    })?;

    let user = match url.username() {
        "" => DEFAULT_API_USER.to_owned(),
        user => user.to_owned(),
    };
    let password = url
        .password()
        .unwrap_or(DEFAULT_API_PASSWORD)
        .to_owned();

    let _ = url.set_username("");
    let _ = url.set_password(None);

    Ok((url.to_string(), user, password))
}

#[async_trait]
impl Builder for RabbitMQBuilder {
    fn routing_table(&self) -> Arc<RoutingTable> {
        self.routing.clone()
    }

    fn build_serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    fn build_message(&self, queue: &str, version: u32, data: &[u8]) -> Result<Message, AmqpError> {
        self.routing.build_message(queue, version, data)
    }

    async fn build_publisher(&self) -> Result<Arc<dyn Publisher>, AmqpError> {
        let manager = self.build_api_manager().await?;
        let channel = self.channel().await?;
        Ok(self.publisher_on(channel, manager))
    }

    async fn build_consumer(&self) -> Result<Box<dyn Consumer>, AmqpError> {
        let manager = self.build_api_manager().await?;
        let channel = self.channel().await?;
        let publisher = self.publisher_on(channel.clone(), manager.clone());

        Ok(Box::new(RabbitMQConsumer::new(
            channel,
            publisher,
            self.routing.clone(),
            manager,
            self.middleware.clone(),
        )))
    }

    async fn build_api_manager(&self) -> Result<Arc<dyn QueueApiManager>, AmqpError> {
        self.api_manager
            .get_or_try_init(|| async {
                let (url, user, password) = api_credentials(&self.config.message_broker_api_url)?;
                let channel = self.channel().await?;

                debug!("queue api manager created for: {}", url);
                let manager: Arc<dyn QueueApiManager> = Arc::new(RabbitMQApiManager::new(
                    &url,
                    &user,
                    &password,
                    channel,
                    self.client.clone(),
                ));
                Ok::<_, AmqpError>(manager)
            })
            .await
            .cloned()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        info!("closing broker connection");
        connection.close().await
    }
}
