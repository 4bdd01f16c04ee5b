// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Metadata Synchronization
//!
//! This module keeps declared queue attributes consistent with what the RabbitMQ
//! management API reports. Before a queue is used it is looked up over HTTP and
//! declared with the durability, exclusivity and arguments found there; queues the
//! broker does not know yet are declared with the defaults of [`QueueInfo`].

use crate::{channel::AmqpChannel, errors::AmqpError, queue::QueueInfo};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use tracing::{debug, error};

/// Prefix of broker-generated and broker-reserved queue names
pub const RESERVED_QUEUE_PREFIX: &str = "amq.";

const QUEUE_INFO_COLUMNS: &str = "columns=durable,auto_delete,exclusive,arguments";
const DEFAULT_VHOST: &str = "%2f";

/// Status and body of a management API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP access to the broker management API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Issues an authenticated GET against `url`.
    async fn get(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<ManagementResponse, AmqpError>;
}

/// reqwest implementation of the `ManagementClient` trait.
#[derive(Debug, Clone, Default)]
pub struct ReqwestManagementClient {
    client: Client,
}

impl ReqwestManagementClient {
    pub fn new(client: Client) -> ReqwestManagementClient {
        ReqwestManagementClient { client }
    }
}

#[async_trait]
impl ManagementClient for ReqwestManagementClient {
    async fn get(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<ManagementResponse, AmqpError> {
        let response = self
            .client
            .get(url)
            .basic_auth(user, Some(password))
            .send()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), url, "failure to call the management api");
                AmqpError::HttpRequestError(err.to_string())
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| {
            error!(error = err.to_string(), "failure to read management api response");
            AmqpError::HttpRequestError(err.to_string())
        })?;

        Ok(ManagementResponse { status, body })
    }
}

/// Makes sure queues exist with the attributes the broker knows about.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueApiManager: Send + Sync {
    /// Declares `queue` with its known attributes and returns the confirmed name.
    ///
    /// Reserved queue names are returned unchanged without touching the broker.
    async fn ensure_queue(&self, queue: &str) -> Result<String, AmqpError>;

    /// Looks up the declared attributes of `queue`.
    async fn get_queue_info(&self, queue: &str) -> Result<QueueInfo, AmqpError>;
}

/// RabbitMQ management API implementation of the `QueueApiManager` trait.
pub struct RabbitMQApiManager {
    url: String,
    user: String,
    password: String,
    channel: Arc<dyn AmqpChannel>,
    client: Arc<dyn ManagementClient>,
}

impl RabbitMQApiManager {
    /// Creates a new API manager.
    ///
    /// # Parameters
    /// * `url` - Base URL of the management API (e.g. `http://localhost:15672/api`)
    /// * `user` - Management API user
    /// * `password` - Management API password
    /// * `channel` - Dedicated channel used for queue declarations
    /// * `client` - HTTP client for the management API
    pub fn new(
        url: &str,
        user: &str,
        password: &str,
        channel: Arc<dyn AmqpChannel>,
        client: Arc<dyn ManagementClient>,
    ) -> RabbitMQApiManager {
        let url = if url.ends_with('/') {
            url.to_owned()
        } else {
            format!("{}/", url)
        };

        RabbitMQApiManager {
            url,
            user: user.to_owned(),
            password: password.to_owned(),
            channel,
            client,
        }
    }

    /// Management URL of `queue`, the queue name percent-encoded as a path segment.
    fn queue_url(&self, queue: &str) -> Result<String, AmqpError> {
        let mut url = Url::parse(&format!("{}queues/{}", self.url, DEFAULT_VHOST)).map_err(|err| {
            error!(error = err.to_string(), "invalid management api url");
            AmqpError::ConfigurationError(err.to_string())
        })?;

        url.path_segments_mut()
            .map_err(|_| {
                AmqpError::ConfigurationError(format!("`{}` cannot be a base url", self.url))
            })?
            .push(queue);
        url.set_query(Some(QUEUE_INFO_COLUMNS));

        Ok(url.to_string())
    }
}

#[async_trait]
impl QueueApiManager for RabbitMQApiManager {
    async fn ensure_queue(&self, queue: &str) -> Result<String, AmqpError> {
        if queue.starts_with(RESERVED_QUEUE_PREFIX) {
            return Ok(queue.to_owned());
        }

        let info = self.get_queue_info(queue).await?;
        self.channel.queue_declare(queue, &info).await
    }

    async fn get_queue_info(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        let response = self
            .client
            .get(&self.queue_url(queue)?, &self.user, &self.password)
            .await?;

        match StatusCode::from_u16(response.status) {
            Ok(StatusCode::OK) => serde_json::from_str(&response.body).map_err(|err| {
                error!(error = err.to_string(), queue, "invalid queue info received");
                AmqpError::ParsePayloadError(err.to_string())
            }),
            Ok(StatusCode::NOT_FOUND) => {
                debug!("queue: {} not found, using default attributes", queue);
                Ok(QueueInfo::default())
            }
            _ => {
                error!(
                    status = response.status,
                    body = response.body.as_str(),
                    "unexpected management api response"
                );
                Err(AmqpError::HttpProtocolError {
                    status: response.status,
                    body: response.body,
                })
            }
        }
    }
}
