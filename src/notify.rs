//! Downstream order status callback
//!
//! After an order event is consumed, the orders service is told the order
//! was notified: `PATCH <base>/{order_id}/status?new_status=notified`. The
//! call is idempotent, so a redelivered event may safely repeat it.

use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Status value written by the callback
pub const NOTIFIED_STATUS: &str = "notified";

/// Status callback failures; all of them are soft for the consumer
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid orders service URL '{0}'")]
    InvalidBaseUrl(String),
    #[error("orders service answered {status}")]
    UnexpectedStatus { status: u16 },
    #[error("orders service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
}

/// Marks orders as notified in the downstream service
#[async_trait::async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn mark_notified(&self, order_id: &str) -> Result<(), NotifyError>;
}

/// HTTP implementation against the orders service
#[derive(Debug, Clone)]
pub struct HttpStatusNotifier {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpStatusNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let base_url =
            Url::parse(base_url).map_err(|_| NotifyError::InvalidBaseUrl(base_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(NotifyError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// `<base>/{order_id}/status?new_status=notified`
    pub fn status_url(&self, order_id: &str) -> Result<Url, NotifyError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| NotifyError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(order_id)
            .push("status");
        url.query_pairs_mut()
            .clear()
            .append_pair("new_status", NOTIFIED_STATUS);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl StatusNotifier for HttpStatusNotifier {
    async fn mark_notified(&self, order_id: &str) -> Result<(), NotifyError> {
        let url = self.status_url(order_id)?;
        debug!(order_id, "Updating order status to notified");

        let response = self.client.patch(url).send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout(self.timeout)
            } else {
                NotifyError::Request(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(NotifyError::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }
}
