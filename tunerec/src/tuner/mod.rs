//! Tuner source contract and HTTP-backed client.
//!
//! The tuner server is an external collaborator: it enumerates the physical
//! devices with the channel types each can receive, and serves a live
//! byte-stream per program. Its multiplex semantics are what make sharing a
//! tuned carrier between services valid in the scheduler.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tunerec_protocol::{ChannelType, Program};

/// Tuner source errors.
#[derive(Debug, Error)]
pub enum TunerError {
    #[error("Tuner server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tuner server rejected stream open: HTTP {0}")]
    StreamRejected(u16),

    #[error("Tuner source unavailable: {0}")]
    Unavailable(String),
}

/// A physical tuner device as advertised by the tuner server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerDevice {
    pub name: String,
    /// Channel types this device can receive.
    pub types: Vec<ChannelType>,
}

/// A live program byte-stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TunerError>> + Send>>;

/// Tuner server operations the core needs.
#[async_trait]
pub trait TunerSource: Send + Sync {
    /// Enumerate tuner devices in their fixed physical order.
    async fn devices(&self) -> Result<Vec<TunerDevice>, TunerError>;

    /// Open a live byte-stream for a program. The priority hint tells the
    /// tuner server how reluctant it should be to steal this tuning for
    /// another client.
    async fn open_stream(&self, program: &Program, priority: u8) -> Result<ByteStream, TunerError>;
}

/// HTTP tuner server client.
///
/// Endpoints: `GET /api/tuners` (device list as JSON) and
/// `GET /api/programs/{id}/stream` with an `X-Tuner-Priority` header.
#[derive(Debug, Clone)]
pub struct HttpTunerSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTunerSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TunerSource for HttpTunerSource {
    async fn devices(&self) -> Result<Vec<TunerDevice>, TunerError> {
        let url = format!("{}/api/tuners", self.base_url);
        let devices: Vec<TunerDevice> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Tuner server reports {} devices", devices.len());
        Ok(devices)
    }

    async fn open_stream(&self, program: &Program, priority: u8) -> Result<ByteStream, TunerError> {
        let url = format!("{}/api/programs/{}/stream", self.base_url, program.id);
        let resp = self
            .client
            .get(&url)
            .header("X-Tuner-Priority", priority.to_string())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TunerError::StreamRejected(resp.status().as_u16()));
        }

        Ok(Box::pin(resp.bytes_stream().map_err(TunerError::Http)))
    }
}
