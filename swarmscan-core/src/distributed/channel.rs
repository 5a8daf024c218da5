//! Transport seam between participants.
//!
//! The engine only sees [`Connector`] and [`Channel`]. [`LocalConnector`]
//! routes calls to instances living in the same process, pushing every
//! envelope and response through JSON so nothing crosses by reference.

use super::messages::{Envelope, ParticipantInfo, Request, Response};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait Channel: Send + Sync {
    async fn call(&self, envelope: Envelope) -> Result<Response>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &ParticipantInfo) -> Result<Arc<dyn Channel>>;
}

/// Inbound side of a participant.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Response;
}

/// Send `request` and turn refusals into errors.
pub async fn invoke(channel: &dyn Channel, token: &str, request: Request) -> Result<Response> {
    let call = request.name();
    match channel.call(Envelope::new(token, request)).await? {
        Response::Unauthorized => Err(EngineError::Rejected {
            call,
            reason: "unauthorized".to_string(),
        }),
        Response::Rejected(reason) => Err(EngineError::Rejected { call, reason }),
        response => Ok(response),
    }
}

type Registry = Arc<RwLock<HashMap<String, Weak<dyn Handler>>>>;

#[derive(Clone, Default)]
pub struct LocalConnector {
    registry: Registry,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, url: &str, handler: &Arc<dyn Handler>) {
        self.registry
            .write()
            .await
            .insert(url.to_string(), Arc::downgrade(handler));
    }

    pub async fn unregister(&self, url: &str) {
        self.registry.write().await.remove(url);
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, info: &ParticipantInfo) -> Result<Arc<dyn Channel>> {
        if !self.registry.read().await.contains_key(&info.url) {
            return Err(EngineError::Channel(format!(
                "no participant listening at {}",
                info.url
            )));
        }
        Ok(Arc::new(LocalChannel {
            url: info.url.clone(),
            registry: self.registry.clone(),
        }))
    }
}

struct LocalChannel {
    url: String,
    registry: Registry,
}

#[async_trait]
impl Channel for LocalChannel {
    async fn call(&self, envelope: Envelope) -> Result<Response> {
        let handler = self
            .registry
            .read()
            .await
            .get(&self.url)
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::Channel(format!("{} is unreachable", self.url)))?;

        debug!("-> {} {}", self.url, envelope.request.name());
        let wire = serde_json::to_vec(&envelope)?;
        let response = handler.handle(serde_json::from_slice(&wire)?).await;
        let wire = serde_json::to_vec(&response)?;
        Ok(serde_json::from_slice(&wire)?)
    }
}
