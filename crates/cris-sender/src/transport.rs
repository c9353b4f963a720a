//! Transports carry one wire command to an endpoint and bring the envelope
//! back.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use cris_core::{CrisCallResult, CrisService, RequestContext};
use serde_json::Value;

use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, wire: &Value) -> Result<CrisCallResult, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, wire: &Value) -> Result<CrisCallResult, TransportError> {
        (**self).send(wire).await
    }
}

/// In-process transport bound to a [`CrisService`].
///
/// Goes through the same bytes as a remote call: the command is serialized,
/// handled under the session's identity and culture, and the envelope is
/// parsed back from JSON.
pub struct LocalTransport {
    service: Arc<CrisService>,
    session: RwLock<RequestContext>,
}

impl LocalTransport {
    pub fn new(service: Arc<CrisService>, session: RequestContext) -> Self {
        Self {
            service,
            session: RwLock::new(session),
        }
    }

    pub fn session(&self) -> RequestContext {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the session used for later requests.
    pub fn set_session(&self, session: RequestContext) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, wire: &Value) -> Result<CrisCallResult, TransportError> {
        let payload = serde_json::to_vec(wire).map_err(|e| TransportError::Encoding(e.to_string()))?;
        let session = self.session();
        let response = self.service.handle_request(&payload, &session).await;
        let body = serde_json::to_vec(&response.result)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}
