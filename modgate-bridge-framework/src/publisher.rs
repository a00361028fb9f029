//! Raw payload publisher for Zenoh.

use std::sync::Arc;

use modgate_common::keyexpr;

use crate::error::{BridgeError, Result};

/// Publisher bound to a key prefix.
///
/// Cheap to clone; all clones share the same Zenoh session.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    key_prefix: String,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
        }
    }

    /// Get the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Build a full key expression from a suffix.
    pub fn build_key(&self, suffix: &str) -> String {
        keyexpr::join(&self.key_prefix, suffix)
    }

    /// Publish bytes below the prefix.
    pub async fn publish(&self, key_suffix: &str, payload: Vec<u8>) -> Result<()> {
        let key = self.build_key(key_suffix);
        self.publish_raw(&key, payload).await
    }

    /// Publish raw bytes to a full key.
    pub async fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Publish a JSON value to a full key.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}
