use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Build a `zenoh::Config` from the bridge's connectivity settings.
pub fn build_zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut zenoh_config = zenoh::Config::default();

    let mode = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(Error::Config(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };

    zenoh_config
        .insert_json5("mode", &mode)
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    if !config.connect.is_empty() {
        let endpoints = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints)
            .map_err(|e| Error::Config(format!("Failed to set connect endpoints: {}", e)))?;
    }

    if !config.listen.is_empty() {
        let endpoints = serde_json::to_string(&config.listen)?;
        zenoh_config
            .insert_json5("listen/endpoints", &endpoints)
            .map_err(|e| Error::Config(format!("Failed to set listen endpoints: {}", e)))?;
    }

    Ok(zenoh_config)
}

/// Open the process-wide Zenoh session used as the message bus.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = build_zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_mode() {
        let config = ZenohConfig {
            mode: "broker".to_string(),
            ..Default::default()
        };
        let err = build_zenoh_config(&config).unwrap_err();
        assert!(err.to_string().contains("broker"));
    }

    #[test]
    fn test_accepts_client_with_endpoints() {
        let config = ZenohConfig {
            mode: "client".to_string(),
            connect: vec!["tcp/127.0.0.1:7447".to_string()],
            listen: Vec::new(),
        };
        assert!(build_zenoh_config(&config).is_ok());
    }
}
