use serde::{Deserialize, Serialize};

/// Transport selector. Only TCP is built in; the variant exists so
/// configuration stays forward-compatible with alternate providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Tcp,
}

/// Whether the provider dials out or accepts inbound peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Client,
    Listen,
}

/// One provider entry from configuration:
/// `{"type": "tcp", "host": ..., "port": ..., "mode": "client"|"listen"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub host: String,
    pub port: u16,
    pub mode: ProviderMode,
    /// Client connections re-dial lost peers by default.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_entry() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"type": "tcp", "host": "127.0.0.1", "port": 9201, "mode": "client"}"#,
        )
        .unwrap();
        assert_eq!(config.kind, ProviderKind::Tcp);
        assert_eq!(config.mode, ProviderMode::Client);
        assert_eq!(config.port, 9201);
        assert!(config.reconnect, "client entries reconnect by default");
    }

    #[test]
    fn parses_listen_entry_with_reconnect_override() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"type": "tcp", "host": "0.0.0.0", "port": 9201, "mode": "listen", "reconnect": false}"#,
        )
        .unwrap();
        assert_eq!(config.mode, ProviderMode::Listen);
        assert!(!config.reconnect);
    }

    #[test]
    fn rejects_unknown_transport() {
        let err = serde_json::from_str::<ProviderConfig>(
            r#"{"type": "mqtt", "host": "h", "port": 1, "mode": "client"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }
}
