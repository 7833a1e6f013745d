//! Version information for taskbridge.

/// taskbridge version from Cargo.toml
pub const TASKBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol revision advertised by the method dispatcher during `initialize`.
pub const RPC_PROTOCOL_VERSION: &str = "2024-11-05";

/// Server identity reported by `/health-check` and `initialize`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: &'static str,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            name: "taskbridge".to_string(),
            version: TASKBRIDGE_VERSION,
            protocol_version: RPC_PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the advertised server name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
