use serde::Serialize;
use uuid::Uuid;

/// SDK type reported to the server.
pub const SDK_TYPE: &str = "statsig-core-rust";
/// SDK version reported to the server.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Information about the running SDK, attached to every event batch as `statsigMetadata`.
///
/// A new session ID is generated for each SDK instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigMetadata {
    pub sdk_type: String,
    pub sdk_version: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub os: String,
    pub arch: String,
    pub language_version: String,
}

impl StatsigMetadata {
    pub fn new() -> StatsigMetadata {
        StatsigMetadata {
            sdk_type: SDK_TYPE.to_owned(),
            sdk_version: SDK_VERSION.to_owned(),
            session_id: Uuid::new_v4().to_string(),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            language_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or("unknown")
                .to_owned(),
        }
    }
}

impl Default for StatsigMetadata {
    fn default() -> StatsigMetadata {
        StatsigMetadata::new()
    }
}
