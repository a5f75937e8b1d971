use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Path to the browser client's static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Access-Control-Allow-Origin value for streaming/API endpoints
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// First scid to probe when allocating a reverse-forward tunnel
    #[serde(default = "default_scid_start")]
    pub scid_start: u32,
    /// Number of sequential scids to try before giving up
    #[serde(default = "default_scid_attempts")]
    pub scid_attempts: u32,
    /// Path (on-host) to the on-device server artifact to push over ADB
    #[serde(default = "default_server_artifact")]
    pub server_artifact: String,
    /// Seconds to wait for the on-device server to accept all three sockets
    #[serde(default = "default_handshake_deadline_secs")]
    pub handshake_deadline_secs: u64,
    /// Path to the `adb` binary
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum accepted size of one video packet, in bytes
    #[serde(default = "default_max_video_packet")]
    pub max_video_packet_bytes: u32,
    /// Maximum accepted size of one audio packet, in bytes
    #[serde(default = "default_max_audio_packet")]
    pub max_audio_packet_bytes: u32,
    /// Per-subscriber sample queue depth for structured (fMP4/WebM) consumers
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_depth: usize,
    /// Per-subscriber queue depth for raw byte broadcasters (e.g. chunked H.264)
    #[serde(default = "default_byte_queue")]
    pub byte_queue_depth: usize,
    /// fMP4 batched-fragment aggregator flush window, in milliseconds
    #[serde(default = "default_aggregator_window_ms")]
    pub aggregator_window_ms: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            web_root: default_web_root(),
            cors_origin: default_cors_origin(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            scid_start: default_scid_start(),
            scid_attempts: default_scid_attempts(),
            server_artifact: default_server_artifact(),
            handshake_deadline_secs: default_handshake_deadline_secs(),
            adb_path: default_adb_path(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_video_packet_bytes: default_max_video_packet(),
            max_audio_packet_bytes: default_max_audio_packet(),
            subscriber_queue_depth: default_subscriber_queue(),
            byte_queue_depth: default_byte_queue(),
            aggregator_window_ms: default_aggregator_window_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!(
                        "ERROR: tls_cert '{}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes",
                        cert
                    ));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!(
                        "ERROR: tls_key '{}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes",
                        key
                    ));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.device.scid_attempts == 0 {
            issues.push("ERROR: device.scid_attempts must be >= 1.".to_string());
        }
        if self.device.scid_start == 0 {
            issues.push(
                "WARNING: device.scid_start is 0; scid 0 may collide with a default on-device value."
                    .to_string(),
            );
        }
        if self.device.handshake_deadline_secs == 0 {
            issues.push("ERROR: device.handshake_deadline_secs must be >= 1.".to_string());
        } else if self.device.handshake_deadline_secs > 120 {
            issues.push(format!(
                "WARNING: device.handshake_deadline_secs is {}s — unusually long; \
                 a stuck handshake will hold the device slot for this long before failing.",
                self.device.handshake_deadline_secs
            ));
        }

        if self.stream.max_video_packet_bytes == 0 {
            issues.push("ERROR: stream.max_video_packet_bytes must be >= 1.".to_string());
        }
        if self.stream.max_audio_packet_bytes == 0 {
            issues.push("ERROR: stream.max_audio_packet_bytes must be >= 1.".to_string());
        }
        if self.stream.subscriber_queue_depth == 0 {
            issues.push("ERROR: stream.subscriber_queue_depth must be >= 1.".to_string());
        }
        if self.stream.byte_queue_depth == 0 {
            issues.push("ERROR: stream.byte_queue_depth must be >= 1.".to_string());
        }
        if self.stream.aggregator_window_ms == 0 {
            issues.push(
                "WARNING: stream.aggregator_window_ms is 0; every sample flushes its own \
                 fragment, defeating the point of batching."
                    .to_string(),
            );
        } else if self.stream.aggregator_window_ms > 1000 {
            issues.push(format!(
                "WARNING: stream.aggregator_window_ms is {}ms — this will add visible latency \
                 to fMP4/MSE playback.",
                self.stream.aggregator_window_ms
            ));
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_scid_start() -> u32 {
    0x1000
}
fn default_scid_attempts() -> u32 {
    16
}
fn default_server_artifact() -> String {
    "server/bridge-server.jar".to_string()
}
fn default_handshake_deadline_secs() -> u64 {
    20
}
fn default_adb_path() -> String {
    "adb".to_string()
}
fn default_max_video_packet() -> u32 {
    10 * 1024 * 1024
}
fn default_max_audio_packet() -> u32 {
    1024 * 1024
}
fn default_subscriber_queue() -> usize {
    100
}
fn default_byte_queue() -> usize {
    1000
}
fn default_aggregator_window_ms() -> u64 {
    150
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: BridgeConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());
        assert_eq!(config.server.web_root, "web/dist");

        assert_eq!(config.device.scid_start, 0x1000);
        assert_eq!(config.device.scid_attempts, 16);
        assert_eq!(config.device.handshake_deadline_secs, 20);
        assert_eq!(config.device.adb_path, "adb");

        assert_eq!(config.stream.max_video_packet_bytes, 10 * 1024 * 1024);
        assert_eq!(config.stream.max_audio_packet_bytes, 1024 * 1024);
        assert_eq!(config.stream.subscriber_queue_depth, 100);
        assert_eq!(config.stream.byte_queue_depth, 1000);
        assert_eq!(config.stream.aggregator_window_ms, 150);

        assert_eq!(
            config.ice.stun_urls,
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
            ]
        );
        assert!(config.ice.turn_urls.is_empty());
    }

    #[test]
    fn partial_config_only_stream_section() {
        let toml_str = r#"
[stream]
max_video_packet_bytes = 4096
"#;
        let config: BridgeConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.stream.max_video_packet_bytes, 4096);
        assert_eq!(config.stream.max_audio_packet_bytes, 1024 * 1024);
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.device.scid_attempts, 16);
    }

    #[test]
    fn default_trait_matches_toml_defaults() {
        let from_toml: BridgeConfig = toml::from_str("").expect("default config");

        let server = ServerConfig::default();
        assert_eq!(server.bind, from_toml.server.bind);
        assert_eq!(server.port, from_toml.server.port);

        let device = DeviceConfig::default();
        assert_eq!(device.scid_start, from_toml.device.scid_start);
        assert_eq!(device.scid_attempts, from_toml.device.scid_attempts);

        let stream = StreamConfig::default();
        assert_eq!(
            stream.subscriber_queue_depth,
            from_toml.stream.subscriber_queue_depth
        );

        let ice = IceConfig::default();
        assert_eq!(ice.stun_urls, from_toml.ice.stun_urls);
    }

    fn valid_config() -> BridgeConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &BridgeConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_tls_cert_missing_file_is_error() {
        let mut config = valid_config();
        config.server.tls_cert = Some("/nonexistent/cert.pem".to_string());
        config.server.tls_key = Some("/nonexistent/key.pem".to_string());
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "tls_cert"));
        assert!(has_error(&issues, "tls_key"));
    }

    #[test]
    fn validate_scid_attempts_zero_is_error() {
        let mut config = valid_config();
        config.device.scid_attempts = 0;
        assert!(has_error(&validate_issues(&config), "scid_attempts"));
    }

    #[test]
    fn validate_handshake_deadline_zero_is_error() {
        let mut config = valid_config();
        config.device.handshake_deadline_secs = 0;
        assert!(has_error(&validate_issues(&config), "handshake_deadline_secs"));
    }

    #[test]
    fn validate_handshake_deadline_long_is_warning_not_error() {
        let mut config = valid_config();
        config.device.handshake_deadline_secs = 300;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "handshake_deadline_secs"));
        assert!(!has_error(&issues, "handshake_deadline_secs"));
    }

    #[test]
    fn validate_queue_depth_zero_is_error() {
        let mut config = valid_config();
        config.stream.subscriber_queue_depth = 0;
        assert!(has_error(&validate_issues(&config), "subscriber_queue_depth"));
    }

    #[test]
    fn validate_aggregator_window_zero_is_warning() {
        let mut config = valid_config();
        config.stream.aggregator_window_ms = 0;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "aggregator_window_ms"));
        assert!(!has_error(&issues, "aggregator_window_ms"));
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.turn_urls = vec!["http://turn.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "TURN URL"));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.port = 0;
        config.device.scid_attempts = 0;
        config.stream.max_video_packet_bytes = 0;
        let issues = validate_issues(&config);
        assert!(issues.len() >= 3, "got {:?}", issues);
    }
}
