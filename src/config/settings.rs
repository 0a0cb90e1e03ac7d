use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub connection: ConnectionSettings,
    pub shutdown: ShutdownSettings,
    pub security: SecuritySettings,
    pub logging: LoggingSettings,
}

/// Where the WebSocket and admin HTTP listeners bind.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub admin_port: u16,
}

/// Queue and history sizing for the broker core.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Capacity of every connection's outbound queue.
    pub max_queue_size: usize,
    /// Number of envelopes each topic keeps for replay.
    pub replay_buffer_size: usize,
    /// Delay between marking a slow consumer and closing it.
    pub slow_consumer_grace_ms: u64,
}

/// Per-connection heartbeat, deadlines and frame limits.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub ping_interval_secs: u64,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub max_message_size: usize,
}

/// Timings of the drain protocol.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ShutdownSettings {
    pub poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub unregister_timeout_ms: u64,
}

/// Boundary checks applied at the WebSocket handshake and the admin API.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SecuritySettings {
    /// Shared key expected in `X-API-Key`. `None` disables the check.
    pub api_key: Option<String>,
    /// Origins allowed to open a WebSocket. `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl BrokerSettings {
    pub fn slow_consumer_grace(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_grace_ms)
    }
}

impl ConnectionSettings {
    /// Heartbeat period; `0` is treated as one second.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

impl ShutdownSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_millis(self.unregister_timeout_ms)
    }
}

impl SecuritySettings {
    /// Whether a handshake carrying `origin` may proceed. Requests without an
    /// `Origin` header (non-browser clients) are always allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    /// Whether the presented key satisfies the configured one.
    pub fn key_matches(&self, presented: Option<&str>) -> bool {
        match self.api_key.as_deref() {
            None | Some("") => true,
            Some(expected) => presented == Some(expected),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub shutdown: Option<PartialShutdownSettings>,
    pub security: Option<PartialSecuritySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_queue_size: Option<usize>,
    pub replay_buffer_size: Option<usize>,
    pub slow_consumer_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConnectionSettings {
    pub ping_interval_secs: Option<u64>,
    pub pong_wait_secs: Option<u64>,
    pub write_wait_secs: Option<u64>,
    pub max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialShutdownSettings {
    pub poll_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub unregister_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSecuritySettings {
    pub api_key: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl PartialSettings {
    /// Merge with defaults, section by section.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let connection = self.connection.unwrap_or_default();
        let shutdown = self.shutdown.unwrap_or_default();
        let security = self.security.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                admin_port: server.admin_port.unwrap_or(default.server.admin_port),
            },
            broker: BrokerSettings {
                max_queue_size: broker
                    .max_queue_size
                    .unwrap_or(default.broker.max_queue_size),
                replay_buffer_size: broker
                    .replay_buffer_size
                    .unwrap_or(default.broker.replay_buffer_size),
                slow_consumer_grace_ms: broker
                    .slow_consumer_grace_ms
                    .unwrap_or(default.broker.slow_consumer_grace_ms),
            },
            connection: ConnectionSettings {
                ping_interval_secs: connection
                    .ping_interval_secs
                    .unwrap_or(default.connection.ping_interval_secs),
                pong_wait_secs: connection
                    .pong_wait_secs
                    .unwrap_or(default.connection.pong_wait_secs),
                write_wait_secs: connection
                    .write_wait_secs
                    .unwrap_or(default.connection.write_wait_secs),
                max_message_size: connection
                    .max_message_size
                    .unwrap_or(default.connection.max_message_size),
            },
            shutdown: ShutdownSettings {
                poll_interval_ms: shutdown
                    .poll_interval_ms
                    .unwrap_or(default.shutdown.poll_interval_ms),
                drain_timeout_ms: shutdown
                    .drain_timeout_ms
                    .unwrap_or(default.shutdown.drain_timeout_ms),
                unregister_timeout_ms: shutdown
                    .unregister_timeout_ms
                    .unwrap_or(default.shutdown.unregister_timeout_ms),
            },
            security: SecuritySettings {
                api_key: security.api_key.or(default.security.api_key),
                allowed_origins: security
                    .allowed_origins
                    .unwrap_or(default.security.allowed_origins),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
                format: logging.format.unwrap_or(default.logging.format),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                admin_port: 8081,
            },
            broker: BrokerSettings {
                max_queue_size: 100,
                replay_buffer_size: 100,
                slow_consumer_grace_ms: 100,
            },
            connection: ConnectionSettings {
                ping_interval_secs: 54,
                pong_wait_secs: 60,
                write_wait_secs: 10,
                max_message_size: 1024 * 1024,
            },
            shutdown: ShutdownSettings {
                poll_interval_ms: 100,
                drain_timeout_ms: 5000,
                unregister_timeout_ms: 1000,
            },
            security: SecuritySettings {
                api_key: None,
                allowed_origins: vec!["*".to_string()],
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}
