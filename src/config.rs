use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Credentials guarding the `/admin` routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub backlog_size: u32,

    // Thread configuration
    pub worker_pool_size: usize,
    pub runtime_threads: usize,

    // HTTP configuration
    /// How long an exchange nobody responded to is held before the
    /// connection is dropped
    pub request_timeout: Duration,
    pub max_request_size: usize,

    pub admin: Option<AdminCredentials>,
    /// Origins the API answers with CORS headers ("*" allows any)
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 3000,
            backlog_size: 1024,

            worker_pool_size: 4,
            runtime_threads: num_cpus::get(),

            request_timeout: Duration::from_secs(30),
            max_request_size: 1024 * 1024, // 1 MB

            admin: None,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the number of CPU pool workers
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set how long an unanswered exchange is held open
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    pub fn with_admin(mut self, username: &str, password: &str) -> Self {
        self.admin = Some(AdminCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn with_cors_origins(mut self, origins: &[&str]) -> Self {
        self.cors_allowed_origins = origins.iter().map(|o| o.to_string()).collect();
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        if self.worker_pool_size == 0 {
            return Err(ServerError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.runtime_threads == 0 {
            return Err(ServerError::Config(
                "runtime_threads must be at least 1".to_string(),
            ));
        }
        if self.max_request_size == 0 {
            return Err(ServerError::Config(
                "max_request_size must be positive".to_string(),
            ));
        }
        if let Some(admin) = &self.admin {
            if admin.username.is_empty() || admin.username.contains(':') {
                return Err(ServerError::Config(
                    "admin username must be non-empty and must not contain ':'".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
