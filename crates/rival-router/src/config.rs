use rival_core::{DEFAULT_HOST, DEFAULT_MAX_DATA_SIZE_MIB, DEFAULT_PORT, mib_to_bytes};

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    /// Port to bind; `0` picks a free one.
    pub port: u16,
    /// Inbound message ceiling in MiB.
    pub max_data_size: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_data_size: DEFAULT_MAX_DATA_SIZE_MIB,
        }
    }
}

impl RouterConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_message_bytes(&self) -> usize {
        mib_to_bytes(self.max_data_size)
    }
}
