use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Delay before reconnecting after a link failure. `None` disables
    /// automatic reconnection.
    pub auto_reconnect_delay: Option<Duration>,
    /// Append EXEC to a pipeline whose MULTI was never closed.
    pub auto_close_transactions: bool,
    /// Number of connections when used through a `Pool`.
    pub pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            auto_reconnect_delay: Some(Duration::from_secs(3)),
            auto_close_transactions: true,
            pool_size: 5,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut config = ClientConfig::default();
        let mut i = 0;
        while i < args.len() {
            let key = match args[i].as_str() {
                "--host" | "-h" => "host",
                "--port" | "-p" => "port",
                "--auto-reconnect-delay" => "auto-reconnect-delay",
                "--auto-close-transactions" => "auto-close-transactions",
                "--pool-size" => "pool-size",
                other => return Err(format!("unknown option '{other}'")),
            };
            let value = args
                .get(i + 1)
                .ok_or_else(|| format!("missing value for '{}'", args[i]))?;
            config.set(key, value)?;
            i += 2;
        }
        Ok(config)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key.to_lowercase().as_str() {
            "host" => Some(self.host.clone()),
            "port" => Some(self.port.to_string()),
            "auto-reconnect-delay" => Some(match self.auto_reconnect_delay {
                Some(delay) => delay.as_secs_f64().to_string(),
                None => "false".to_string(),
            }),
            "auto-close-transactions" => Some(
                if self.auto_close_transactions { "yes" } else { "no" }.to_string(),
            ),
            "pool-size" => Some(self.pool_size.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key.to_lowercase().as_str() {
            "host" => {
                if value.is_empty() {
                    return Err("Invalid host value".to_string());
                }
                self.host = value.to_string();
                Ok(())
            }
            "port" => {
                self.port = value.parse().map_err(|_| "Invalid port value".to_string())?;
                Ok(())
            }
            "auto-reconnect-delay" => {
                self.auto_reconnect_delay = match value.to_lowercase().as_str() {
                    "false" | "no" | "off" => None,
                    secs => {
                        let secs: f64 = secs
                            .parse()
                            .map_err(|_| "Invalid auto-reconnect-delay value".to_string())?;
                        let delay = Duration::try_from_secs_f64(secs)
                            .map_err(|_| "Invalid auto-reconnect-delay value".to_string())?;
                        Some(delay)
                    }
                };
                Ok(())
            }
            "auto-close-transactions" => {
                self.auto_close_transactions = parse_flag(value)
                    .ok_or_else(|| "Invalid auto-close-transactions value".to_string())?;
                Ok(())
            }
            "pool-size" => {
                let size: usize = value
                    .parse()
                    .map_err(|_| "Invalid pool-size value".to_string())?;
                if size == 0 {
                    return Err("pool-size must be at least 1".to_string());
                }
                self.pool_size = size;
                Ok(())
            }
            _ => Err(format!("Unknown option '{key}'")),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}
