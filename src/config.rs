use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::socket_pool::XID_SPACE;
use crate::xlat::DEFAULT_SCRATCH_MAX_USES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// High 16 bits of every xid. Random when unset.
    pub base_xid: Option<u32>,
    pub xid_space: u32,
    pub bind: Vec<Endpoint>,
    pub interface: Option<String>,
    pub servers: Vec<Endpoint>,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub timeout_ms: u64,
    pub max_outstanding: usize,
    pub num_requests: Option<u64>,
    pub lifetime_seconds: Option<f64>,
    pub rate: Option<f64>,
    pub scratch_max_uses: u32,
    pub rng_seed: Option<u64>,
    pub inputs: Vec<Input>,
}

/// One request stream: attribute templates expanded in order for every
/// request of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub template: String,
}

impl Attribute {
    pub fn new(name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
        }
    }
}

impl Input {
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|attribute| (attribute.name.as_str(), attribute.template.as_str()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_xid: None,
            xid_space: XID_SPACE,
            bind: vec![Endpoint::new(std::net::Ipv4Addr::UNSPECIFIED, 68)],
            interface: None,
            servers: vec![Endpoint::new(std::net::Ipv4Addr::BROADCAST, 67)],
            gateway: None,
            timeout_ms: 1000,
            max_outstanding: 256,
            num_requests: None,
            lifetime_seconds: None,
            rate: None,
            scratch_max_uses: DEFAULT_SCRATCH_MAX_USES,
            rng_seed: None,
            inputs: vec![Input {
                name: Some("discover".to_string()),
                attributes: vec![
                    Attribute::new("Message-Type", "Discover"),
                    Attribute::new(
                        "Client-Hardware-Address",
                        "%{ethaddr.range:02:00:00:00:00:01-02:00:00:ff:ff:ff}",
                    ),
                    Attribute::new("Parameter-Request-List", "1,3,6,51,54"),
                ],
            }],
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.xid_space == 0 || self.xid_space > XID_SPACE {
            return Err(Error::InvalidConfig(format!(
                "xid_space must be between 1 and {}",
                XID_SPACE
            )));
        }

        if self.bind.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one bind endpoint is required".to_string(),
            ));
        }

        if let Some(server) = self.servers.iter().find(|server| !server.is_defined()) {
            return Err(Error::InvalidConfig(format!(
                "server {} needs both an address and a port",
                server
            )));
        }
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one server is required".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_outstanding == 0 {
            return Err(Error::InvalidConfig(
                "max_outstanding must be greater than 0".to_string(),
            ));
        }

        if let Some(rate) = self.rate
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "rate must be a positive number, got {}",
                rate
            )));
        }

        if let Some(lifetime) = self.lifetime_seconds
            && !(lifetime.is_finite() && lifetime > 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "lifetime_seconds must be a positive number, got {}",
                lifetime
            )));
        }

        if self.inputs.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one input is required".to_string(),
            ));
        }
        for (index, input) in self.inputs.iter().enumerate() {
            if input.attributes.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "input {} has no attributes",
                    index
                )));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.servers[0].to_string(), "255.255.255.255:67");
        assert_eq!(config.bind[0].to_string(), "0.0.0.0:68");
    }

    #[test]
    fn test_xid_space_bounds() {
        let config = Config {
            xid_space: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            xid_space: XID_SPACE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_servers_and_inputs() {
        let config = Config {
            servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            inputs: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            inputs: vec![Input {
                name: None,
                attributes: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_rate_and_timeout() {
        let config = Config {
            rate: Some(0.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "servers": ["192.0.2.1:67"],
                "inputs": [
                    {"attributes": [
                        {"name": "Message-Type", "template": "Request"},
                        {"name": "Requested-IP-Address", "template": "%{ipaddr.range:10.0.0.1-10.0.0.9}"}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.servers[0].to_string(), "192.0.2.1:67");
        assert_eq!(config.xid_space, XID_SPACE);
        assert_eq!(config.scratch_max_uses, DEFAULT_SCRATCH_MAX_USES);
        let pairs: Vec<(&str, &str)> = config.inputs[0].pairs().collect();
        assert_eq!(pairs[0], ("Message-Type", "Request"));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let path = std::env::temp_dir().join(format!("dhcperf-config-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let created = Config::load_or_create(&path).unwrap();
        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created.inputs, loaded.inputs);
        assert_eq!(created.servers, loaded.servers);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_ephemeral_bind_survives_save_and_load() {
        let path = std::env::temp_dir().join(format!("dhcperf-ephemeral-{}.json", std::process::id()));
        let config = Config {
            bind: vec![
                Endpoint::new(std::net::Ipv4Addr::LOCALHOST, 0),
                Endpoint::new(std::net::Ipv4Addr::UNSPECIFIED, 68),
            ],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.bind, config.bind);
        assert!(loaded.validate().is_ok());

        std::fs::remove_file(&path).unwrap();
    }
}
