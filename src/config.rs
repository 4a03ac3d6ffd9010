//! Server configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::users::MAX_USERS;

fn default_listen() -> SocketAddr {
    "0.0.0.0:53".parse().unwrap()
}

fn default_tun_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 53, 0, 1)
}

fn default_netmask() -> u8 {
    27
}

fn default_mtu() -> u16 {
    1130
}

fn default_check_client_ip() -> bool {
    true
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Main server configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Parent domain the tunnel answers for; everything else is forwarded
    /// or dropped.
    pub topdomain: String,

    /// Shared secret for the login handshake.
    pub password: String,

    /// IPv4 DNS listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Optional IPv6 DNS listen address.
    #[serde(default)]
    pub listen_v6: Option<SocketAddr>,

    /// Server-side tunnel address; client addresses are carved above it.
    #[serde(default = "default_tun_ip")]
    pub tun_ip: Ipv4Addr,

    /// Netmask of the tunnel subnet.
    #[serde(default = "default_netmask")]
    pub netmask: u8,

    /// MTU advertised to clients at login.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Externally visible address, used for NS glue and the reached-IP
    /// probe when set; otherwise the query's arrival address is echoed.
    #[serde(default)]
    pub external_ip: Option<Ipv4Addr>,

    /// Require session queries to come from the address seen at version
    /// negotiation. Disable only behind fickle NAT.
    #[serde(default = "default_check_client_ip")]
    pub check_client_ip: bool,

    /// Loopback port of a sibling resolver for queries outside the parent
    /// domain. Unset means such queries are dropped.
    #[serde(default)]
    pub forward_port: Option<u16>,

    /// Shut the whole server down after this long without any user
    /// traffic. Unset means run forever.
    #[serde(default, with = "humantime_serde")]
    pub max_idle: Option<Duration>,

    /// Query timeout assumed for a session until its client negotiates one.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub default_query_timeout: Duration,

    /// Canonicalise owner-name case when detecting duplicate queries.
    /// Dedups more aggressively than the byte-exact default.
    #[serde(default)]
    pub dedup_ignore_case: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            topdomain: String::new(),
            password: String::new(),
            listen: default_listen(),
            listen_v6: None,
            tun_ip: default_tun_ip(),
            netmask: default_netmask(),
            mtu: default_mtu(),
            external_ip: None,
            check_client_ip: true,
            forward_port: None,
            max_idle: None,
            default_query_timeout: default_query_timeout(),
            dedup_ignore_case: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.topdomain.is_empty() || !self.topdomain.contains('.') {
            return Err("topdomain must be a dotted domain name".to_string());
        }
        if self.topdomain.len() > 128 {
            return Err("topdomain too long to leave room for tunnel labels".to_string());
        }
        if self.password.is_empty() {
            return Err("password must be set".to_string());
        }
        if self.netmask < 8 || self.netmask > 27 {
            return Err(format!(
                "netmask /{} cannot hold the server and {} clients",
                self.netmask, MAX_USERS
            ));
        }
        if self.mtu < 68 {
            return Err("mtu below the IPv4 minimum".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            topdomain: "t.example.com".to_string(),
            password: "secret".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn default_config_fails_without_domain_and_password() {
        assert!(ServerConfig::default().validate().is_err());
        let mut config = ServerConfig::default();
        config.topdomain = "t.example.com".to_string();
        assert!(config.validate().is_err());
        config.password = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn netmask_bounds() {
        let mut config = valid();
        config.netmask = 28;
        assert!(config.validate().is_err());
        config.netmask = 27;
        assert!(config.validate().is_ok());
        config.netmask = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
                topdomain = "t.example.com"
                password = "secret"
                max_idle = "10m"
                default_query_timeout = "1500ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.max_idle, Some(Duration::from_secs(600)));
        assert_eq!(config.default_query_timeout, Duration::from_millis(1500));
        assert!(config.check_client_ip);
        assert!(!config.dedup_ignore_case);
    }
}
