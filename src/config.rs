use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::heartbeat::HeartbeatVariant;
use crate::types::QualifiedName;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub container_name: String,
    /// Directory holding `ca.pem`, the container credentials and `roles/`.
    pub key_base_path: PathBuf,
    pub bind_ip: IpAddr,
    /// Port the router listens on.
    pub internal_port: u16,
    /// LAN this container sits on; selects how seeds are dialed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lan_id: Option<String>,
    pub first_in_network: bool,
    pub timer_tick_secs: u64,
    pub reconnect_backoff_ms: u64,
    pub write_drain_ms: u64,
    pub seeds: Vec<SeedConfig>,
    pub roles: Vec<RoleConfig>,
}

/// A bootstrap peer reached through a seed connection request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SeedConfig {
    pub container: String,
    pub host: String,
    pub port: u16,
    /// Credential alias used to dial the seed.
    pub alias: String,
    /// Role of the seed container the request is addressed to.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan_id: Option<String>,
    /// Address of the seed as seen from outside its LAN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

impl SeedConfig {
    /// Host and port to dial from a container on `lan_id`: the internal
    /// address inside the seed's LAN, the external one (when known) outside.
    pub fn dial_address(&self, lan_id: Option<&str>) -> (String, u16) {
        let same_lan = self.lan_id.is_none() || self.lan_id.as_deref() == lan_id;
        if same_lan {
            return (self.host.clone(), self.port);
        }
        (
            self.external_host.clone().unwrap_or_else(|| self.host.clone()),
            self.external_port.unwrap_or(self.port),
        )
    }
}

/// A heartbeat role hosted by this container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoleConfig {
    pub name: String,
    pub variant: HeartbeatVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_name: "canopy".into(),
            key_base_path: PathBuf::from("/etc/canopy/keys"),
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            internal_port: 7400,
            lan_id: None,
            first_in_network: false,
            timer_tick_secs: 5,
            reconnect_backoff_ms: 15_000,
            write_drain_ms: 1_000,
            seeds: Vec::new(),
            roles: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("canopy.toml"))
            .merge(Json::file("canopy.json"))
            .merge(Env::prefixed("CANOPY_"));
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(name_file) = std::env::var("CANOPY_CONTAINER_NAME_FILE") {
            config.container_name = std::fs::read_to_string(name_file)?.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.container_name.is_empty() || self.container_name.contains('.') {
            anyhow::bail!("Invalid container_name {:?}", self.container_name);
        }
        if self.timer_tick_secs == 0 {
            anyhow::bail!("timer_tick_secs must be positive");
        }
        for role in &self.roles {
            let name = parse_name(&role.name)?;
            if !name.is_in_container(&self.container_name) {
                anyhow::bail!("Role {} is not hosted by {}", name, self.container_name);
            }
            if let Some(parent) = &role.parent {
                parse_name(parent)?;
            }
            for child in &role.children {
                parse_name(child)?;
            }
            if role.variant == HeartbeatVariant::Leaf && !role.children.is_empty() {
                anyhow::bail!("Leaf role {} cannot have children", name);
            }
        }
        for seed in &self.seeds {
            let role = parse_name(&seed.role)?;
            if !role.is_in_container(&seed.container) {
                anyhow::bail!("Seed role {} is not hosted by {}", role, seed.container);
            }
        }
        if !self.seeds.is_empty() && self.roles.is_empty() {
            anyhow::bail!("Seeds are configured but no local role can send the request");
        }
        Ok(())
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_secs(self.timer_tick_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn write_drain_delay(&self) -> Duration {
        Duration::from_millis(self.write_drain_ms)
    }
}

fn parse_name(value: &str) -> anyhow::Result<QualifiedName> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid role name {:?}: {}", value, e))
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    fn seed(lan_id: Option<&str>) -> SeedConfig {
        SeedConfig {
            container: "beta".into(),
            host: "10.0.0.2".into(),
            port: 7400,
            alias: "alpha".into(),
            role: "beta.n.root".into(),
            lan_id: lan_id.map(str::to_owned),
            external_host: Some("203.0.113.7".into()),
            external_port: Some(17400),
        }
    }

    #[test]
    fn layers_file_and_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "canopy.toml",
                r#"
                    container_name = "alpha"
                    internal_port = 7500
                    first_in_network = true

                    [[roles]]
                    name = "alpha.n.root"
                    variant = "root"
                    children = ["alpha.n.agg"]

                    [[roles]]
                    name = "alpha.n.agg"
                    variant = "container"
                    parent = "alpha.n.root"
                "#,
            )?;
            jail.set_env("CANOPY_INTERNAL_PORT", "7600");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.container_name, "alpha");
            assert_eq!(config.internal_port, 7600);
            assert!(config.first_in_network);
            assert_eq!(config.roles.len(), 2);
            assert_eq!(config.roles[0].variant, HeartbeatVariant::Root);
            assert_eq!(config.roles[1].parent.as_deref(), Some("alpha.n.root"));
            assert_eq!(config.reconnect_backoff(), Duration::from_secs(15));
            assert_eq!(config.write_drain_delay(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn container_name_file_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file("name", "gamma\n")?;
            let path = jail.directory().join("name");
            jail.set_env("CANOPY_CONTAINER_NAME_FILE", path.display());
            jail.set_env("CANOPY_CONTAINER_NAME", "alpha");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.container_name, "gamma");
            Ok(())
        });
    }

    #[test]
    fn foreign_roles_are_rejected() {
        let config = Config {
            container_name: "alpha".into(),
            roles: vec![RoleConfig {
                name: "beta.n.root".into(),
                variant: HeartbeatVariant::Root,
                parent: None,
                children: Vec::new(),
            }],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seeds_outside_our_lan_are_dialed_externally() {
        let office = seed(Some("office"));
        assert_eq!(office.dial_address(Some("office")), ("10.0.0.2".into(), 7400));
        assert_eq!(office.dial_address(Some("cloud")), ("203.0.113.7".into(), 17400));
        assert_eq!(office.dial_address(None), ("203.0.113.7".into(), 17400));

        // Without a LAN of its own the seed is reachable as configured.
        assert_eq!(seed(None).dial_address(Some("cloud")), ("10.0.0.2".into(), 7400));
    }
}
