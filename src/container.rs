//! A running container: router, dispatch core, timer, liveness registry and
//! the heartbeat roles declared in the configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::certificate::CertificateStore;
use crate::config::Config;
use crate::dispatch::{Dispatcher, Skill, SkillState};
use crate::error::DispatchError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatSkill, HEARTBEAT_SERVICE};
use crate::liveness::LivenessRegistry;
use crate::message::Message;
use crate::router::{Router, RouterConfig, SeedRequest};
use crate::timer::Timer;
use crate::tls::{Credentials, TlsConfig};
use crate::types::{Operation, QualifiedName};

pub struct Container {
    config: Config,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    heartbeats: Vec<(QualifiedName, Arc<HeartbeatSkill>)>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    /// Loads the container credential (and one per seed alias) from the key
    /// base path and builds the container.
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let base = &config.key_base_path;
        let own = TlsConfig::from_key_directory(base, &config.container_name)?;
        let credentials = Credentials::new(config.container_name.clone(), own);
        for seed in &config.seeds {
            if credentials.get(&seed.alias).is_err() {
                credentials.insert(
                    seed.alias.clone(),
                    TlsConfig::from_key_directory(base, &seed.alias)?,
                );
            }
        }
        Self::with_credentials(config, Arc::new(credentials))
    }

    pub fn with_credentials(config: Config, credentials: Arc<Credentials>) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let mut router_config = RouterConfig::new(config.container_name.clone());
        router_config.bind_ip = config.bind_ip;
        router_config.reconnect_backoff = config.reconnect_backoff();
        router_config.write_drain_delay = config.write_drain_delay();

        let certificates = Arc::new(CertificateStore::new());
        let (router, inbound_rx) = Router::new(router_config, credentials, certificates.clone());
        let dispatcher = Dispatcher::new(
            router.clone(),
            certificates,
            Timer::new(config.timer_tick()),
            Arc::new(LivenessRegistry::new()),
        );

        let mut heartbeats = Vec::with_capacity(config.roles.len());
        for role in &config.roles {
            let name: QualifiedName = role.name.parse()?;
            let mut heartbeat = HeartbeatConfig::new(name.clone(), role.variant)
                .children(
                    role.children
                        .iter()
                        .map(|c| c.parse::<QualifiedName>())
                        .collect::<Result<Vec<_>, _>>()?,
                )
                .first_in_network(config.first_in_network);
            if let Some(parent) = &role.parent {
                heartbeat = heartbeat.parent(parent.parse()?);
            }

            let key = CertificateStore::load_or_generate(&config.key_base_path, &name)?;
            let skill = Arc::new(HeartbeatSkill::new(heartbeat));
            dispatcher.register_role(name.clone(), skill.clone(), key)?;
            heartbeats.push((name, skill));
        }

        Ok(Arc::new(Self {
            config,
            router,
            dispatcher,
            heartbeats,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            inbound_task: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.container_name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<LivenessRegistry> {
        self.dispatcher.registry()
    }

    pub fn heartbeat(&self, role: &QualifiedName) -> Option<Arc<HeartbeatSkill>> {
        self.heartbeats
            .iter()
            .find(|(name, _)| name == role)
            .map(|(_, skill)| skill.clone())
    }

    pub fn role_states(&self) -> Vec<(QualifiedName, SkillState)> {
        self.heartbeats
            .iter()
            .map(|(name, skill)| (name.clone(), skill.state()))
            .collect()
    }

    /// Sends a message on behalf of one of the container's roles.
    pub async fn send(&self, message: Message) -> Result<(), DispatchError> {
        self.dispatcher.send(message).await
    }

    /// Listens, starts the inbound pool, contacts the seeds, initializes the
    /// top of the local role tree and starts the timer.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Container {} already started", self.name()))?;

        let addr = self.router.listen(self.config.internal_port).await?;
        let dispatcher = Arc::clone(&self.dispatcher);
        *self.inbound_task.lock() = Some(tokio::spawn(run_inbound(dispatcher, inbound)));

        self.contact_seeds().await;
        self.initialize_roles().await;
        self.dispatcher.timer().start();
        info!("Container {} running on {}", self.name(), addr);
        Ok(addr)
    }

    async fn contact_seeds(&self) {
        let Some((sender, _)) = self.heartbeats.first() else {
            return;
        };
        for seed in &self.config.seeds {
            let recipient: QualifiedName = match seed.role.parse() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping seed {}: {}", seed.container, e);
                    continue;
                }
            };
            let (host, port) = seed.dial_address(self.config.lan_id.as_deref());
            let request = SeedRequest {
                host,
                port,
                alias: seed.alias.clone(),
            };
            info!("Contacting seed {} at {}:{}", seed.container, request.host, request.port);
            if let Err(e) = self
                .dispatcher
                .send(request.to_message(sender.clone(), recipient))
                .await
            {
                warn!("Seed {} unreachable: {}", seed.container, e);
            }
        }
    }

    /// Roles no local role lists as a child start the initialization wave.
    async fn initialize_roles(&self) {
        let children: HashSet<&str> = self
            .config
            .roles
            .iter()
            .flat_map(|role| role.children.iter().map(String::as_str))
            .collect();
        for (name, _) in &self.heartbeats {
            if children.contains(name.as_str()) {
                continue;
            }
            let init = Message::builder(name.clone(), name.clone(), Operation::InitializeTask)
                .sender_service(HEARTBEAT_SERVICE)
                .recipient_service(HEARTBEAT_SERVICE)
                .build();
            if let Err(e) = self.dispatcher.send(init).await {
                warn!("Initializing {} failed: {}", name, e);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.dispatcher.timer().shutdown();
        if let Some(task) = self.inbound_task.lock().take() {
            task.abort();
        }
        self.router.shutdown().await;
        info!("Container {} stopped", self.name());
    }
}

/// Hands every inbound message to the dispatch core on its own task.
async fn run_inbound(dispatcher: Arc<Dispatcher>, mut inbound: mpsc::Receiver<Message>) {
    while let Some(message) = inbound.recv().await {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let operation = message.operation().clone();
            let sender = message.sender().clone();
            match dispatcher.dispatch(message).await {
                Ok(()) => {}
                // Logged by the dispatch core.
                Err(e) if e.is_authentication_failure() => {}
                Err(e) => warn!("Dispatching {} from {} failed: {}", operation, sender, e),
            }
        });
    }
    debug!("Inbound queue closed");
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;

    use super::*;
    use crate::config::{RoleConfig, SeedConfig};
    use crate::heartbeat::HeartbeatVariant;
    use crate::tls::test_utils::TestPki;

    fn write_credentials(pki: &TestPki, dir: &Path, container: &str) {
        let (cert, key) = pki.issue_pem(container);
        std::fs::write(dir.join("ca.pem"), pki.ca_pem()).unwrap();
        std::fs::write(dir.join(format!("{container}.pem")), cert).unwrap();
        std::fs::write(dir.join(format!("{container}.key")), key).unwrap();
    }

    fn role(name: &str, variant: HeartbeatVariant, parent: Option<&str>, children: &[&str]) -> RoleConfig {
        RoleConfig {
            name: name.into(),
            variant,
            parent: parent.map(str::to_owned),
            children: children.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn config(dir: &Path) -> Config {
        Config {
            container_name: "alpha".into(),
            key_base_path: dir.to_path_buf(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            internal_port: 0,
            first_in_network: true,
            reconnect_backoff_ms: 0,
            write_drain_ms: 0,
            roles: vec![
                role("alpha.n.root", HeartbeatVariant::Root, None, &["alpha.n.agg"]),
                role("alpha.n.agg", HeartbeatVariant::Container, Some("alpha.n.root"), &["alpha.n.leaf"]),
                role("alpha.n.leaf", HeartbeatVariant::Leaf, Some("alpha.n.agg"), &[]),
            ],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn first_container_brings_its_roles_up() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        write_credentials(&pki, dir.path(), "alpha");

        let container = Container::new(config(dir.path())).unwrap();
        let addr = container.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        for (name, state) in container.role_states() {
            assert_eq!(state, SkillState::Ready, "{name} not ready");
        }
        assert!(dir.path().join("roles").join("alpha.n.leaf.key").exists());
        assert!(container.registry().get("alpha").unwrap().first_in_network);
        assert_eq!(container.dispatcher().timer().task_count(), 3);

        assert!(container.start().await.is_err());
        container.shutdown().await;
        assert!(container.router().is_shut_down());
        assert_eq!(container.dispatcher().timer().task_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_seed_does_not_prevent_start() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        write_credentials(&pki, dir.path(), "alpha");

        let mut config = config(dir.path());
        config.first_in_network = false;
        config.roles = vec![role("alpha.n.agg", HeartbeatVariant::Container, Some("beta.n.root"), &[])];
        config.seeds = vec![SeedConfig {
            container: "beta".into(),
            host: "127.0.0.1".into(),
            // Nothing listens on the discard port.
            port: 9,
            alias: "alpha".into(),
            role: "beta.n.root".into(),
            lan_id: None,
            external_host: None,
            external_port: None,
        }];

        let container = Container::new(config).unwrap();
        container.start().await.unwrap();
        let agg: QualifiedName = "alpha.n.agg".parse().unwrap();
        assert_eq!(
            container.heartbeat(&agg).unwrap().state(),
            SkillState::IsolatedFromNetwork
        );
        assert!(!container.router().is_connected("beta").await);
        container.shutdown().await;
    }

    #[test]
    fn missing_credentials_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Container::new(config(dir.path())).is_err());
    }
}
