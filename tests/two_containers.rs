//! Two containers talking over loopback mutual TLS.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy::config::RoleConfig;
use canopy::heartbeat::HeartbeatVariant;
use canopy::router::SeedRequest;
use canopy::{
    Config, Container, DispatchError, Message, NetworkError, Operation, QualifiedName, Skill,
    SkillContext, SkillState,
};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tempfile::TempDir;

struct Pki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "canopy e2e CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    /// Writes `ca.pem`, `<container>.pem` and `<container>.key` into `dir`.
    fn install(&self, dir: &Path, container: &str) {
        let mut params = CertificateParams::new(vec![container.to_owned()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, container);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        std::fs::write(dir.join("ca.pem"), self.ca_cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{container}.pem")), cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{container}.key")), key.serialize_pem()).unwrap();
    }
}

/// Records every message; acknowledges keep-alives when asked to.
#[derive(Default)]
struct Inbox {
    received: Mutex<Vec<Message>>,
    acknowledge: bool,
}

impl Inbox {
    fn acknowledging() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            acknowledge: true,
        })
    }

    fn markers(&self) -> Vec<u64> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| m.parameter("marker").and_then(|v| v.as_u64()))
            .collect()
    }
}

#[async_trait]
impl Skill for Inbox {
    async fn handle(&self, ctx: &SkillContext, message: Message) -> Result<(), DispatchError> {
        let ack = (self.acknowledge && *message.operation() == Operation::KeepAliveInfo)
            .then(|| message.reply(Operation::KeepAliveAcknowledgedTask).build());
        self.received.lock().push(message);
        if let Some(ack) = ack {
            ctx.send(ack).await?;
        }
        Ok(())
    }

    fn state(&self) -> SkillState {
        SkillState::Ready
    }
}

fn name(s: &str) -> QualifiedName {
    s.parse().unwrap()
}

fn build(pki: &Pki, container: &str, configure: impl FnOnce(&mut Config)) -> (Arc<Container>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    pki.install(dir.path(), container);
    let mut config = Config {
        container_name: container.into(),
        key_base_path: dir.path().to_path_buf(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        internal_port: 0,
        reconnect_backoff_ms: 0,
        write_drain_ms: 0,
        ..Config::default()
    };
    configure(&mut config);
    (Container::new(config).unwrap(), dir)
}

fn host_inbox(container: &Container, role: &str, inbox: Arc<Inbox>) {
    container
        .dispatcher()
        .register_role(name(role), inbox, SigningKey::generate(&mut OsRng))
        .unwrap();
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn seed_to(addr: SocketAddr, alias: &str) -> SeedRequest {
    SeedRequest {
        host: addr.ip().to_string(),
        port: addr.port(),
        alias: alias.into(),
    }
}

fn keep_alive(marker: u64) -> Message {
    Message::builder(name("alpha.n.observer"), name("beta.n.inbox"), Operation::KeepAliveInfo)
        .parameter("marker", marker)
        .build()
}

#[tokio::test]
async fn seeded_link_carries_verified_messages_both_ways() {
    let pki = Pki::new();
    let (alpha, _alpha_dir) = build(&pki, "alpha", |_| {});
    let (beta, _beta_dir) = build(&pki, "beta", |_| {});
    let observer = Inbox::acknowledging();
    let inbox = Inbox::acknowledging();
    host_inbox(&alpha, "alpha.n.observer", observer.clone());
    host_inbox(&beta, "beta.n.inbox", inbox.clone());
    alpha.start().await.unwrap();
    let beta_addr = beta.start().await.unwrap();

    // Without a link or a seed, first contact is impossible.
    let err = alpha.send(keep_alive(0)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Network(NetworkError::NoRoute { .. })));
    assert!(!alpha.router().is_connected("beta").await);
    assert!(alpha.router().reconnection_info("beta").await.is_none());

    let seed = seed_to(beta_addr, "alpha").to_message(name("alpha.n.observer"), name("beta.n.inbox"));
    alpha.send(seed).await.unwrap();
    assert!(alpha.router().is_connected("beta").await);
    let info = alpha.router().reconnection_info("beta").await.unwrap();
    assert_eq!(info.port, beta_addr.port());
    eventually("beta to bind the inbound link", || {
        let beta = beta.clone();
        async move { beta.router().is_connected("alpha").await }
    })
    .await;

    // A signed message is delivered and answered over the same link.
    let first = keep_alive(1);
    let reply_with = first.reply_with().to_owned();
    alpha.send(first).await.unwrap();
    eventually("the keep-alive to arrive", || {
        let inbox = inbox.clone();
        async move { inbox.markers() == vec![1] }
    })
    .await;
    eventually("the acknowledgement to come back", || {
        let observer = observer.clone();
        async move { !observer.received.lock().is_empty() }
    })
    .await;
    {
        let acks = observer.received.lock();
        assert_eq!(acks[0].operation(), &Operation::KeepAliveAcknowledgedTask);
        assert_eq!(acks[0].in_reply_to(), reply_with);
        assert_eq!(acks[0].sender(), &name("beta.n.inbox"));
    }
    assert!(beta.router().reconnection_info("alpha").await.is_none());

    // A forged signature never reaches the role.
    let forged = keep_alive(2).sign(&SigningKey::generate(&mut OsRng)).unwrap();
    alpha.dispatcher().dispatch(forged).await.unwrap();
    alpha.send(keep_alive(3)).await.unwrap();
    eventually("the genuine message after the forgery", || {
        let inbox = inbox.clone();
        async move { inbox.markers().contains(&3) }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(inbox.markers(), vec![1, 3]);
    // The seed request was absorbed by the dispatch core.
    assert!(inbox
        .received
        .lock()
        .iter()
        .all(|m| *m.operation() == Operation::KeepAliveInfo));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn certificates_are_fetched_from_the_hosting_container() {
    let pki = Pki::new();
    let (alpha, _alpha_dir) = build(&pki, "alpha", |_| {});
    let (beta, _beta_dir) = build(&pki, "beta", |_| {});
    host_inbox(&alpha, "alpha.n.observer", Arc::new(Inbox::default()));
    let key = SigningKey::generate(&mut OsRng);
    let issued = beta
        .dispatcher()
        .register_role(name("beta.n.inbox"), Arc::new(Inbox::default()), key)
        .unwrap();
    alpha.start().await.unwrap();
    let beta_addr = beta.start().await.unwrap();

    alpha
        .router()
        .open_channel("beta", &beta_addr.ip().to_string(), beta_addr.port(), "alpha")
        .await
        .unwrap();

    let fetched = alpha.router().fetch_certificate(&name("beta.n.inbox")).await.unwrap();
    assert_eq!(fetched, issued);

    let missing = alpha.router().fetch_certificate(&name("beta.n.nobody")).await;
    assert!(matches!(missing, Err(NetworkError::CertificateUnavailable { .. })));

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn aggregator_joins_a_remote_root() {
    let pki = Pki::new();
    let (beta, _beta_dir) = build(&pki, "beta", |config| {
        config.first_in_network = true;
        config.roles = vec![RoleConfig {
            name: "beta.n.root".into(),
            variant: HeartbeatVariant::Root,
            parent: None,
            children: Vec::new(),
        }];
    });
    let beta_addr = beta.start().await.unwrap();

    let (alpha, _alpha_dir) = build(&pki, "alpha", |config| {
        config.timer_tick_secs = 1;
        config.roles = vec![RoleConfig {
            name: "alpha.n.agg".into(),
            variant: HeartbeatVariant::Container,
            parent: Some("beta.n.root".into()),
            children: Vec::new(),
        }];
        config.seeds = vec![canopy::config::SeedConfig {
            container: "beta".into(),
            host: beta_addr.ip().to_string(),
            port: beta_addr.port(),
            alias: "alpha".into(),
            role: "beta.n.root".into(),
            lan_id: None,
            external_host: None,
            external_port: None,
        }];
    });
    alpha.start().await.unwrap();

    let agg = alpha.heartbeat(&name("alpha.n.agg")).unwrap();
    eventually("the aggregator to join", || {
        let agg = agg.clone();
        async move { agg.state() == SkillState::Ready }
    })
    .await;
    eventually("the root to see alpha alive", || {
        let beta = beta.clone();
        async move { beta.registry().is_alive("alpha") == Some(true) }
    })
    .await;
    assert_eq!(alpha.registry().is_alive("beta"), Some(true));
    assert!(beta.registry().get("beta").unwrap().first_in_network);

    alpha.shutdown().await;
    beta.shutdown().await;
}
