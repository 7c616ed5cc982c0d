//! Role dispatch core.
//!
//! Every message, local or remote, inbound or outbound, passes through
//! [`Dispatcher::dispatch`].  Messages for another container go to the
//! router.  Messages that arrived from another container must carry a
//! signature that verifies against the sender role's certificate before any
//! local role sees them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::certificate::{CertificateCache, CertificateStore, RoleCertificate};
use crate::error::DispatchError;
use crate::liveness::LivenessRegistry;
use crate::message::Message;
use crate::router::Router;
use crate::timer::Timer;
use crate::types::{Operation, QualifiedName};

/// Lifecycle state every skill reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillState {
    Uninitialized,
    IsolatedFromNetwork,
    Ready,
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::IsolatedFromNetwork => "ISOLATED_FROM_NETWORK",
            Self::Ready => "READY",
        })
    }
}

/// Behavior attached to a role.
///
/// `handle` runs on the dispatching task; a skill with slow work should
/// spawn it rather than hold the caller.
#[async_trait]
pub trait Skill: Send + Sync {
    async fn handle(&self, ctx: &SkillContext, message: Message) -> Result<(), DispatchError>;

    fn state(&self) -> SkillState;
}

/// What a skill sees of its container while handling a message.
#[derive(Clone)]
pub struct SkillContext {
    dispatcher: Arc<Dispatcher>,
    role: QualifiedName,
}

impl SkillContext {
    pub fn new(dispatcher: Arc<Dispatcher>, role: QualifiedName) -> Self {
        Self { dispatcher, role }
    }

    /// The role the skill is attached to.
    pub fn role(&self) -> &QualifiedName {
        &self.role
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.dispatcher.timer
    }

    pub fn registry(&self) -> &Arc<LivenessRegistry> {
        &self.dispatcher.registry
    }

    pub async fn send(&self, message: Message) -> Result<(), DispatchError> {
        self.dispatcher.send(message).await
    }
}

pub struct Dispatcher {
    container: String,
    router: Arc<Router>,
    certificates: Arc<CertificateStore>,
    remote_certificates: CertificateCache,
    roles: RwLock<HashMap<QualifiedName, Arc<dyn Skill>>>,
    timer: Arc<Timer>,
    registry: Arc<LivenessRegistry>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        certificates: Arc<CertificateStore>,
        timer: Arc<Timer>,
        registry: Arc<LivenessRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            container: router.container().to_owned(),
            router,
            certificates,
            remote_certificates: CertificateCache::default(),
            roles: RwLock::new(HashMap::new()),
            timer,
            registry,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn registry(&self) -> &Arc<LivenessRegistry> {
        &self.registry
    }

    /// Hosts `skill` under `name` and issues the role's certificate.
    pub fn register_role(
        &self,
        name: QualifiedName,
        skill: Arc<dyn Skill>,
        key: SigningKey,
    ) -> Result<RoleCertificate, DispatchError> {
        if !name.is_in_container(&self.container) {
            return Err(DispatchError::RoleNotFound(name));
        }
        let certificate = self.certificates.insert(name.clone(), key);
        self.roles.write().insert(name.clone(), skill);
        info!("Role {} registered", name);
        Ok(certificate)
    }

    pub fn unregister_role(&self, name: &QualifiedName) {
        self.roles.write().remove(name);
        self.certificates.remove(name);
    }

    pub fn role_state(&self, name: &QualifiedName) -> Option<SkillState> {
        self.roles.read().get(name).map(|skill| skill.state())
    }

    pub fn roles(&self) -> Vec<QualifiedName> {
        let mut names: Vec<QualifiedName> = self.roles.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Trusts a remote certificate without fetching it.
    pub fn cache_certificate(&self, certificate: RoleCertificate) {
        self.remote_certificates.insert(certificate);
    }

    /// Outbound entry for skills: signs messages leaving the container, then
    /// dispatches.
    pub async fn send(self: &Arc<Self>, message: Message) -> Result<(), DispatchError> {
        let message = if message.recipient().is_in_container(&self.container) || message.is_signed() {
            message
        } else {
            self.certificates.sign(message)?
        };
        self.dispatch(message).await
    }

    pub async fn dispatch(self: &Arc<Self>, message: Message) -> Result<(), DispatchError> {
        if self.is_shutting_down() {
            debug!(
                "Shutting down, dropping {} for {}",
                message.operation(),
                message.recipient()
            );
            return Ok(());
        }

        if !message.recipient().is_in_container(&self.container) {
            self.router.dispatch(&message).await?;
            return Ok(());
        }

        if message.crosses_containers() {
            self.verify(&message).await?;
        }

        let recipient = message.recipient().clone();
        let skill = self
            .roles
            .read()
            .get(&recipient)
            .cloned()
            .ok_or_else(|| DispatchError::RoleNotFound(recipient.clone()))?;

        if message.crosses_containers() && *message.operation() == Operation::SeedConnectionRequestInfo {
            info!("Link from {} established by seed request", message.sender().container());
            return Ok(());
        }

        let ctx = SkillContext::new(Arc::clone(self), recipient);
        skill.handle(&ctx, message).await
    }

    async fn verify(self: &Arc<Self>, message: &Message) -> Result<(), DispatchError> {
        let sender = message.sender();
        let unverified = |reason: String| {
            warn!("Rejecting {} from {}: {}", message.operation(), sender, reason);
            DispatchError::UnverifiedMessage {
                sender: sender.clone(),
                reason,
            }
        };

        let certificate = match self.remote_certificates.get(sender) {
            Some(certificate) => certificate,
            None => {
                let fetched = self
                    .router
                    .fetch_certificate(sender)
                    .await
                    .map_err(|e| unverified(format!("no certificate: {e}")))?;
                self.remote_certificates.insert(fetched.clone());
                fetched
            }
        };
        let key = certificate
            .verifying_key()
            .map_err(|e| unverified(e.to_string()))?;
        message.verify(&key).map_err(|e| {
            // A rotated key is picked up by the next message.
            self.remote_certificates.invalidate(sender);
            unverified(e.to_string())
        })
    }

    /// One-way: later dispatches are dropped, in-flight work continues.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Dispatch core of {} shutting down", self.container);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
