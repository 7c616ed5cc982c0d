//! Heartbeat skill: the liveness state machine of the hierarchy.
//!
//! One machine serves the three positions a role can take in the tree.
//! A [`HeartbeatVariant`] maps to a small set of [`Capabilities`] and
//! everything variant specific is decided from those:
//!
//! | variant     | children | aggregator root | outbound period |
//! |-------------|----------|-----------------|-----------------|
//! | `Leaf`      | no       | no              | 60s             |
//! | `Container` | yes      | no              | 30s             |
//! | `Root`      | yes      | yes             | 30s             |
//!
//! States move `UNINITIALIZED -> ISOLATED_FROM_NETWORK -> READY` and never
//! back.  In `READY` the shared timer drives two behaviors: a keep-alive to
//! the parent once per send period, and a sweep that reports a remote
//! container missing to the liveness registry once every role of it heard
//! here has been silent for longer than the receive timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::dispatch::{Skill, SkillContext, SkillState};
use crate::error::DispatchError;
use crate::message::Message;
use crate::timer::TimerTask;
use crate::types::{params, Operation, QualifiedName};

pub const LEAF_SEND_PERIOD: Duration = Duration::from_secs(60);

pub const CONTAINER_SEND_PERIOD: Duration = Duration::from_secs(30);

pub const ROOT_SEND_PERIOD: Duration = Duration::from_secs(30);

/// Silence after which a peer is reported missing.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Service tag carried by heartbeat messages.
pub const HEARTBEAT_SERVICE: &str = "heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatVariant {
    Leaf,
    Container,
    Root,
}

impl HeartbeatVariant {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Leaf => Capabilities {
                has_children: false,
                is_aggregator_root: false,
            },
            Self::Container => Capabilities {
                has_children: true,
                is_aggregator_root: false,
            },
            Self::Root => Capabilities {
                has_children: true,
                is_aggregator_root: true,
            },
        }
    }

    pub fn send_period(self) -> Duration {
        match self {
            Self::Leaf => LEAF_SEND_PERIOD,
            Self::Container => CONTAINER_SEND_PERIOD,
            Self::Root => ROOT_SEND_PERIOD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Aggregates keep-alives from child roles.
    pub has_children: bool,
    /// Accepts singleton agents joining the network.
    pub is_aggregator_root: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub role: QualifiedName,
    pub variant: HeartbeatVariant,
    pub parent: Option<QualifiedName>,
    pub children: Vec<QualifiedName>,
    /// The first container of the network is `READY` as soon as it is
    /// initialized.
    pub first_in_network: bool,
    pub send_period: Duration,
    pub receive_timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(role: QualifiedName, variant: HeartbeatVariant) -> Self {
        Self {
            role,
            variant,
            parent: None,
            children: Vec::new(),
            first_in_network: false,
            send_period: variant.send_period(),
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn parent(mut self, parent: QualifiedName) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn children(mut self, children: Vec<QualifiedName>) -> Self {
        self.children = children;
        self
    }

    #[must_use]
    pub fn first_in_network(mut self, first: bool) -> Self {
        self.first_in_network = first;
        self
    }

    #[must_use]
    pub fn send_period(mut self, period: Duration) -> Self {
        self.send_period = period;
        self
    }

    #[must_use]
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
}

/// The heartbeat skill attached to a role.
pub struct HeartbeatSkill {
    core: Arc<HeartbeatCore>,
}

struct HeartbeatCore {
    config: HeartbeatConfig,
    capabilities: Capabilities,
    state: Mutex<SkillState>,
    initialized: AtomicBool,
    /// When the last keep-alive (or join request) left for the parent.
    last_sent: Mutex<Option<Instant>>,
    /// Last keep-alive received per peer; entries are never removed.
    inbound: Mutex<HashMap<QualifiedName, Instant>>,
}

impl HeartbeatSkill {
    pub fn new(config: HeartbeatConfig) -> Self {
        let capabilities = config.variant.capabilities();
        Self {
            core: Arc::new(HeartbeatCore {
                config,
                capabilities,
                state: Mutex::new(SkillState::Uninitialized),
                initialized: AtomicBool::new(false),
                last_sent: Mutex::new(None),
                inbound: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.core.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.core.capabilities
    }

    /// Last keep-alive received from `peer`.
    pub fn last_heard(&self, peer: &QualifiedName) -> Option<Instant> {
        self.core.inbound.lock().get(peer).copied()
    }

    pub fn record_keep_alive(&self, peer: QualifiedName, at: Instant) {
        self.core.inbound.lock().insert(peer, at);
    }

    /// Runs one timer tick as of `now`.
    pub async fn tick(&self, ctx: &SkillContext, now: Instant) {
        self.core.tick(ctx, now).await;
    }

    /// Reports containers whose every peer has been silent since before
    /// `now - receive_timeout`; returns them sorted.
    pub fn sweep(&self, ctx: &SkillContext, now: Instant) -> Vec<String> {
        self.core.sweep(ctx, now)
    }
}

#[async_trait]
impl Skill for HeartbeatSkill {
    async fn handle(&self, ctx: &SkillContext, message: Message) -> Result<(), DispatchError> {
        self.core.handle(&self.core, ctx, message).await
    }

    fn state(&self) -> SkillState {
        *self.core.state.lock()
    }
}

impl HeartbeatCore {
    fn role(&self) -> &QualifiedName {
        &self.config.role
    }

    fn state(&self) -> SkillState {
        *self.state.lock()
    }

    fn understands(&self, operation: &Operation) -> bool {
        match operation {
            Operation::InitializeTask
            | Operation::JoinAcknowledgedTask
            | Operation::MessageNotUnderstoodInfo
            | Operation::OperationNotPermittedInfo => true,
            Operation::PerformMissionTask | Operation::KeepAliveInfo => self.capabilities.has_children,
            Operation::KeepAliveAcknowledgedTask => self.config.parent.is_some(),
            Operation::JoinNetworkSingletonAgentInfo => self.capabilities.is_aggregator_root,
            _ => false,
        }
    }

    async fn handle(
        &self,
        this: &Arc<HeartbeatCore>,
        ctx: &SkillContext,
        message: Message,
    ) -> Result<(), DispatchError> {
        if !self.understands(message.operation()) {
            debug!("{} does not understand {}", self.role(), message.operation());
            return self.reply(ctx, message.not_understood()).await;
        }

        match message.operation() {
            Operation::InitializeTask => self.initialize(this, ctx, &message).await,
            Operation::JoinAcknowledgedTask | Operation::PerformMissionTask => {
                self.accepted(ctx, &message).await
            }
            Operation::KeepAliveInfo => self.keep_alive(ctx, &message).await,
            Operation::KeepAliveAcknowledgedTask => {
                debug!("{} keep-alive acknowledged by {}", self.role(), message.sender());
                ctx.registry().record_alive(message.sender().container());
                Ok(())
            }
            Operation::JoinNetworkSingletonAgentInfo => self.join_request(ctx, &message).await,
            Operation::MessageNotUnderstoodInfo | Operation::OperationNotPermittedInfo => {
                info!(
                    "{} answered {} to our {}",
                    message.sender(),
                    message.operation(),
                    message.parameter_str(params::OPERATION).unwrap_or("message")
                );
                Ok(())
            }
            _ => self.reply(ctx, message.not_understood()).await,
        }
    }

    async fn initialize(
        &self,
        this: &Arc<HeartbeatCore>,
        ctx: &SkillContext,
        message: &Message,
    ) -> Result<(), DispatchError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return self.reply(ctx, message.not_permitted("already initialized")).await;
        }

        for child in &self.config.children {
            let init = Message::builder(self.role().clone(), child.clone(), Operation::InitializeTask)
                .sender_service(HEARTBEAT_SERVICE)
                .recipient_service(HEARTBEAT_SERVICE)
                .conversation_id(message.conversation_id())
                .build();
            if let Err(e) = ctx.send(init).await {
                warn!("{} could not initialize child {}: {}", self.role(), child, e);
            }
        }

        ctx.timer().register(Arc::new(HeartbeatTick {
            core: Arc::clone(this),
            ctx: ctx.clone(),
        }));

        if self.config.first_in_network {
            ctx.registry().mark_first_in_network(self.role().container());
        }
        if self.config.first_in_network || self.config.parent.is_none() {
            self.transition(SkillState::Ready);
            self.on_ready(ctx).await;
        } else {
            self.transition(SkillState::IsolatedFromNetwork);
        }
        Ok(())
    }

    /// `JoinAcknowledgedTask` or, for aggregators, `PerformMissionTask`:
    /// the parent has accepted this role.
    async fn accepted(&self, ctx: &SkillContext, message: &Message) -> Result<(), DispatchError> {
        match self.state() {
            SkillState::Uninitialized => {
                self.reply(ctx, message.not_permitted("not initialized")).await
            }
            SkillState::IsolatedFromNetwork => {
                ctx.registry().record_alive(message.sender().container());
                if self.transition(SkillState::Ready) {
                    self.on_ready(ctx).await;
                }
                Ok(())
            }
            SkillState::Ready => {
                debug!("{} already READY, ignoring {}", self.role(), message.operation());
                Ok(())
            }
        }
    }

    /// Aggregators accept their children once they are part of the network.
    async fn on_ready(&self, ctx: &SkillContext) {
        if !self.capabilities.has_children {
            return;
        }
        for child in &self.config.children {
            let ack = Message::builder(self.role().clone(), child.clone(), Operation::JoinAcknowledgedTask)
                .sender_service(HEARTBEAT_SERVICE)
                .recipient_service(HEARTBEAT_SERVICE)
                .build();
            if let Err(e) = ctx.send(ack).await {
                warn!("{} could not accept child {}: {}", self.role(), child, e);
            }
        }
    }

    async fn keep_alive(&self, ctx: &SkillContext, message: &Message) -> Result<(), DispatchError> {
        if self.state() == SkillState::Uninitialized {
            return self.reply(ctx, message.not_permitted("not initialized")).await;
        }
        self.observe(ctx, message.sender());
        self.reply(
            ctx,
            message
                .reply(Operation::KeepAliveAcknowledgedTask)
                .build(),
        )
        .await
    }

    async fn join_request(&self, ctx: &SkillContext, message: &Message) -> Result<(), DispatchError> {
        if self.state() == SkillState::Uninitialized {
            return self.reply(ctx, message.not_permitted("not initialized")).await;
        }
        info!("{} joins the network through {}", message.sender(), self.role());
        self.observe(ctx, message.sender());
        self.reply(ctx, message.reply(Operation::JoinAcknowledgedTask).build())
            .await
    }

    fn observe(&self, ctx: &SkillContext, peer: &QualifiedName) {
        self.inbound.lock().insert(peer.clone(), Instant::now());
        ctx.registry().record_alive(peer.container());
    }

    /// Moves to `next`.  `READY` is never left.
    fn transition(&self, next: SkillState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return false;
        }
        if *state == SkillState::Ready {
            error!("{} refused to leave READY for {}", self.role(), next);
            return false;
        }
        info!("{}: {} -> {}", self.role(), *state, next);
        *state = next;
        true
    }

    async fn reply(&self, ctx: &SkillContext, reply: Message) -> Result<(), DispatchError> {
        let recipient = reply.recipient().clone();
        if let Err(e) = ctx.send(reply).await {
            warn!("{} could not answer {}: {}", self.role(), recipient, e);
        }
        Ok(())
    }

    /// Stamps the outbound time if a send is due.
    fn outbound_due(&self, now: Instant) -> bool {
        let mut last_sent = self.last_sent.lock();
        let due = last_sent.map_or(true, |sent| {
            now.saturating_duration_since(sent) > self.config.send_period
        });
        if due {
            *last_sent = Some(now);
        }
        due
    }

    async fn tick(&self, ctx: &SkillContext, now: Instant) {
        let Some(parent) = self.config.parent.clone() else {
            if self.state() == SkillState::Ready {
                self.sweep(ctx, now);
            }
            return;
        };

        match self.state() {
            SkillState::Uninitialized => {}
            SkillState::IsolatedFromNetwork => {
                // Leaves wait for their container; aggregators ask to join.
                if self.capabilities.has_children && self.outbound_due(now) {
                    self.send_to_parent(ctx, parent, Operation::JoinNetworkSingletonAgentInfo)
                        .await;
                }
            }
            SkillState::Ready => {
                if self.outbound_due(now) {
                    self.send_to_parent(ctx, parent, Operation::KeepAliveInfo).await;
                }
                self.sweep(ctx, now);
            }
        }
    }

    async fn send_to_parent(&self, ctx: &SkillContext, parent: QualifiedName, operation: Operation) {
        let message = Message::builder(self.role().clone(), parent.clone(), operation)
            .sender_service(HEARTBEAT_SERVICE)
            .recipient_service(HEARTBEAT_SERVICE)
            .build();
        let operation = message.operation().clone();
        if let Err(e) = ctx.send(message).await {
            warn!("{} could not send {} to {}: {}", self.role(), operation, parent, e);
        }
    }

    fn sweep(&self, ctx: &SkillContext, now: Instant) -> Vec<String> {
        let local = self.role().container();
        // Container -> every peer of it is stale.
        let mut silent: BTreeMap<String, bool> = BTreeMap::new();
        for (peer, heard) in self.inbound.lock().iter() {
            if peer.container() == local {
                continue;
            }
            let stale = now.saturating_duration_since(*heard) > self.config.receive_timeout;
            *silent.entry(peer.container().to_owned()).or_insert(true) &= stale;
        }
        let missing: Vec<String> = silent
            .into_iter()
            .filter_map(|(container, stale)| stale.then_some(container))
            .collect();
        for container in &missing {
            if ctx.registry().record_missing(container) {
                warn!("Container {} missed its heartbeats to {}", container, self.role());
            }
        }
        missing
    }
}

/// The recurring timer task a heartbeat role registers when initialized.
struct HeartbeatTick {
    core: Arc<HeartbeatCore>,
    ctx: SkillContext,
}

#[async_trait]
impl TimerTask for HeartbeatTick {
    async fn on_tick(&self, now: Instant) {
        self.core.tick(&self.ctx, now).await;
    }

    fn name(&self) -> String {
        format!("heartbeat:{}", self.core.role())
    }
}
