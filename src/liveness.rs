//! Shared liveness table of the containers this container has observed.
//!
//! Entries are created on first observation (a keep-alive, or a noticed
//! absence) and never removed.  Consumers either poll the registry or
//! subscribe to transitions; a missing heartbeat is never an error.

use std::collections::HashMap;

use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub alive: bool,
    /// The first container of the network has no parent to join.
    pub first_in_network: bool,
}

/// A change of a container's liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Alive(String),
    Missing(String),
}

pub struct LivenessRegistry {
    containers: RwLock<HashMap<String, ContainerInfo>>,
    events: broadcast::Sender<LivenessEvent>,
}

impl Default for LivenessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            containers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Records a sign of life.  Returns true when the container was not
    /// known to be alive before.
    pub fn record_alive(&self, container: &str) -> bool {
        let changed = self.set_alive(container, true);
        if changed {
            info!("Container {} is alive", container);
            let _ = self.events.send(LivenessEvent::Alive(container.to_owned()));
        }
        changed
    }

    /// Records a missing heartbeat.  Returns true on the alive -> dead
    /// transition (or when the container is first observed missing).
    pub fn record_missing(&self, container: &str) -> bool {
        let changed = self.set_alive(container, false);
        if changed {
            warn!("Container {} missed its heartbeat", container);
            let _ = self.events.send(LivenessEvent::Missing(container.to_owned()));
        }
        changed
    }

    fn set_alive(&self, container: &str, alive: bool) -> bool {
        let mut containers = self.containers.write();
        match containers.get_mut(container) {
            Some(info) if info.alive == alive => false,
            Some(info) => {
                info.alive = alive;
                true
            }
            None => {
                containers.insert(
                    container.to_owned(),
                    ContainerInfo {
                        name: container.to_owned(),
                        alive,
                        first_in_network: false,
                    },
                );
                true
            }
        }
    }

    pub fn mark_first_in_network(&self, container: &str) {
        self.containers
            .write()
            .entry(container.to_owned())
            .or_insert_with(|| ContainerInfo {
                name: container.to_owned(),
                alive: true,
                first_in_network: false,
            })
            .first_in_network = true;
    }

    pub fn get(&self, container: &str) -> Option<ContainerInfo> {
        self.containers.read().get(container).cloned()
    }

    /// `None` when the container has never been observed.
    pub fn is_alive(&self, container: &str) -> Option<bool> {
        self.containers.read().get(container).map(|info| info.alive)
    }

    pub fn snapshot(&self) -> Vec<ContainerInfo> {
        let mut all: Vec<ContainerInfo> = self.containers.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_reported_once() {
        let registry = LivenessRegistry::new();
        assert_eq!(registry.is_alive("beta"), None);

        assert!(registry.record_alive("beta"));
        assert!(!registry.record_alive("beta"));
        assert!(registry.record_missing("beta"));
        assert!(!registry.record_missing("beta"));
        assert_eq!(registry.is_alive("beta"), Some(false));
    }

    #[test]
    fn absence_creates_a_dead_entry() {
        let registry = LivenessRegistry::new();
        assert!(registry.record_missing("gamma"));
        let info = registry.get("gamma").unwrap();
        assert!(!info.alive);
        assert!(!info.first_in_network);
    }

    #[test]
    fn first_container_flag_survives_liveness_changes() {
        let registry = LivenessRegistry::new();
        registry.mark_first_in_network("alpha");
        registry.record_missing("alpha");
        registry.record_alive("beta");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "alpha");
        assert!(snapshot[0].first_in_network);
        assert!(!snapshot[0].alive);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let registry = LivenessRegistry::new();
        let mut events = registry.subscribe();
        registry.record_alive("beta");
        registry.record_alive("beta");
        registry.record_missing("beta");

        assert_eq!(events.recv().await.unwrap(), LivenessEvent::Alive("beta".into()));
        assert_eq!(events.recv().await.unwrap(), LivenessEvent::Missing("beta".into()));
        assert!(events.try_recv().is_err());
    }
}
