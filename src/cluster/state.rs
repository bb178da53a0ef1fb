//! Node lifecycle phases

use serde::Serialize;

/// Lifecycle phase of the coordination layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodePhase {
    /// Constructed, bootstrap not started
    Unready,
    /// Host role: launching the store instance
    HostStarting,
    /// Client role: connecting and validating the cluster
    ClientConnecting,
    /// Bootstrap finished, background tasks running
    Ready,
    /// A background task is failing; retried on its next tick
    Degraded,
    /// Closed, no further transitions
    Closed,
}

impl NodePhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, NodePhase::Ready | NodePhase::Degraded)
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Unready => write!(f, "UNREADY"),
            NodePhase::HostStarting => write!(f, "HOST_STARTING"),
            NodePhase::ClientConnecting => write!(f, "CLIENT_CONNECTING"),
            NodePhase::Ready => write!(f, "READY"),
            NodePhase::Degraded => write!(f, "DEGRADED"),
            NodePhase::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Lifecycle of a launched store instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostState::Stopped => write!(f, "STOPPED"),
            HostState::Starting => write!(f, "STARTING"),
            HostState::Ready => write!(f, "READY"),
            HostState::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Flip between Ready and Degraded after a background tick.
///
/// Bootstrap phases and Closed are left untouched.
pub(crate) fn mark_health(phase: &tokio::sync::watch::Sender<NodePhase>, healthy: bool) {
    phase.send_if_modified(|current| {
        let next = match (*current, healthy) {
            (NodePhase::Degraded, true) => NodePhase::Ready,
            (NodePhase::Ready, false) => NodePhase::Degraded,
            _ => return false,
        };
        tracing::info!("node phase {} -> {}", current, next);
        *current = next;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_health() {
        let (phase, rx) = tokio::sync::watch::channel(NodePhase::Ready);
        mark_health(&phase, false);
        assert_eq!(*rx.borrow(), NodePhase::Degraded);
        mark_health(&phase, true);
        assert_eq!(*rx.borrow(), NodePhase::Ready);

        phase.send_replace(NodePhase::Closed);
        mark_health(&phase, true);
        assert_eq!(*rx.borrow(), NodePhase::Closed);
    }
}
