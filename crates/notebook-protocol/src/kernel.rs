use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{CellId, DocumentId};
use crate::output::OutputRecord;

/// Execution state of a document's kernel as reported to observers.
///
/// `Off` is never held by a live session; it is what a process server
/// reports for a document without a kernel, and the last state a session
/// announces when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    #[default]
    Starting,
    Idle,
    Busy,
    Closed,
    Off,
}

impl KernelState {
    /// Maps the `execution_state` field of a kernel status message.
    pub fn from_execution_state(value: &str) -> Option<Self> {
        match value {
            "starting" | "restarting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "dead" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Closed => "closed",
            Self::Off => "off",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Off)
    }
}

/// Receives kernel notifications on behalf of the persistence and
/// event-publishing layers.
#[async_trait]
pub trait KernelObserver: Send + Sync {
    async fn on_state_change(&self, document_id: &DocumentId, state: KernelState);
    async fn on_output(&self, document_id: &DocumentId, cell_id: &CellId, output: OutputRecord);
}

#[cfg(test)]
mod tests {
    use super::KernelState;

    #[test]
    fn execution_states_map_onto_kernel_states() {
        assert_eq!(
            KernelState::from_execution_state("busy"),
            Some(KernelState::Busy)
        );
        assert_eq!(
            KernelState::from_execution_state("restarting"),
            Some(KernelState::Starting)
        );
        assert_eq!(
            KernelState::from_execution_state("dead"),
            Some(KernelState::Closed)
        );
        assert_eq!(KernelState::from_execution_state("sleepy"), None);
    }

    #[test]
    fn kernel_state_serializes_lowercase() {
        let serialized = serde_json::to_string(&KernelState::Off).expect("serialize state");
        assert_eq!(serialized, "\"off\"");
        assert!(KernelState::Closed.is_terminal());
        assert!(!KernelState::Idle.is_terminal());
    }
}
