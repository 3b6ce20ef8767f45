//! The steerable entity contract between the [`crate::manager::PathManager`] and the host.
use bevy::math::Vec2;

/// Key of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub(crate) usize);

impl AgentId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// State an agent reports once per tick, in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AgentInfo {
    pub active: bool,
    pub location: Vec2,
    pub target: Vec2,
    /// Informational grouping, carried through to the host untouched.
    pub group: Option<u32>,
}

impl AgentInfo {
    pub fn new(location: Vec2, target: Vec2) -> Self {
        AgentInfo {
            active: true,
            location,
            target,
            group: None,
        }
    }

    pub fn inactive(location: Vec2) -> Self {
        AgentInfo {
            active: false,
            location,
            target: location,
            group: None,
        }
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }
}

/// An entity the manager can steer.
///
/// Implementors use interior mutability, the manager only holds a weak reference and
/// calls these from the tick thread.
pub trait NavAgent: Send + Sync {
    fn agent_info(&self) -> AgentInfo;

    /// Steering input with a length in `[0, 1]`.
    fn update_acceleration(&self, direction: Vec2);

    /// Called once when the agent arrives within the acceptance radius.
    fn target_reached(&self);

    /// Called once when no route to the target exists.
    fn target_unreachable(&self);
}
