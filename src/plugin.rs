//! Bevy integration: ticks the [`PathManager`] from the `Update` schedule.
use bevy::prelude::*;

use crate::{manager::PathManager, settings::FlowPathSettings};

/// Inserts a [`PathManager`] resource built from `settings` and ticks it every frame.
///
/// Agents are registered on the resource directly, e.g. from a startup system.
#[derive(Default)]
pub struct FlowPathPlugin {
    pub settings: FlowPathSettings,
}

impl FlowPathPlugin {
    pub fn new(settings: FlowPathSettings) -> Self {
        FlowPathPlugin { settings }
    }
}

impl Plugin for FlowPathPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(PathManager::new(self.settings.clone()))
            .add_systems(Update, tick_path_manager.in_set(FlowPathSet));
    }
}

#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowPathSet;

fn tick_path_manager(time: Res<Time>, mut manager: ResMut<PathManager>) {
    manager.tick(time.delta_secs());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInfo, NavAgent};
    use crate::settings::FlowPathSettingsBuilder;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        info: AgentInfo,
        steering: Mutex<Option<Vec2>>,
    }

    impl NavAgent for Recorder {
        fn agent_info(&self) -> AgentInfo {
            self.info
        }

        fn update_acceleration(&self, direction: Vec2) {
            *self.steering.lock().unwrap() = Some(direction);
        }

        fn target_reached(&self) {}

        fn target_unreachable(&self) {}
    }

    #[test]
    fn test_plugin_ticks_manager() {
        let mut app = App::new();
        app.init_resource::<Time>();
        app.add_plugins(FlowPathPlugin::new(FlowPathSettingsBuilder::new(8).build()));

        let agent = Arc::new(Recorder {
            info: AgentInfo::new(Vec2::new(1.5, 1.5), Vec2::new(6.5, 1.5)),
            steering: Mutex::new(None),
        });

        {
            let mut manager = app.world_mut().resource_mut::<PathManager>();
            manager
                .update_map_tile(IVec2::ZERO, &[1; 64])
                .unwrap();
            manager.register_agent(&agent);
        }

        app.update();

        let steering = agent.steering.lock().unwrap().unwrap();
        assert!(steering.x > 0.0);
        assert_eq!(app.world().resource::<PathManager>().agent_count(), 1);
    }
}
