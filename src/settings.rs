//! Configuration for the [`crate::manager::PathManager`].
use bevy::math::Vec2;

use crate::point::TilePoint;

/// Affine mapping from world positions to absolute grid cells.
///
/// `cell = world * scale + translation`, floored to the containing cell.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WorldTransform {
    pub scale: Vec2,
    pub translation: Vec2,
}

impl Default for WorldTransform {
    fn default() -> Self {
        WorldTransform {
            scale: Vec2::ONE,
            translation: Vec2::ZERO,
        }
    }
}

impl WorldTransform {
    /// Position in continuous cell units.
    pub fn to_grid(&self, world: Vec2) -> Vec2 {
        world * self.scale + self.translation
    }

    /// Direction in cell units converted back to world units, not normalized.
    pub fn to_world_dir(&self, dir: Vec2) -> Vec2 {
        dir / self.scale
    }
}

/// Settings for how agents are steered once a direction is known.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SteeringSettings {
    /// World distance to the target at which an agent counts as arrived.
    pub acceptance_radius: f32,
    /// Bonus for tied neighbours aligned with the agent's velocity.
    pub velocity_bonus: f32,
    /// Bonus for tied neighbours aligned with the portal after the next one.
    pub waypoint_bonus: f32,
    /// If true, agents avoid stepping into cells already occupied or claimed this tick.
    pub collision_avoidance: bool,
    /// Steering scale applied when avoidance finds no free cell.
    pub slowdown: f32,
}

impl Default for SteeringSettings {
    fn default() -> Self {
        SteeringSettings {
            acceptance_radius: 0.5,
            velocity_bonus: 0.25,
            waypoint_bonus: 0.2,
            collision_avoidance: false,
            slowdown: 0.25,
        }
    }
}

/// Settings for waypoint and flow field caching.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CacheSettings {
    /// Solve 2x2 block fields when the route turns diagonally across a tile corner.
    pub lookahead: bool,
    /// Let portal searches finish early by merging into cached routes.
    pub path_cache_merging: bool,
    /// Tiles within this Chebyshev distance of a search's start never merge.
    pub merge_radius: u32,
    /// Ticks between sweeps of flow fields no agent is using. Zero disables sweeping.
    pub eviction_interval: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            lookahead: true,
            path_cache_merging: true,
            merge_radius: 1,
            eviction_interval: 300,
        }
    }
}

/// Settings for background flow field generation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    /// Size of the worker pool. Ignored without the `parallel` feature.
    pub threads: usize,
    /// Maximum finished fields committed to the caches per tick.
    pub max_commits_per_tick: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            threads: 2,
            max_commits_per_tick: 8,
        }
    }
}

/// Holder for internal crate settings.
#[derive(Clone, Debug)]
pub struct FlowPathSettings(pub(crate) FlowPathInternalSettings);

impl FlowPathSettings {
    pub fn tile_length(&self) -> usize {
        self.0.tile_length
    }

    pub fn transform(&self) -> &WorldTransform {
        &self.0.transform
    }

    pub fn steering(&self) -> &SteeringSettings {
        &self.0.steering
    }

    pub fn cache(&self) -> &CacheSettings {
        &self.0.cache
    }

    pub fn workers(&self) -> &WorkerSettings {
        &self.0.workers
    }
}

impl Default for FlowPathSettings {
    fn default() -> Self {
        FlowPathSettingsBuilder::default().build()
    }
}

/// Builder for `FlowPathSettings`.
///
/// Example usage:
/// ```
/// use bevy::math::Vec2;
/// use bevy_flowpath::prelude::*;
///
/// let settings = FlowPathSettingsBuilder::new(32)
///     .world_scale(Vec2::splat(0.5))
///     .acceptance_radius(1.0)
///     .enable_collision_avoidance()
///     .worker_threads(4)
///     .build();
///
/// let manager = PathManager::new(settings);
/// assert_eq!(manager.engine().tile_length(), 32);
/// ```
#[derive(Clone, Debug)]
pub struct FlowPathSettingsBuilder {
    tile_length: usize,
    transform: WorldTransform,
    steering: SteeringSettings,
    cache: CacheSettings,
    workers: WorkerSettings,
}

impl Default for FlowPathSettingsBuilder {
    fn default() -> Self {
        FlowPathSettingsBuilder {
            tile_length: 32,
            transform: WorldTransform::default(),
            steering: SteeringSettings::default(),
            cache: CacheSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

impl FlowPathSettingsBuilder {
    /// Square tiles with `tile_length` cells per side. Must be at least 2.
    pub fn new(tile_length: usize) -> Self {
        if tile_length < 2 {
            panic!("Tile length must be at least 2");
        }

        FlowPathSettingsBuilder {
            tile_length,
            ..Default::default()
        }
    }

    /// Multiplier from world units to cells.
    pub fn world_scale(mut self, scale: Vec2) -> Self {
        if scale.x == 0.0 || scale.y == 0.0 {
            panic!("World scale must be non-zero");
        }
        self.transform.scale = scale;
        self
    }

    /// Offset in cells added after scaling.
    pub fn world_translation(mut self, translation: Vec2) -> Self {
        self.transform.translation = translation;
        self
    }

    pub fn acceptance_radius(mut self, radius: f32) -> Self {
        if radius < 0.0 {
            panic!("Acceptance radius must not be negative");
        }
        self.steering.acceptance_radius = radius;
        self
    }

    /// Weights added to tied neighbours that line up with the agent's velocity
    /// or the upcoming waypoint.
    pub fn tie_break_bonus(mut self, velocity: f32, waypoint: f32) -> Self {
        self.steering.velocity_bonus = velocity;
        self.steering.waypoint_bonus = waypoint;
        self
    }

    pub fn enable_collision_avoidance(mut self) -> Self {
        self.steering.collision_avoidance = true;
        self
    }

    /// Steering scale used when avoidance has nowhere to go. Must be in [0, 1].
    pub fn slowdown(mut self, factor: f32) -> Self {
        if !(0.0..=1.0).contains(&factor) {
            panic!("Slowdown must be between 0 and 1");
        }
        self.steering.slowdown = factor;
        self
    }

    pub fn disable_lookahead(mut self) -> Self {
        self.cache.lookahead = false;
        self
    }

    pub fn disable_path_cache_merging(mut self) -> Self {
        self.cache.path_cache_merging = false;
        self
    }

    pub fn merge_radius(mut self, tiles: u32) -> Self {
        self.cache.merge_radius = tiles;
        self
    }

    pub fn eviction_interval(mut self, ticks: u32) -> Self {
        self.cache.eviction_interval = ticks;
        self
    }

    /// Must be at least 1.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        if threads == 0 {
            panic!("Worker pool needs at least one thread");
        }
        self.workers.threads = threads;
        self
    }

    pub fn max_commits_per_tick(mut self, commits: usize) -> Self {
        self.workers.max_commits_per_tick = commits;
        self
    }

    /// Pass in a [`SteeringSettings`] instead of the individual steering setters.
    pub fn steering_settings(mut self, steering: SteeringSettings) -> Self {
        self.steering = steering;
        self
    }

    /// Pass in a [`CacheSettings`] instead of the individual cache setters.
    pub fn cache_settings(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Pass in a [`WorkerSettings`]. Zero threads is rejected as in [`Self::worker_threads`].
    pub fn worker_settings(mut self, workers: WorkerSettings) -> Self {
        if workers.threads == 0 {
            panic!("Worker pool needs at least one thread");
        }
        self.workers = workers;
        self
    }

    /// Builds the [`FlowPathSettings`] to hand to [`crate::manager::PathManager::new`].
    pub fn build(self) -> FlowPathSettings {
        FlowPathSettings(FlowPathInternalSettings {
            tile_length: self.tile_length,
            transform: self.transform,
            steering: self.steering,
            cache: self.cache,
            workers: self.workers,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FlowPathInternalSettings {
    pub(crate) tile_length: usize,
    pub(crate) transform: WorldTransform,
    pub(crate) steering: SteeringSettings,
    pub(crate) cache: CacheSettings,
    pub(crate) workers: WorkerSettings,
}

impl FlowPathInternalSettings {
    /// Tile and cell under a world position.
    pub(crate) fn tile_point(&self, world: Vec2) -> TilePoint {
        let cell = self.transform.to_grid(world).floor().as_ivec2();
        TilePoint::from_absolute(cell, self.tile_length as i32)
    }
}
