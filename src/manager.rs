//! The [`PathManager`] drives registered agents once per tick.
use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};

use bevy::{
    log,
    math::{IVec2, Vec2},
    prelude::Resource,
};
use rustc_hash::FxHashSet;
use slab::Slab;

use crate::{
    agent::{AgentId, AgentInfo, NavAgent},
    dir::Dir,
    engine::PathEngine,
    error::FlowPathError,
    flow_field::{FieldKey, FlowLeg, FlowMapExtract},
    point::TilePoint,
    portal::PortalId,
    settings::{FlowPathInternalSettings, FlowPathSettings, SteeringSettings},
    task::{read_engine, write_engine, FlowTask, TaskPool},
    FxIndexMap, BLOCKED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Inactive,
    Active,
    /// Arrived or gave up. Waits for a new target or deactivation.
    Finished,
}

#[derive(Debug)]
struct AgentRecord {
    agent: Weak<dyn NavAgent>,
    state: AgentState,
    last_info: Option<AgentInfo>,
    location: Option<TilePoint>,
    target: Option<TilePoint>,
    velocity: Vec2,
    dirty: bool,
    force_search: bool,
    heading: Option<Dir>,
    steering: Vec2,
    waypoints: Vec<PortalId>,
    waypoint_index: usize,
}

impl AgentRecord {
    fn new(agent: Weak<dyn NavAgent>) -> Self {
        AgentRecord {
            agent,
            state: AgentState::Inactive,
            last_info: None,
            location: None,
            target: None,
            velocity: Vec2::ZERO,
            dirty: false,
            force_search: false,
            heading: None,
            steering: Vec2::ZERO,
            waypoints: Vec::new(),
            waypoint_index: 0,
        }
    }

    fn reset(&mut self, state: AgentState) {
        self.state = state;
        self.dirty = state == AgentState::Active;
        self.heading = None;
        self.steering = Vec2::ZERO;
        self.location = None;
        self.target = None;
        self.clear_waypoints();
    }

    fn clear_waypoints(&mut self) {
        self.waypoints.clear();
        self.waypoint_index = 0;
    }

    /// Moves the waypoint pointer after the agent changed tile.
    fn advance(&mut self, tile: IVec2) {
        if self.waypoints.is_empty() {
            return;
        }

        match self.waypoints.get(self.waypoint_index + 1) {
            Some(connected) if connected.tile == tile => self.waypoint_index += 2,
            _ => {
                log::debug!("Agent left its route into tile {}, replanning", tile);
                self.clear_waypoints();
                self.force_search = true;
            }
        }
    }

    fn needs_search(&self, location: TilePoint, target: TilePoint) -> bool {
        self.force_search
            || (self.waypoint_index >= self.waypoints.len() && location.tile != target.tile)
    }
}

/// Outcome of resolving a direction for one agent.
enum Step {
    Move { dir: Dir, provisional: bool },
    /// Inside the target cell, steer straight at the target position.
    Approach,
    Replan,
}

/// Owns the [`PathEngine`], the registered agents and the background field generation.
///
/// Call [`PathManager::tick`] once per frame, or add [`crate::plugin::FlowPathPlugin`]
/// to let the `Update` schedule do it.
#[derive(Resource)]
pub struct PathManager {
    settings: FlowPathSettings,
    engine: Arc<RwLock<PathEngine>>,
    pool: TaskPool,
    tasks: FxIndexMap<(IVec2, FieldKey), FlowTask>,
    agents: Slab<AgentRecord>,
    ticks: u64,
}

impl PathManager {
    pub fn new(settings: FlowPathSettings) -> Self {
        let mut engine = PathEngine::new(settings.tile_length());
        engine.set_cache_merge_radius(settings.cache().merge_radius);

        let pool = TaskPool::new(settings.workers().threads);
        log::debug!(
            "Path manager with tile length {} (threaded workers: {})",
            settings.tile_length(),
            pool.is_threaded()
        );

        PathManager {
            settings,
            engine: Arc::new(RwLock::new(engine)),
            pool,
            tasks: FxIndexMap::default(),
            agents: Slab::new(),
            ticks: 0,
        }
    }

    pub fn settings(&self) -> &FlowPathSettings {
        &self.settings
    }

    /// Read access to the engine. Do not hold the guard across [`PathManager::tick`].
    pub fn engine(&self) -> RwLockReadGuard<'_, PathEngine> {
        read_engine(&self.engine)
    }

    /// Starts steering `agent`. The manager only keeps a weak reference, dropping the
    /// last `Arc` unregisters the agent on the next tick.
    pub fn register_agent<A: NavAgent + 'static>(&mut self, agent: &Arc<A>) -> AgentId {
        let weak: Weak<dyn NavAgent> = Arc::downgrade(agent) as Weak<dyn NavAgent>;
        AgentId(self.agents.insert(AgentRecord::new(weak)))
    }

    pub fn remove_agent(&mut self, id: AgentId) -> bool {
        self.agents.try_remove(id.0).is_some()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Last steering vector written to the agent.
    pub fn agent_steering(&self, id: AgentId) -> Option<Vec2> {
        self.agents.get(id.0).map(|r| r.steering)
    }

    /// Portal waypoints the agent is still following.
    pub fn agent_waypoints(&self, id: AgentId) -> Option<&[PortalId]> {
        self.agents
            .get(id.0)
            .map(|r| &r.waypoints[r.waypoint_index.min(r.waypoints.len())..])
    }

    /// Background fields submitted and not yet committed.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn to_tile_point(&self, world: Vec2) -> TilePoint {
        self.settings.0.tile_point(world)
    }

    /// Replaces a tile and drops every pending field and route that depended on it.
    pub fn update_map_tile(&mut self, coord: IVec2, data: &[u8]) -> Result<(), FlowPathError> {
        if let Err(e) = write_engine(&self.engine).update_map_tile(coord, data) {
            log::warn!("Rejected update of tile {}: {}", coord, e);
            return Err(e);
        }
        self.tile_changed(coord);
        Ok(())
    }

    /// Replaces the tile containing the world position `world`.
    pub fn update_map_tile_world(&mut self, world: Vec2, data: &[u8]) -> Result<(), FlowPathError> {
        let coord = self.to_tile_point(world).tile;
        self.update_map_tile(coord, data)
    }

    /// See [`PathEngine::update_map_tiles_from_raw`].
    pub fn update_map_tiles_from_raw(
        &mut self,
        upper_left: IVec2,
        width: usize,
        height: usize,
        bytes: &[u8],
    ) -> Result<usize, FlowPathError> {
        let loaded =
            write_engine(&self.engine).update_map_tiles_from_raw(upper_left, width, height, bytes)?;

        let length = self.settings.0.tile_length;
        for ty in 0..height.div_ceil(length) {
            for tx in 0..width.div_ceil(length) {
                self.tile_changed(upper_left + IVec2::new(tx as i32, ty as i32));
            }
        }
        Ok(loaded)
    }

    pub fn remove_map_tile(&mut self, coord: IVec2) -> bool {
        let removed = write_engine(&self.engine).remove_map_tile(coord);
        if removed {
            self.tile_changed(coord);
        }
        removed
    }

    fn tile_changed(&mut self, coord: IVec2) {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            if task.depends_on(coord) {
                task.state.cancel();
                false
            } else {
                true
            }
        });

        for (_, record) in self.agents.iter_mut() {
            let on_route = record.waypoints.iter().any(|w| w.tile == coord);
            let inside = record.location.is_some_and(|l| l.tile == coord);
            if on_route || inside {
                record.clear_waypoints();
                record.dirty = true;
            }
        }

        log::debug!(
            "Tile {} changed, cancelled {} field tasks",
            coord,
            before - self.tasks.len()
        );
    }

    /// Existence check between two world positions. Leaves every cache untouched.
    pub fn is_path_possible(&self, world_start: Vec2, world_end: Vec2) -> bool {
        let start = self.to_tile_point(world_start);
        let end = self.to_tile_point(world_end);
        self.engine().is_path_possible(start, end)
    }

    /// Cost of the cell under `world`, [`BLOCKED`] where no tile is loaded.
    pub fn tile_data_for_world_position(&self, world: Vec2) -> u8 {
        let point = self.to_tile_point(world);
        self.engine().get_data_for(point)
    }

    /// Advances every agent by one step.
    pub fn tick(&mut self, delta_seconds: f32) {
        self.ticks += 1;
        self.pool.run_pending();

        let engine_lock = self.engine.clone();
        let mut engine = write_engine(&engine_lock);

        self.commit_finished_tasks(&mut engine);

        let mut snapshot = Vec::with_capacity(self.agents.len());
        let mut dropped = Vec::new();
        for (key, record) in self.agents.iter() {
            match record.agent.upgrade() {
                Some(agent) => {
                    let info = agent.agent_info();
                    snapshot.push((key, agent, info));
                }
                None => dropped.push(key),
            }
        }
        for key in dropped {
            self.agents.remove(key);
            log::debug!("Removed dropped agent {}", key);
        }

        let occupied: FxHashSet<IVec2> = if self.settings.0.steering.collision_avoidance {
            let length = self.settings.0.tile_length as i32;
            snapshot
                .iter()
                .filter(|(_, _, info)| info.active)
                .map(|(_, _, info)| self.to_tile_point(info.location).absolute(length))
                .collect()
        } else {
            FxHashSet::default()
        };

        let mut steer = Steer {
            engine: &mut engine,
            engine_lock: &engine_lock,
            settings: &self.settings.0,
            tasks: &mut self.tasks,
            pool: &mut self.pool,
            occupied,
            reserved: FxHashSet::default(),
        };

        for (key, agent, info) in snapshot {
            if let Some(record) = self.agents.get_mut(key) {
                steer.update(record, agent.as_ref(), info, delta_seconds);
            }
        }

        let interval = self.settings.0.cache.eviction_interval as u64;
        if interval > 0 && self.ticks % interval == 0 {
            let in_use = self.tiles_in_use();
            let evicted = engine.evict_flow_fields(&in_use);
            log::debug!("Evicted {} flow fields outside {} tiles in use", evicted, in_use.len());
        }
    }

    fn commit_finished_tasks(&mut self, engine: &mut PathEngine) {
        let max = self.settings.0.workers.max_commits_per_tick;
        let mut committed = 0;
        let mut i = 0;

        while i < self.tasks.len() {
            let Some((_, task)) = self.tasks.get_index(i) else {
                break;
            };
            if !task.state.is_done() {
                i += 1;
                continue;
            }
            if committed >= max {
                break;
            }

            let Some(((coord, key), task)) = self.tasks.shift_remove_index(i) else {
                break;
            };
            match task.state.take_result() {
                Some(field) => {
                    committed += 1;
                    if !engine.commit_flow_field(coord, task.generation, key, Arc::new(field)) {
                        log::debug!("Discarded stale or duplicate field for tile {}", coord);
                    }
                }
                None => log::debug!("Dropped abandoned field task for tile {}", coord),
            }
        }
    }

    fn tiles_in_use(&self) -> FxHashSet<IVec2> {
        let mut tiles = FxHashSet::default();
        for (_, record) in self.agents.iter() {
            if record.state != AgentState::Active {
                continue;
            }
            tiles.extend(record.location.map(|l| l.tile));
            tiles.extend(record.target.map(|t| t.tile));
            tiles.extend(record.waypoints.iter().map(|w| w.tile));
        }
        tiles
    }
}

/// Per-tick state shared across the agent pass.
struct Steer<'a> {
    engine: &'a mut PathEngine,
    engine_lock: &'a Arc<RwLock<PathEngine>>,
    settings: &'a FlowPathInternalSettings,
    tasks: &'a mut FxIndexMap<(IVec2, FieldKey), FlowTask>,
    pool: &'a mut TaskPool,
    occupied: FxHashSet<IVec2>,
    reserved: FxHashSet<IVec2>,
}

impl Steer<'_> {
    fn update(&mut self, record: &mut AgentRecord, agent: &dyn NavAgent, info: AgentInfo, delta: f32) {
        let previous = record.last_info.replace(info);

        if !info.active {
            if record.state != AgentState::Inactive {
                agent.update_acceleration(Vec2::ZERO);
                record.reset(AgentState::Inactive);
            }
            return;
        }

        match record.state {
            AgentState::Inactive => record.reset(AgentState::Active),
            AgentState::Finished => {
                if previous.is_some_and(|p| p.active && p.target == info.target) {
                    return;
                }
                record.reset(AgentState::Active);
            }
            AgentState::Active => {}
        }

        record.velocity = match previous {
            Some(p) if delta > 0.0 => (info.location - p.location) / delta,
            _ => Vec2::ZERO,
        };

        let radius = self.settings.steering.acceptance_radius;
        if info.location.distance_squared(info.target) <= radius * radius {
            agent.update_acceleration(Vec2::ZERO);
            agent.target_reached();
            record.reset(AgentState::Finished);
            return;
        }

        let location = self.settings.tile_point(info.location);
        let target = self.settings.tile_point(info.target);

        if record.location != Some(location) || record.target != Some(target) {
            record.dirty = true;
        }
        if record.target.is_some_and(|t| t != target) {
            record.clear_waypoints();
        }
        if let Some(last) = record.location {
            if last.tile != location.tile {
                record.advance(location.tile);
            }
        }
        record.location = Some(location);
        record.target = Some(target);

        if record.dirty {
            match self.resolve(record, location, target) {
                Some(Step::Move { dir, provisional }) => {
                    record.heading = Some(dir);
                    record.dirty = provisional;
                }
                Some(Step::Approach) => {
                    record.heading = None;
                    record.dirty = false;
                }
                Some(Step::Replan) | None => {
                    log::debug!("No route from {:?} to {:?}", location, target);
                    agent.update_acceleration(Vec2::ZERO);
                    agent.target_unreachable();
                    record.reset(AgentState::Finished);
                    return;
                }
            }
        }

        let steering = match record.heading {
            Some(dir) => {
                let (dir, scale) = self.avoid(location, dir);
                self.settings.transform.to_world_dir(dir.vector()).normalize_or_zero() * scale
            }
            None => (info.target - info.location).normalize_or_zero(),
        };

        record.steering = steering;
        agent.update_acceleration(steering);
    }

    /// Finds the next step, re-running the portal search at most once.
    fn resolve(&mut self, record: &mut AgentRecord, location: TilePoint, target: TilePoint) -> Option<Step> {
        if self.engine.get_data_for(target) == BLOCKED {
            return None;
        }

        for _ in 0..2 {
            if record.needs_search(location, target) {
                record.force_search = false;
                let merging = self.settings.cache.path_cache_merging;
                let result = self.engine.find_portal_path(location, target, merging);
                if !result.success {
                    return None;
                }

                record.waypoints = result.waypoints;
                record.waypoint_index = 0;
                self.schedule_legs(record, target);
            }

            match self.step(record, location, target) {
                Ok(Step::Replan) => record.force_search = true,
                Ok(step) => return Some(step),
                Err(e) => {
                    log::debug!("Flow lookup at {:?} failed: {}", location, e);
                    record.force_search = true;
                }
            }
            record.clear_waypoints();
        }

        None
    }

    fn step(
        &mut self,
        record: &AgentRecord,
        location: TilePoint,
        target: TilePoint,
    ) -> Result<Step, FlowPathError> {
        let index = record.waypoint_index;

        let Some(&next) = record.waypoints.get(index) else {
            if location.tile != target.tile {
                return Ok(Step::Replan);
            }
            return Ok(match self.engine.fast_flow_map_lookup(location, target, None)? {
                Some(dir) => Step::Move {
                    dir,
                    provisional: false,
                },
                None if location.cell == target.cell => Step::Approach,
                None => Step::Replan,
            });
        };

        let Some(&connected) = record.waypoints.get(index + 1) else {
            return Ok(Step::Replan);
        };
        if next.tile != location.tile {
            return Ok(Step::Replan);
        }

        let lookahead = if self.settings.cache.lookahead {
            record.waypoints.get(index + 3).copied()
        } else {
            None
        };
        let leg = FlowLeg::new(next, connected).with_lookahead(lookahead);

        let pending = self.tasks.contains_key(&(location.tile, leg.key()));
        if !pending {
            if let Some(dir) = self.engine.fast_flow_map_lookup(location, target, Some(leg))? {
                return Ok(Step::Move {
                    dir,
                    provisional: false,
                });
            }
        }

        let extract = if pending {
            self.engine.peek_flow_map_value(location, leg)?
        } else {
            self.engine.get_flow_map_value(location, target, Some(leg))?
        };
        let length = self.settings.tile_length as i32;
        let ahead = record
            .waypoints
            .get(index + 2)
            .and_then(|w| self.engine.portal(*w))
            .map(|p| p.absolute_center(length))
            .unwrap_or(target.absolute(length));
        let toward = (ahead - location.absolute(length)).as_vec2();
        let velocity = record.velocity * self.settings.transform.scale;

        Ok(match tie_break(&extract, &self.settings.steering, velocity, toward) {
            Some(dir) => Step::Move {
                dir,
                provisional: pending,
            },
            None => Step::Replan,
        })
    }

    /// Queues fields for the legs after the current one and for the final tile.
    fn schedule_legs(&mut self, record: &AgentRecord, target: TilePoint) {
        let waypoints = &record.waypoints;
        if waypoints.is_empty() {
            return;
        }

        let mut k = record.waypoint_index + 2;
        while k + 1 < waypoints.len() {
            let lookahead = if self.settings.cache.lookahead {
                waypoints.get(k + 3).copied()
            } else {
                None
            };
            let leg = FlowLeg::new(waypoints[k], waypoints[k + 1]).with_lookahead(lookahead);
            self.schedule(waypoints[k].tile, leg.key());
            k += 2;
        }

        self.schedule(target.tile, FieldKey::Points(vec![target.cell]));
    }

    fn schedule(&mut self, coord: IVec2, key: FieldKey) {
        let id = (coord, key);
        if self.tasks.contains_key(&id) || self.engine.cached_field(coord, &id.1).is_some() {
            return;
        }
        let Some(generation) = self.engine.tile(coord).map(|t| t.generation()) else {
            return;
        };

        let task = FlowTask::new(coord, generation, id.1.clone());
        self.pool.submit(task.job(self.engine_lock.clone()));
        self.tasks.insert(id, task);
    }

    /// Single-cell avoidance: steer around a cell another agent holds or has claimed this tick.
    fn avoid(&mut self, location: TilePoint, dir: Dir) -> (Dir, f32) {
        if !self.settings.steering.collision_avoidance {
            return (dir, 1.0);
        }

        let cell = location.absolute(self.settings.tile_length as i32);
        let choice = {
            // (not occupied, not reserved and passable)
            let check = |d: Dir| {
                let next = cell + d.offset();
                let corners_open = d.corner_offsets().map_or(true, |(a, b)| {
                    self.engine.data_at_absolute(cell + a) != BLOCKED
                        && self.engine.data_at_absolute(cell + b) != BLOCKED
                });
                (
                    !self.occupied.contains(&next),
                    !self.reserved.contains(&next)
                        && corners_open
                        && self.engine.data_at_absolute(next) != BLOCKED,
                )
            };

            if check(dir) == (true, true) {
                Some(dir)
            } else {
                let alternatives = [dir.rotate_left(), dir.rotate_right()];
                alternatives
                    .iter()
                    .copied()
                    .find(|&d| check(d) == (true, true))
                    .or_else(|| alternatives.iter().copied().find(|&d| check(d).1))
            }
        };

        match choice {
            Some(d) => {
                self.reserved.insert(cell + d.offset());
                (d, 1.0)
            }
            None => (dir, self.settings.steering.slowdown),
        }
    }
}

/// Picks among equally cheap neighbours, favouring the current velocity and the
/// direction of the portal after next.
fn tie_break(
    extract: &FlowMapExtract,
    steering: &SteeringSettings,
    velocity: Vec2,
    toward: Vec2,
) -> Option<Dir> {
    let candidates = extract.lowest();
    if candidates.len() <= 1 {
        return candidates.first().copied();
    }

    let velocity = velocity.normalize_or_zero();
    let toward = toward.normalize_or_zero();

    let mut best: Option<(Dir, f32)> = None;
    for dir in candidates {
        let v = dir.vector();
        let score = steering.velocity_bonus * v.dot(velocity) + steering.waypoint_bonus * v.dot(toward);
        match best {
            Some((_, s)) if s >= score => {}
            _ => best = Some((dir, score)),
        }
    }
    best.map(|(dir, _)| dir)
}
