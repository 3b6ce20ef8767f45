//! Forward and backward linked waypoint chains per destination cell.
use bevy::{log, math::IVec2};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::portal::PortalId;

/// Upper bound on chain walks, only reached if the cache contains a cycle.
const MAX_CHAIN_LENGTH: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheLink {
    pub(crate) next: Option<PortalId>,
    pub(crate) previous: Option<PortalId>,
}

#[derive(Debug, Default)]
pub(crate) struct WaypointCache {
    links: FxHashMap<PortalId, FxHashMap<IVec2, CacheLink>>,
}

impl WaypointCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.links.values().map(|row| row.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn link(&self, portal: PortalId, target: IVec2) -> Option<CacheLink> {
        self.links.get(&portal)?.get(&target).copied()
    }

    /// Records a waypoint chain leading to the absolute cell `target`.
    pub(crate) fn store(&mut self, target: IVec2, waypoints: &[PortalId]) {
        if waypoints.len() % 2 != 0 {
            log::error!(
                "Refusing to cache an odd waypoint chain of length {} to {}",
                waypoints.len(),
                target
            );
            return;
        }

        for (i, &portal) in waypoints.iter().enumerate() {
            let link = CacheLink {
                next: waypoints.get(i + 1).copied(),
                previous: i.checked_sub(1).map(|p| waypoints[p]),
            };
            self.links.entry(portal).or_default().insert(target, link);
        }
    }

    /// Returns the cached chain from `from` to `target`.
    ///
    /// If the portal after `from` lies in the same tile the chain starts there instead,
    /// so the result always begins with a departure portal. Chains with odd length or
    /// broken links are treated as misses.
    pub(crate) fn lookup(&self, from: PortalId, target: IVec2) -> Option<Vec<PortalId>> {
        let link = self.link(from, target)?;

        let mut current = match link.next {
            Some(next) if next.tile == from.tile => next,
            _ => from,
        };

        let mut waypoints = Vec::new();
        for _ in 0..MAX_CHAIN_LENGTH {
            waypoints.push(current);
            match self.link(current, target)?.next {
                Some(next) => current = next,
                None => return (waypoints.len() % 2 == 0).then_some(waypoints),
            }
        }

        log::error!(
            "Waypoint cache chain from {:?} to {} exceeds {} entries",
            from,
            target,
            MAX_CHAIN_LENGTH
        );
        None
    }

    /// Removes every chain to `target`.
    pub(crate) fn remove_target(&mut self, target: IVec2) -> usize {
        let mut removed = 0;
        for row in self.links.values_mut() {
            if row.remove(&target).is_some() {
                removed += 1;
            }
        }
        self.links.retain(|_, row| !row.is_empty());
        removed
    }

    /// Excises every chain passing through one of `portals`, then drops any link left
    /// pointing into `dead_tile`.
    pub(crate) fn invalidate(&mut self, portals: &[PortalId], dead_tile: IVec2) -> usize {
        let before = self.len();

        for &portal in portals {
            let targets: Vec<IVec2> = match self.links.get(&portal) {
                Some(row) => row.keys().copied().collect(),
                None => continue,
            };

            for target in targets {
                self.excise_chain(portal, target);
            }
        }

        self.sweep(dead_tile);
        self.links.retain(|_, row| !row.is_empty());
        before - self.len()
    }

    fn excise_chain(&mut self, portal: PortalId, target: IVec2) {
        let Some(start) = self.remove_link(portal, target) else {
            return;
        };

        let mut forward = start.next;
        let mut backward = start.previous;
        for _ in 0..MAX_CHAIN_LENGTH {
            if forward.is_none() && backward.is_none() {
                return;
            }
            forward = forward.and_then(|p| self.remove_link(p, target)).and_then(|l| l.next);
            backward = backward
                .and_then(|p| self.remove_link(p, target))
                .and_then(|l| l.previous);
        }

        log::error!(
            "Waypoint cache invalidation from {:?} to {} did not terminate",
            portal,
            target
        );
    }

    /// Drops links into `dead_tile` and links whose neighbour no longer holds the same target,
    /// until no partial chain remains.
    fn sweep(&mut self, dead_tile: IVec2) {
        self.links.retain(|portal, _| portal.tile != dead_tile);

        loop {
            let mut broken: Vec<(PortalId, IVec2)> = Vec::new();
            for (&portal, row) in self.links.iter() {
                for (&target, link) in row.iter() {
                    let dangling = |p: Option<PortalId>| match p {
                        Some(p) => p.tile == dead_tile || self.link(p, target).is_none(),
                        None => false,
                    };
                    if dangling(link.next) || dangling(link.previous) {
                        broken.push((portal, target));
                    }
                }
            }

            if broken.is_empty() {
                return;
            }

            for (portal, target) in broken {
                self.remove_link(portal, target);
            }
        }
    }

    fn remove_link(&mut self, portal: PortalId, target: IVec2) -> Option<CacheLink> {
        self.links.get_mut(&portal)?.remove(&target)
    }

    pub(crate) fn clear(&mut self) {
        self.links.clear();
    }
}
