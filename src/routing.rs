use indexmap::IndexMap;
use rstar::{RTree, AABB};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::geometry::{
    approach_angle, cross_product, crosses_interior, lines_intersect, slope_sign, Point, Position,
    Rectangle,
};
use crate::handles::{ObstacleId, PathId, VertexId};
use crate::model::{Obstacle, ObstacleEnvelope, Segment, Vertex, VertexScratch, Winding, CLEARANCE};
use crate::path::{shortest_route, PathRecord, SearchContext, EPSILON, OVAL_CONSTANT};
use crate::trace;

/// How many times obstacles are grown and routes re-tested for new clips.
/// A tradeoff between solve cost and output quality; a pass only re-runs if
/// the previous one changed something.
const NUM_GROW_PASSES: usize = 2;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RoutingError {
    #[error("no obstacle with bounds {0:?}")]
    UnknownObstacle(Rectangle),
    #[error("an obstacle with bounds {0:?} already exists")]
    DuplicateObstacle(Rectangle),
    #[error("unknown or removed path handle")]
    UnknownPath,
}

struct SearchResult {
    found: bool,
    cost: f64,
}

/// Bends a collection of paths around rectangular obstacles.
///
/// The router keeps obstacles and paths between calls; mutations mark the
/// affected paths dirty and [`Router::solve`] re-routes only those, then
/// re-runs the shared passes (corner counting, obstacle growth, winding
/// labeling, ordering, bend materialization) over every path so that routes
/// sharing a corner stay fanned apart.
pub struct Router {
    vertices: Vec<Vertex>,
    vstate: Vec<VertexScratch>,
    free_vertices: Vec<VertexId>,

    obstacles: Vec<Obstacle>,
    free_obstacles: Vec<ObstacleId>,
    registry: IndexMap<Rectangle, ObstacleId>,
    spatial: RTree<ObstacleEnvelope>,

    paths: Vec<PathRecord>,
    free_paths: Vec<PathId>,
    /// Caller-added paths, in insertion order.
    all_paths: Vec<PathId>,
    /// Paths actually searched: children stand in for bendpointed parents.
    working: Vec<PathId>,
    ordered: Vec<PathId>,
    sub_paths: Vec<PathId>,
    /// Worklist for the labeling pass.
    stack: Vec<PathId>,
    grow_pass_changed: bool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            vertices: Vec::new(),
            vstate: Vec::new(),
            free_vertices: Vec::new(),
            obstacles: Vec::new(),
            free_obstacles: Vec::new(),
            registry: IndexMap::new(),
            spatial: RTree::new(),
            paths: Vec::new(),
            free_paths: Vec::new(),
            all_paths: Vec::new(),
            working: Vec::new(),
            ordered: Vec::new(),
            sub_paths: Vec::new(),
            stack: Vec::new(),
            grow_pass_changed: false,
        }
    }


    /// Adds an obstacle and dirties every path its bounds now block.
    pub fn add_obstacle(&mut self, bounds: Rectangle) -> Result<(), RoutingError> {
        if self.registry.contains_key(&bounds) {
            return Err(RoutingError::DuplicateObstacle(bounds));
        }
        let id = self.install_obstacle(bounds);
        self.test_paths(id);
        Ok(())
    }

    /// Removes the obstacle with the given bounds. Unknown bounds are a
    /// no-op reported as an error.
    pub fn remove_obstacle(&mut self, bounds: Rectangle) -> Result<(), RoutingError> {
        let id = self.detach_obstacle(&bounds)?;
        for corner in self.obstacles[id].corners() {
            self.free_vertex(corner);
        }
        self.free_obstacles.push(id);
        Ok(())
    }

    /// Moves or resizes an existing obstacle, keeping its identity.
    pub fn update_obstacle(
        &mut self,
        old_bounds: Rectangle,
        new_bounds: Rectangle,
    ) -> Result<(), RoutingError> {
        if old_bounds != new_bounds && self.registry.contains_key(&new_bounds) {
            return Err(RoutingError::DuplicateObstacle(new_bounds));
        }
        let id = self.detach_obstacle(&old_bounds)?;
        self.reinit_obstacle(id, new_bounds);
        self.registry.insert(new_bounds, id);
        self.spatial.insert(ObstacleEnvelope {
            id,
            bounds: new_bounds,
        });
        self.test_paths(id);
        Ok(())
    }

    pub fn obstacle_count(&self) -> usize {
        self.registry.len()
    }

    fn install_obstacle(&mut self, bounds: Rectangle) -> ObstacleId {
        let tl = self.alloc_vertex(bounds.top_left(), None, Position::NORTH_WEST);
        let tr = self.alloc_vertex(bounds.top_right(), None, Position::NORTH_EAST);
        let bl = self.alloc_vertex(bounds.bottom_left(), None, Position::SOUTH_WEST);
        let br = self.alloc_vertex(bounds.bottom_right(), None, Position::SOUTH_EAST);
        let obstacle = Obstacle {
            bounds,
            center: bounds.center(),
            top_left: tl,
            top_right: tr,
            bottom_left: bl,
            bottom_right: br,
        };
        let id = match self.free_obstacles.pop() {
            Some(id) => {
                self.obstacles[id] = obstacle;
                id
            }
            None => {
                let id = ObstacleId(self.obstacles.len() as u32);
                self.obstacles.push(obstacle);
                id
            }
        };
        for v in [tl, tr, bl, br] {
            self.vertices[v].obs = Some(id);
        }
        self.registry.insert(bounds, id);
        self.spatial.insert(ObstacleEnvelope { id, bounds });
        id
    }

    /// Unregisters the obstacle and dirties every path that could see it,
    /// leaving the record and its vertices for the caller to recycle.
    fn detach_obstacle(&mut self, bounds: &Rectangle) -> Result<ObstacleId, RoutingError> {
        let id = self
            .registry
            .shift_remove(bounds)
            .ok_or(RoutingError::UnknownObstacle(*bounds))?;
        self.spatial.remove(&ObstacleEnvelope {
            id,
            bounds: *bounds,
        });
        for corner in self.obstacles[id].corners() {
            self.dirty_paths_on(corner);
        }
        for i in 0..self.working.len() {
            let pid = self.working[i];
            if !self.paths[pid].is_dirty && self.paths[pid].visible_obstacles.contains(&id) {
                self.paths[pid].is_dirty = true;
            }
        }
        Ok(id)
    }

    fn reinit_obstacle(&mut self, id: ObstacleId, bounds: Rectangle) {
        self.obstacles[id].bounds = bounds;
        self.obstacles[id].center = bounds.center();
        let corners = [
            (self.obstacles[id].top_left, bounds.top_left()),
            (self.obstacles[id].top_right, bounds.top_right()),
            (self.obstacles[id].bottom_left, bounds.bottom_left()),
            (self.obstacles[id].bottom_right, bounds.bottom_right()),
        ];
        for (v, base) in corners {
            self.vertices[v].base = base;
            self.vstate[v].full_reset(base);
        }
    }

    fn dirty_paths_on(&mut self, vertex: VertexId) {
        for i in 0..self.vstate[vertex].paths.len() {
            let pid = self.vstate[vertex].paths[i];
            if self.paths[pid].alive {
                self.paths[pid].is_dirty = true;
            }
        }
    }

    /// Dirties every working path whose current route the new obstacle blocks.
    fn test_paths(&mut self, oid: ObstacleId) {
        let bounds = self.obstacles[oid].bounds;
        for i in 0..self.working.len() {
            let pid = self.working[i];
            if self.paths[pid].is_dirty || self.paths[pid].excluded.contains(&oid) {
                continue;
            }
            for s in 0..self.paths[pid].segments.len() {
                let seg = self.paths[pid].segments[s];
                if self.vertices[seg.start].obs == Some(oid)
                    || self.vertices[seg.end].obs == Some(oid)
                {
                    continue;
                }
                let a = self.vstate[seg.start].pos;
                let b = self.vstate[seg.end].pos;
                if bounds.contains_proper(a)
                    || bounds.contains_proper(b)
                    || crosses_interior(a, b, &bounds)
                {
                    self.paths[pid].is_dirty = true;
                    break;
                }
            }
        }
    }


    /// Registers a new connection to route. The returned handle stays valid
    /// until [`Router::remove_path`].
    pub fn add_path(&mut self, start: Point, end: Point) -> PathId {
        let s = self.alloc_vertex(start, None, Position::NONE);
        let e = self.alloc_vertex(end, None, Position::NONE);
        let pid = self.alloc_path(PathRecord::new(s, e));
        self.all_paths.push(pid);
        self.working.push(pid);
        pid
    }

    pub fn remove_path(&mut self, pid: PathId) -> Result<(), RoutingError> {
        self.check_path(pid)?;
        if !self.paths[pid].children.is_empty() {
            self.ditch_children(pid);
        } else {
            self.working.retain(|&p| p != pid);
        }
        self.all_paths.retain(|&p| p != pid);
        let start = self.paths[pid].start;
        let end = self.paths[pid].end;
        self.free_vertex(start);
        self.free_vertex(end);
        // Caller-held handles never get recycled; only internal child and
        // subpath slots go back on the free list.
        self.paths[pid].alive = false;
        Ok(())
    }

    pub fn set_endpoints(
        &mut self,
        pid: PathId,
        start: Point,
        end: Point,
    ) -> Result<(), RoutingError> {
        self.check_path(pid)?;
        let s = self.paths[pid].start;
        let e = self.paths[pid].end;
        self.vertices[s].base = start;
        self.vstate[s].full_reset(start);
        self.vertices[e].base = end;
        self.vstate[e].full_reset(end);
        self.paths[pid].is_dirty = true;
        Ok(())
    }

    /// Sets the ordered user waypoints the route must pass through. The path
    /// is decomposed into one child search per waypoint-bounded piece at the
    /// next solve.
    pub fn set_bendpoints(&mut self, pid: PathId, points: Vec<Point>) -> Result<(), RoutingError> {
        self.check_path(pid)?;
        self.paths[pid].bendpoints = points;
        self.paths[pid].is_dirty = true;
        Ok(())
    }

    /// Declares obstacle bounds this path may pass straight through.
    pub fn set_excluded_obstacles(
        &mut self,
        pid: PathId,
        rects: Vec<Rectangle>,
    ) -> Result<(), RoutingError> {
        self.check_path(pid)?;
        self.paths[pid].excluded_rects = rects;
        self.paths[pid].is_dirty = true;
        Ok(())
    }

    /// The path's routed point sequence. Empty while the path is unsolved or
    /// unroutable.
    pub fn points(&self, pid: PathId) -> Result<&[Point], RoutingError> {
        self.check_path(pid)?;
        Ok(&self.paths[pid].points)
    }

    pub fn is_routed(&self, pid: PathId) -> bool {
        self.paths
            .get(pid.0 as usize)
            .map(|rec| rec.alive && !rec.points.is_empty())
            .unwrap_or(false)
    }

    pub fn path_count(&self) -> usize {
        self.all_paths.len()
    }

    fn check_path(&self, pid: PathId) -> Result<(), RoutingError> {
        match self.paths.get(pid.0 as usize) {
            Some(rec) if rec.alive => Ok(()),
            _ => Err(RoutingError::UnknownPath),
        }
    }


    /// Runs the full pipeline and returns how many paths were re-searched.
    /// With no intervening mutation a second call performs zero searches and
    /// reproduces the same point sequences.
    pub fn solve(&mut self) -> usize {
        self.update_child_paths();
        let solved = self.solve_dirty_paths();
        debug!(searched = solved, paths = self.working.len(), "search phase done");
        self.count_vertices();
        self.check_vertex_intersections();
        self.grow_obstacles();
        self.label_paths();
        self.order_paths();
        self.bend_paths();
        self.reconnect_subpaths();
        self.populate_parent_paths();
        trace::dump_solve_snapshot(|| self.solve_snapshot(solved));
        solved
    }

    /// Re-syncs bendpointed parents with their child paths. Children are
    /// regenerated only when the parent itself changed; the parent hands its
    /// dirty flag off to the fresh children so an unchanged model stays
    /// settled.
    fn update_child_paths(&mut self) {
        for i in 0..self.all_paths.len() {
            let pid = self.all_paths[i];
            if !self.paths[pid].is_dirty {
                continue;
            }
            let had_children = !self.paths[pid].children.is_empty();
            if had_children {
                self.ditch_children(pid);
            }
            let bendpoints = self.paths[pid].bendpoints.clone();
            if !bendpoints.is_empty() {
                self.working.retain(|&p| p != pid);
                let parent_start = self.paths[pid].start;
                let parent_end = self.paths[pid].end;
                let excluded_rects = self.paths[pid].excluded_rects.clone();
                let mut children = Vec::with_capacity(bendpoints.len() + 1);
                let mut prev = parent_start;
                for bp in &bendpoints {
                    let joint = self.alloc_vertex(*bp, None, Position::NONE);
                    let child = self.alloc_path(PathRecord::new(prev, joint));
                    self.paths[child].parent = Some(pid);
                    self.paths[child].excluded_rects = excluded_rects.clone();
                    self.working.push(child);
                    children.push(child);
                    prev = joint;
                }
                let last = self.alloc_path(PathRecord::new(prev, parent_end));
                self.paths[last].parent = Some(pid);
                self.paths[last].excluded_rects = excluded_rects;
                self.working.push(last);
                children.push(last);
                self.paths[pid].children = children;
                self.paths[pid].is_dirty = false;
            } else if had_children {
                // Bendpoints were removed; the parent routes itself again.
                self.working.push(pid);
            }
        }
    }

    fn ditch_children(&mut self, pid: PathId) {
        let children = std::mem::take(&mut self.paths[pid].children);
        let parent_end = self.paths[pid].end;
        for &child in &children {
            self.working.retain(|&p| p != child);
            // Each child owns its end joint except the last, which borrows
            // the parent's end vertex.
            let joint = self.paths[child].end;
            if joint != parent_end {
                self.free_vertex(joint);
            }
            self.free_path(child);
        }
    }

    fn solve_dirty_paths(&mut self) -> usize {
        let mut solved = 0;
        for i in 0..self.working.len() {
            let pid = self.working[i];
            self.refresh_excluded_obstacles(pid);
            if !self.paths[pid].is_dirty {
                self.paths[pid].reset();
                continue;
            }
            solved += 1;
            self.full_reset_path(pid);
            let mut result = self.search_path(pid);
            if !result.found || result.cost > self.paths[pid].threshold {
                // Either no route, or the route was degenerate under a stale
                // threshold; retry once unconstrained.
                self.full_reset_path(pid);
                self.paths[pid].threshold = 0.0;
                result = self.search_path(pid);
            }
            if !result.found {
                debug!(path = pid.0, "no route between endpoints");
            }
            self.paths[pid].is_dirty = false;
        }
        self.reset_vertex_scratch();
        solved
    }

    fn refresh_excluded_obstacles(&mut self, pid: PathId) {
        let resolved: Vec<ObstacleId> = self.paths[pid]
            .excluded_rects
            .iter()
            .filter_map(|r| self.registry.get(r).copied())
            .collect();
        if resolved != self.paths[pid].excluded {
            self.paths[pid].excluded = resolved;
            self.paths[pid].is_dirty = true;
        }
    }

    fn full_reset_path(&mut self, pid: PathId) {
        let start_p = self.vstate[self.paths[pid].start].pos;
        let end_p = self.vstate[self.paths[pid].end].pos;
        let straight = start_p.distance(&end_p);
        let rec = &mut self.paths[pid];
        rec.threshold = if rec.prev_cost_ratio == 0.0 {
            straight * OVAL_CONSTANT
        } else {
            rec.prev_cost_ratio * EPSILON * straight
        };
        rec.segments.clear();
        rec.visible_obstacles.clear();
        rec.reset();
    }

    fn search_path(&mut self, pid: PathId) -> SearchResult {
        let start = self.paths[pid].start;
        let end = self.paths[pid].end;
        let threshold = self.paths[pid].threshold;
        let excluded = self.paths[pid].excluded.clone();
        let mut visible = std::mem::take(&mut self.paths[pid].visible_obstacles);

        let ctx = SearchContext {
            vstate: &self.vstate,
            obstacles: &self.obstacles,
            registry: &self.registry,
        };
        let outcome = shortest_route(&ctx, start, end, threshold, &excluded, &mut visible);

        let straight = self.vstate[start].pos.distance(&self.vstate[end].pos);
        let rec = &mut self.paths[pid];
        rec.visible_obstacles = visible;
        match outcome {
            Some(out) => {
                if straight > 0.0 {
                    rec.prev_cost_ratio = out.cost / straight;
                }
                let cost = out.cost;
                rec.segments = out.segments;
                SearchResult { found: true, cost }
            }
            None => SearchResult {
                found: false,
                cost: 0.0,
            },
        }
    }

    /// Rebuilds each corner's route count from the current raw chains.
    fn count_vertices(&mut self) {
        for i in 0..self.working.len() {
            let pid = self.working[i];
            let n = self.paths[pid].segments.len();
            for s in 0..n.saturating_sub(1) {
                let v = self.paths[pid].segments[s].end;
                self.vstate[v].total_count += 1;
            }
        }
    }

    fn check_vertex_intersections(&mut self) {
        for i in 0..self.working.len() {
            let pid = self.working[i];
            let n = self.paths[pid].segments.len();
            for s in 0..n.saturating_sub(1) {
                let v = self.paths[pid].segments[s].end;
                self.check_vertex_for_intersections(v);
            }
        }
    }

    /// Shrinks the vertex's bend offset when the full stack would collide
    /// with a third, nearer obstacle. Memoized until the vertex's route count
    /// changes.
    fn check_vertex_for_intersections(&mut self, v: VertexId) {
        if self.vstate[v].shortest_distance != 0 || self.vstate[v].distance_checked {
            return;
        }
        let corner = self.vertices[v].corner;
        let own = self.vertices[v].obs;
        let vp = self.vstate[v].pos;
        let side = 2 * (self.vstate[v].total_count * CLEARANCE) + 1;
        let y = if corner.has(Position::NORTH) {
            vp.y - side
        } else {
            vp.y
        };
        let x = if corner.has(Position::EAST) {
            vp.x
        } else {
            vp.x - side
        };
        let probe = Rectangle::new(x, y, side, side);
        let envelope = AABB::from_corners(probe.top_left(), probe.bottom_right());

        let mut best = 0;
        for entry in self.spatial.locate_in_envelope_intersecting(&envelope) {
            if Some(entry.id) == own || !probe.intersects(&entry.bounds) {
                continue;
            }
            let pos = entry.bounds.position_of(vp);
            if pos.is_none() {
                continue;
            }
            let y_dist = if pos.has(Position::NORTH) {
                entry.bounds.y - vp.y
            } else {
                vp.y - entry.bounds.bottom() + 1
            };
            let x_dist = if pos.has(Position::EAST) {
                vp.x - entry.bounds.right() + 1
            } else {
                entry.bounds.x - vp.x
            };
            let dist = x_dist.max(y_dist);
            if dist < best || best == 0 {
                best = dist;
            }
        }
        if best != 0 {
            self.vstate[v].shortest_distance = best;
            self.vstate[v].update_offset();
        }
        self.vstate[v].distance_checked = true;
    }


    fn grow_obstacles(&mut self) {
        self.grow_pass_changed = false;
        for i in 0..NUM_GROW_PASSES {
            if i == 0 || self.grow_pass_changed {
                self.grow_obstacles_pass();
            }
        }
    }

    /// Grows every used corner by its stacked-bend extent, re-tests all
    /// routes against the inflated obstacles and splits clipped edges, then
    /// reverts the growth.
    fn grow_obstacles_pass(&mut self) {
        self.for_each_used_corner(|vstate, corner_flags, _| vstate.grow(corner_flags));

        for i in 0..self.working.len() {
            let pid = self.working[i];
            let excluded = self.paths[pid].excluded.clone();
            if self.paths[pid].grown.is_empty() {
                let raw = self.paths[pid].segments.clone();
                for seg in raw {
                    self.test_bent_segment(seg, None, pid, &excluded);
                }
            } else {
                let current = self.paths[pid].grown.clone();
                let mut counter = 0usize;
                for (s, seg) in current.into_iter().enumerate() {
                    counter += self.test_bent_segment(seg, Some(s + counter), pid, &excluded);
                }
            }
        }

        self.for_each_used_corner(|vstate, _, base| vstate.shrink(base));
    }

    fn for_each_used_corner(&mut self, mut apply: impl FnMut(&mut VertexScratch, Position, Point)) {
        for idx in 0..self.registry.len() {
            let Some((_, &oid)) = self.registry.get_index(idx) else {
                continue;
            };
            for corner in self.obstacles[oid].corners() {
                if self.vstate[corner].total_count > 0 {
                    let flags = self.vertices[corner].corner;
                    let base = self.vertices[corner].base;
                    apply(&mut self.vstate[corner], flags, base);
                }
            }
        }
    }

    /// Tests one offset-adjusted edge against every inflated obstacle; on the
    /// first clip, splits it at the nearest corner of that obstacle and
    /// reports the insertion. Returns how many extra edges were inserted.
    fn test_bent_segment(
        &mut self,
        segment: Segment,
        index: Option<usize>,
        pid: PathId,
        excluded: &[ObstacleId],
    ) -> usize {
        let start_obs = self.vertices[segment.start].obs;
        let end_obs = self.vertices[segment.end].obs;
        let a = self.vstate[segment.start].pos;
        let b = self.vstate[segment.end].pos;

        for idx in 0..self.registry.len() {
            let Some((_, &oid)) = self.registry.get_index(idx) else {
                continue;
            };
            if start_obs == Some(oid) || end_obs == Some(oid) || excluded.contains(&oid) {
                continue;
            }
            let obs = self.obstacles[oid];
            let tlp = self.vstate[obs.top_left].pos;
            let trp = self.vstate[obs.top_right].pos;
            let blp = self.vstate[obs.bottom_left].pos;
            let brp = self.vstate[obs.bottom_right].pos;

            // Which pair of inflated diagonals the edge can clip depends on
            // its slope sign.
            let falling = Point::new(tlp.x - CLEARANCE, tlp.y - CLEARANCE);
            let falling_end = Point::new(brp.x + CLEARANCE, brp.y + CLEARANCE);
            let rising = Point::new(blp.x - CLEARANCE, blp.y + CLEARANCE);
            let rising_end = Point::new(trp.x + CLEARANCE, trp.y - CLEARANCE);

            let vertex = if slope_sign(a, b) < 0 {
                if lines_intersect(a, b, falling, falling_end) {
                    Some(self.nearest_vertex(obs.top_left, obs.bottom_right, a, b))
                } else if lines_intersect(a, b, rising, rising_end) {
                    Some(self.nearest_vertex(obs.bottom_left, obs.top_right, a, b))
                } else {
                    None
                }
            } else if lines_intersect(a, b, rising, rising_end) {
                Some(self.nearest_vertex(obs.bottom_left, obs.top_right, a, b))
            } else if lines_intersect(a, b, falling, falling_end) {
                Some(self.nearest_vertex(obs.top_left, obs.bottom_right, a, b))
            } else {
                None
            };
            let Some(vertex) = vertex else {
                continue;
            };

            // Skip the split if the candidate's bend region already collides
            // with a bend region at either end of the edge.
            let v_rect = self.deformed_rect(vertex, CLEARANCE);
            if end_obs.is_some() && v_rect.intersects(&self.deformed_rect(segment.end, CLEARANCE)) {
                continue;
            }
            if start_obs.is_some()
                && v_rect.intersects(&self.deformed_rect(segment.start, CLEARANCE))
            {
                continue;
            }

            let first = Segment {
                start: segment.start,
                end: vertex,
            };
            let second = Segment {
                start: vertex,
                end: segment.end,
            };

            self.vstate[vertex].total_count += 1;
            self.vstate[vertex].distance_checked = false;

            // Re-derive the split corner's clearance at its base position,
            // then restore the grown position for the rest of the pass.
            let base = self.vertices[vertex].base;
            let flags = self.vertices[vertex].corner;
            self.vstate[vertex].shrink(base);
            self.check_vertex_for_intersections(vertex);
            self.vstate[vertex].grow(flags);
            if self.vstate[vertex].shortest_distance != 0 {
                self.vstate[vertex].update_offset();
            }

            self.grow_pass_changed = true;

            let grown = &mut self.paths[pid].grown;
            if let Some(at) = index {
                grown.remove(at);
                grown.insert(at, first);
                grown.insert(at + 1, second);
            } else {
                grown.push(first);
                grown.push(second);
            }
            return 1;
        }

        if index.is_none() {
            self.paths[pid].grown.push(segment);
        }
        0
    }

    fn nearest_vertex(&self, v1: VertexId, v2: VertexId, a: Point, b: Point) -> VertexId {
        let p1 = self.vstate[v1].pos;
        let p2 = self.vstate[v2].pos;
        if a.distance(&p1) + b.distance(&p1) > a.distance(&p2) + b.distance(&p2) {
            v2
        } else {
            v1
        }
    }

    fn deformed_rect(&self, v: VertexId, extent: i32) -> Rectangle {
        self.vstate[v].deformed_rect(self.vertices[v].base, self.vertices[v].corner, extent)
    }


    fn label_paths(&mut self) {
        self.stack.extend_from_slice(&self.working);
        while let Some(pid) = self.stack.pop() {
            if !self.paths[pid].is_marked {
                self.paths[pid].is_marked = true;
                self.label_path(pid);
            }
        }
        // Marks are reused by the ordering pass.
        for i in 0..self.working.len() {
            let pid = self.working[i];
            self.paths[pid].is_marked = false;
        }
    }

    /// Labels each internal corner of the path as innie or outie, detecting
    /// whether the path runs inverted relative to earlier paths and splitting
    /// it at a genuine topological conflict.
    fn label_path(&mut self, pid: PathId) {
        let len = self.paths[pid].grown.len();
        if len == 0 {
            return;
        }
        let mut agree = false;
        for v in 0..len - 1 {
            let segment = self.paths[pid].grown[v];
            let next_segment = self.paths[pid].grown[v + 1];
            let vertex = segment.end;
            let Some(oid) = self.vertices[vertex].obs else {
                continue;
            };
            let center = self.obstacles[oid].center;
            let seg_start = self.vstate[segment.start].pos;
            let seg_end = self.vstate[vertex].pos;
            let cross = cross_product(seg_start, seg_end, center);
            let winding = self.vstate[vertex].winding;
            let inverted = self.paths[pid].is_inverted;

            if winding == Winding::NotSet {
                self.label_vertex(pid, segment, cross);
            } else if !inverted
                && ((cross > 0 && winding == Winding::Outie)
                    || (cross < 0 && winding == Winding::Innie))
            {
                if agree {
                    let sub = self.split_path(pid, v);
                    self.stack.push(sub);
                    return;
                }
                // First conflict: this path winds the other way around its
                // corners. Unlabel what it already visited and continue with
                // the flipped sense.
                self.paths[pid].is_inverted = true;
                self.unlabel_visited(pid, v);
            } else if inverted
                && ((cross < 0 && winding == Winding::Outie)
                    || (cross > 0 && winding == Winding::Innie))
            {
                let sub = self.split_path(pid, v);
                self.stack.push(sub);
                return;
            } else {
                agree = true;
            }

            for i in 0..self.vstate[vertex].paths.len() {
                let other = self.vstate[vertex].paths[i];
                if self.paths[other].alive && !self.paths[other].is_marked {
                    self.paths[other].is_marked = true;
                    self.stack.push(other);
                }
            }

            let next_start = self.vstate[next_segment.start].pos;
            let next_end = self.vstate[next_segment.end].pos;
            let angle = approach_angle((seg_start, seg_end), (next_start, next_end));
            let state = &mut self.vstate[vertex];
            if !state.paths.contains(&pid) {
                state.paths.push(pid);
            }
            state.angles.insert(pid, angle);
        }
    }

    fn label_vertex(&mut self, pid: PathId, segment: Segment, cross: i64) {
        let inverted = self.paths[pid].is_inverted;
        let winding = if cross > 0 {
            if inverted {
                Winding::Outie
            } else {
                Winding::Innie
            }
        } else if cross < 0 {
            if inverted {
                Winding::Innie
            } else {
                Winding::Outie
            }
        } else if self.vstate[segment.start].winding != Winding::NotSet {
            self.vstate[segment.start].winding
        } else {
            Winding::Innie
        };
        self.vstate[segment.end].winding = winding;
    }

    fn unlabel_visited(&mut self, pid: PathId, upto: usize) {
        for s in 0..upto {
            let v = self.paths[pid].grown[s].end;
            self.vstate[v].winding = Winding::NotSet;
        }
    }

    /// Splits the path at the conflicted segment: the tail becomes an
    /// independent subpath sharing the split segment, queued for its own
    /// labeling and spliced back after materialization.
    fn split_path(&mut self, pid: PathId, at: usize) -> PathId {
        let segment = self.paths[pid].grown[at];
        let tail: Vec<Segment> = self.paths[pid].grown[at..].to_vec();
        let end = self.paths[pid].end;

        let sub = self.alloc_path(PathRecord::new(segment.start, end));
        self.paths[sub].grown = tail;
        self.paths[sub].is_dirty = false;

        let rec = &mut self.paths[pid];
        rec.grown.truncate(at + 1);
        rec.end = segment.end;
        rec.sub_path = Some(sub);

        self.working.push(sub);
        self.sub_paths.push(sub);
        sub
    }


    /// Orders paths so that, at every shared corner, a path comes after each
    /// sibling whose approach angle is numerically smaller. Innies then stack
    /// outward in visit order while outies peel from the outermost band.
    fn order_paths(&mut self) {
        self.ordered.clear();
        let mut visit: Vec<(PathId, bool)> = Vec::new();
        for i in 0..self.working.len() {
            visit.push((self.working[i], false));
            while let Some((pid, emit)) = visit.pop() {
                if emit {
                    self.ordered.push(pid);
                    continue;
                }
                if self.paths[pid].is_marked {
                    continue;
                }
                self.paths[pid].is_marked = true;
                visit.push((pid, true));

                let mut before: Vec<PathId> = Vec::new();
                let len = self.paths[pid].grown.len();
                for v in 0..len.saturating_sub(1) {
                    let vertex = self.paths[pid].grown[v].end;
                    let Some(&raw) = self.vstate[vertex].angles.get(&pid) else {
                        continue;
                    };
                    let this_angle = if self.paths[pid].is_inverted { -raw } else { raw };
                    for j in 0..self.vstate[vertex].paths.len() {
                        let other = self.vstate[vertex].paths[j];
                        if self.paths[other].is_marked {
                            continue;
                        }
                        let Some(&other_raw) = self.vstate[vertex].angles.get(&other) else {
                            continue;
                        };
                        let other_angle = if self.paths[other].is_inverted {
                            -other_raw
                        } else {
                            other_raw
                        };
                        if other_angle < this_angle {
                            before.push(other);
                        }
                    }
                }
                for &p in before.iter().rev() {
                    visit.push((p, false));
                }
            }
        }
    }


    /// Emits each path's final point list, consuming the per-corner counters:
    /// innies take increasing offsets in visit order, outies take decreasing
    /// ones from the total. Runs exactly once per solve, after ordering.
    fn bend_paths(&mut self) {
        for i in 0..self.ordered.len() {
            let pid = self.ordered[i];
            let len = self.paths[pid].grown.len();
            if len == 0 {
                // Unroutable this cycle; leave the sequence empty.
                continue;
            }
            let start_p = self.vstate[self.paths[pid].start].pos;
            self.paths[pid].points.push(start_p);
            for v in 0..len - 1 {
                let vertex = self.paths[pid].grown[v].end;
                let base = self.vertices[vertex].base;
                let flags = self.vertices[vertex].corner;
                let point = if self.vstate[vertex].winding == Winding::Innie {
                    self.vstate[vertex].count += 1;
                    let step = self.vstate[vertex].count;
                    self.vstate[vertex].bend(base, flags, step)
                } else {
                    let step = self.vstate[vertex].total_count;
                    let p = self.vstate[vertex].bend(base, flags, step);
                    self.vstate[vertex].total_count -= 1;
                    p
                };
                self.paths[pid].points.push(point);
            }
            let end_p = self.vstate[self.paths[pid].end].pos;
            self.paths[pid].points.push(end_p);
        }
    }

    /// Splices split-off subpaths back into their parents, dropping the
    /// duplicated split segment and joint points, then retires the subpath
    /// records.
    fn reconnect_subpaths(&mut self) {
        for i in 0..self.ordered.len() {
            let pid = self.ordered[i];
            let mut chain = Vec::new();
            let mut cursor = self.paths[pid].sub_path;
            while let Some(sub) = cursor {
                chain.push(sub);
                cursor = self.paths[sub].sub_path;
            }
            while let Some(sub) = chain.pop() {
                let parent = chain.last().copied().unwrap_or(pid);
                let mut sub_points = std::mem::take(&mut self.paths[sub].points);
                let sub_grown = std::mem::take(&mut self.paths[sub].grown);
                let sub_segments = std::mem::take(&mut self.paths[sub].segments);
                let sub_end = self.paths[sub].end;

                let rec = &mut self.paths[parent];
                if !sub_points.is_empty() {
                    sub_points.remove(0);
                }
                rec.points.pop();
                rec.points.extend(sub_points);
                rec.grown.pop();
                rec.grown.extend(sub_grown);
                rec.segments.extend(sub_segments);
                rec.end = sub_end;
                rec.sub_path = None;
            }
        }

        let subs = std::mem::take(&mut self.sub_paths);
        self.ordered.retain(|p| !subs.contains(p));
        self.working.retain(|p| !subs.contains(p));
        for sub in subs {
            self.free_path(sub);
        }
    }

    /// Concatenates each bendpointed parent's child point runs into the
    /// parent's own sequence, dropping the duplicated joints.
    fn populate_parent_paths(&mut self) {
        for i in 0..self.all_paths.len() {
            let pid = self.all_paths[i];
            if self.paths[pid].children.is_empty() {
                continue;
            }
            let children = self.paths[pid].children.clone();
            let mut merged: Vec<Point> = Vec::new();
            let mut complete = true;
            for &child in &children {
                if self.paths[child].points.is_empty() {
                    complete = false;
                    break;
                }
                merged.extend_from_slice(&self.paths[child].points);
                merged.pop();
            }
            if complete {
                if let Some(&last) = children.last().and_then(|&c| self.paths[c].points.last()) {
                    merged.push(last);
                }
            } else {
                merged.clear();
            }
            self.paths[pid].points = merged;
        }
    }


    fn alloc_vertex(&mut self, base: Point, obs: Option<ObstacleId>, corner: Position) -> VertexId {
        if let Some(id) = self.free_vertices.pop() {
            self.vertices[id] = Vertex { base, obs, corner };
            self.vstate[id].full_reset(base);
            id
        } else {
            let id = VertexId(self.vertices.len() as u32);
            self.vertices.push(Vertex { base, obs, corner });
            self.vstate.push(VertexScratch::new(base));
            id
        }
    }

    fn free_vertex(&mut self, id: VertexId) {
        self.vertices[id].obs = None;
        let base = self.vertices[id].base;
        self.vstate[id].full_reset(base);
        self.free_vertices.push(id);
    }

    fn alloc_path(&mut self, record: PathRecord) -> PathId {
        if let Some(id) = self.free_paths.pop() {
            self.paths[id] = record;
            id
        } else {
            let id = PathId(self.paths.len() as u32);
            self.paths.push(record);
            id
        }
    }

    fn free_path(&mut self, id: PathId) {
        self.paths[id].alive = false;
        self.paths[id].segments.clear();
        self.paths[id].grown.clear();
        self.paths[id].points.clear();
        self.free_paths.push(id);
    }

    fn reset_vertex_scratch(&mut self) {
        for i in 0..self.vertices.len() {
            let base = self.vertices[i].base;
            self.vstate[i].full_reset(base);
        }
    }

    fn solve_snapshot(&self, searched: usize) -> serde_json::Value {
        let obstacles: Vec<_> = self
            .registry
            .keys()
            .map(|r| json!({ "x": r.x, "y": r.y, "width": r.width, "height": r.height }))
            .collect();
        let paths: Vec<_> = self
            .all_paths
            .iter()
            .map(|&pid| {
                let rec = &self.paths[pid];
                json!({
                    "routed": !rec.points.is_empty(),
                    "points": rec.points
                        .iter()
                        .map(|p| json!({ "x": p.x, "y": p.y }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({ "searched": searched, "obstacles": obstacles, "paths": paths })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_corner_router() -> (Router, Rectangle) {
        let mut router = Router::new();
        let bounds = Rectangle::new(0, 0, 100, 100);
        router.add_obstacle(bounds).unwrap();
        (router, bounds)
    }

    #[test]
    fn vertex_counts_match_routes_through_the_corner() {
        let (mut router, bounds) = shared_corner_router();
        router.add_path(Point::new(-40, 60), Point::new(60, -40));
        router.add_path(Point::new(-45, 55), Point::new(55, -45));

        router.update_child_paths();
        router.solve_dirty_paths();
        router.count_vertices();

        let oid = *router.registry.get(&bounds).unwrap();
        let top_left = router.obstacles[oid].top_left;
        assert_eq!(router.vstate[top_left].total_count, 2);
        // The endpoints are not corners and are never counted.
        for pid in &router.working {
            let rec = &router.paths[*pid];
            assert_eq!(router.vstate[rec.start].total_count, 0);
            assert_eq!(router.vstate[rec.end].total_count, 0);
        }
    }

    #[test]
    fn opposing_routes_agree_after_inversion() {
        let (mut router, bounds) = shared_corner_router();
        let forward = router.add_path(Point::new(-40, 60), Point::new(60, -40));
        let reversed = router.add_path(Point::new(55, -45), Point::new(-45, 55));
        router.solve();

        let oid = *router.registry.get(&bounds).unwrap();
        let top_left = router.obstacles[oid].top_left;
        assert_ne!(router.vstate[top_left].winding, Winding::NotSet);
        assert!(
            router.paths[forward].is_inverted != router.paths[reversed].is_inverted,
            "exactly one of the opposing routes must flip its winding sense"
        );

        // Both routes still bend at distinct stacked offsets.
        let a = router.points(forward).unwrap()[1];
        let b = router.points(reversed).unwrap()[1];
        assert_ne!(a, b);
    }

    #[test]
    fn corner_offset_is_capped_by_a_nearby_obstacle() {
        let (mut router, bounds) = shared_corner_router();
        // A second obstacle close to the shared corner limits how far bends
        // may fan out.
        let cap = Rectangle::new(-14, -14, 10, 10);
        router.add_obstacle(cap).unwrap();
        router.add_path(Point::new(-40, 60), Point::new(60, -40));
        router.add_path(Point::new(-45, 55), Point::new(55, -45));

        router.update_child_paths();
        router.solve_dirty_paths();
        router.count_vertices();
        router.check_vertex_intersections();

        let oid = *router.registry.get(&bounds).unwrap();
        let top_left = router.obstacles[oid].top_left;
        assert!(router.vstate[top_left].distance_checked);
        assert_ne!(router.vstate[top_left].shortest_distance, 0);
        assert!(router.vstate[top_left].offset < CLEARANCE);
    }

    #[test]
    fn subpath_bookkeeping_is_cleared_after_solve() {
        let (mut router, _) = shared_corner_router();
        router.add_path(Point::new(-40, 60), Point::new(60, -40));
        router.add_path(Point::new(55, -45), Point::new(-45, 55));
        router.solve();
        assert!(router.sub_paths.is_empty());
        assert!(router.stack.is_empty());
        for pid in &router.working {
            assert!(router.paths[*pid].sub_path.is_none());
        }
    }
}
