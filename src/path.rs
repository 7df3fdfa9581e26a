use std::cmp::{Ordering, Reverse};

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use petgraph::graphmap::UnGraphMap;
use priority_queue::PriorityQueue;

use crate::geometry::{crosses_interior, Point, Position, Rectangle};
use crate::handles::{ObstacleId, PathId, VertexId};
use crate::model::{Obstacle, Segment, VertexScratch};

/// Threshold factor for the first search of a connection: routes longer than
/// the straight line times this are treated as degenerate.
pub(crate) const OVAL_CONSTANT: f64 = 1.13;
/// Slack applied to the previous solve's cost ratio when re-deriving the
/// threshold.
pub(crate) const EPSILON: f64 = 1.04;

/// One source -> target connection and everything the solver knows about it.
#[derive(Clone, Debug)]
pub(crate) struct PathRecord {
    pub start: VertexId,
    pub end: VertexId,
    /// User waypoints the route must pass through, in order.
    pub bendpoints: Vec<Point>,
    /// Obstacle bounds this connection is allowed to pass through.
    pub excluded_rects: Vec<Rectangle>,
    /// `excluded_rects` resolved against the live obstacle set.
    pub excluded: Vec<ObstacleId>,
    pub is_dirty: bool,
    pub is_inverted: bool,
    pub is_marked: bool,
    /// Reject a found route costing more than this; zero disables the check.
    pub threshold: f64,
    pub prev_cost_ratio: f64,
    /// Raw corner-to-corner chain from the last successful search.
    pub segments: Vec<Segment>,
    /// Chain after clearance splits; rebuilt every solve.
    pub grown: Vec<Segment>,
    /// Final materialized point sequence; empty while unsolved.
    pub points: Vec<Point>,
    /// Obstacles the last search expanded into its visibility graph.
    pub visible_obstacles: IndexSet<ObstacleId>,
    pub parent: Option<PathId>,
    /// Children solving the bendpoint-bounded pieces of this path.
    pub children: Vec<PathId>,
    /// Tail split off at a winding conflict, spliced back after ordering.
    pub sub_path: Option<PathId>,
    pub alive: bool,
}

impl PathRecord {
    pub fn new(start: VertexId, end: VertexId) -> Self {
        PathRecord {
            start,
            end,
            bendpoints: Vec::new(),
            excluded_rects: Vec::new(),
            excluded: Vec::new(),
            is_dirty: true,
            is_inverted: false,
            is_marked: false,
            threshold: 0.0,
            prev_cost_ratio: 0.0,
            segments: Vec::new(),
            grown: Vec::new(),
            points: Vec::new(),
            visible_obstacles: IndexSet::new(),
            parent: None,
            children: Vec::new(),
            sub_path: None,
            alive: true,
        }
    }

    /// Clears the state rebuilt by the downstream passes while keeping the
    /// found route.
    pub fn reset(&mut self) {
        self.is_marked = false;
        self.is_inverted = false;
        self.grown.clear();
        self.points.clear();
        self.sub_path = None;
    }
}

/// f64 route cost with a total order, so it can drive the open set.
#[derive(Clone, Copy, PartialEq)]
pub(crate) struct Cost(pub f64);

impl Eq for Cost {}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Read-only view of the router's arenas for one search.
pub(crate) struct SearchContext<'a> {
    pub vstate: &'a Vec<VertexScratch>,
    pub obstacles: &'a Vec<Obstacle>,
    pub registry: &'a IndexMap<Rectangle, ObstacleId>,
}

pub(crate) struct SearchOutcome {
    pub segments: Vec<Segment>,
    pub cost: f64,
}

/// Finds the cheapest corner-to-corner route between `start` and `end` that
/// crosses no obstacle interior, or reports failure. The visibility graph is
/// built lazily: only obstacles that actually block a candidate segment are
/// expanded. Obstacles in `excluded` are invisible to this search. Shared
/// vertex counters are never touched; all search state is local.
pub(crate) fn shortest_route(
    ctx: &SearchContext<'_>,
    start: VertexId,
    end: VertexId,
    threshold: f64,
    excluded: &[ObstacleId],
    visible: &mut IndexSet<ObstacleId>,
) -> Option<SearchOutcome> {
    let start_p = ctx.vstate[start].pos;
    let end_p = ctx.vstate[end].pos;

    let mut graph: UnGraphMap<VertexId, ()> = UnGraphMap::new();
    let mut stack: Vec<Segment> = vec![Segment { start, end }];

    while let Some(seg) = stack.pop() {
        let a = ctx.vstate[seg.start].pos;
        let b = ctx.vstate[seg.end].pos;

        // Segments falling outside the ellipse around the endpoints cannot be
        // part of an acceptable route.
        if threshold != 0.0
            && (b.distance(&end_p) + b.distance(&start_p) > threshold
                || a.distance(&end_p) + a.distance(&start_p) > threshold)
        {
            continue;
        }

        let mut blocked = false;
        for &oid in ctx.registry.values() {
            if excluded.contains(&oid) {
                continue;
            }
            let bounds = &ctx.obstacles[oid].bounds;
            if bounds.contains_proper(a) || bounds.contains_proper(b) || crosses_interior(a, b, bounds)
            {
                blocked = true;
                if visible.insert(oid) {
                    expand_obstacle(ctx, oid, start, end, visible, &mut stack);
                }
                break;
            }
        }
        if !blocked && seg.start != seg.end {
            graph.add_edge(seg.start, seg.end, ());
        }
    }

    if !graph.contains_node(start) || !graph.contains_node(end) {
        return None;
    }

    let mut open: PriorityQueue<VertexId, Reverse<Cost>> = PriorityQueue::new();
    let mut g_score: HashMap<VertexId, f64> = HashMap::new();
    let mut came_from: HashMap<VertexId, VertexId> = HashMap::new();

    g_score.insert(start, 0.0);
    open.push(start, Reverse(Cost(start_p.distance(&end_p))));

    while let Some((current, _)) = open.pop() {
        if current == end {
            let mut chain = vec![current];
            let mut cursor = current;
            while let Some(&prev) = came_from.get(&cursor) {
                cursor = prev;
                chain.push(cursor);
            }
            chain.reverse();
            let segments = chain
                .windows(2)
                .map(|pair| Segment {
                    start: pair[0],
                    end: pair[1],
                })
                .collect();
            return Some(SearchOutcome {
                segments,
                cost: g_score[&current],
            });
        }

        let current_g = g_score[&current];
        let current_p = ctx.vstate[current].pos;
        for neighbor in graph.neighbors(current) {
            let neighbor_p = ctx.vstate[neighbor].pos;
            let tentative = current_g + current_p.distance(&neighbor_p);
            if tentative < *g_score.get(&neighbor).unwrap_or(&f64::INFINITY) {
                g_score.insert(neighbor, tentative);
                came_from.insert(neighbor, current);
                open.push(neighbor, Reverse(Cost(tentative + neighbor_p.distance(&end_p))));
            }
        }
    }

    None
}

/// Pushes every candidate segment a newly visible obstacle contributes: its
/// perimeter, the silhouette edges from both path endpoints, and the corner
/// product against every other visible obstacle.
fn expand_obstacle(
    ctx: &SearchContext<'_>,
    oid: ObstacleId,
    start: VertexId,
    end: VertexId,
    visible: &IndexSet<ObstacleId>,
    stack: &mut Vec<Segment>,
) {
    let obs = &ctx.obstacles[oid];
    let [tl, tr, br, bl] = obs.corners();

    stack.push(Segment { start: tl, end: tr });
    stack.push(Segment { start: tr, end: br });
    stack.push(Segment { start: br, end: bl });
    stack.push(Segment { start: bl, end: tl });

    silhouette_segments(ctx, start, obs, stack);
    silhouette_segments(ctx, end, obs, stack);

    for &other in visible.iter() {
        if other == oid {
            continue;
        }
        let other_obs = &ctx.obstacles[other];
        for c1 in obs.corners() {
            for c2 in other_obs.corners() {
                stack.push(Segment { start: c1, end: c2 });
            }
        }
    }
}

/// The two obstacle corners forming the silhouette as seen from the vertex.
/// A vertex strictly inside the obstacle sees nothing; the route fails
/// cleanly instead.
fn silhouette_segments(
    ctx: &SearchContext<'_>,
    v: VertexId,
    obs: &Obstacle,
    stack: &mut Vec<Segment>,
) {
    let p = ctx.vstate[v].pos;
    let pos = obs.bounds.position_of(p);
    let (a, b) = if pos == Position::NORTH_EAST || pos == Position::SOUTH_WEST {
        (obs.top_left, obs.bottom_right)
    } else if pos == Position::NORTH_WEST || pos == Position::SOUTH_EAST {
        (obs.top_right, obs.bottom_left)
    } else if pos == Position::NORTH {
        (obs.top_left, obs.top_right)
    } else if pos == Position::SOUTH {
        (obs.bottom_left, obs.bottom_right)
    } else if pos == Position::EAST {
        (obs.top_right, obs.bottom_right)
    } else if pos == Position::WEST {
        (obs.top_left, obs.bottom_left)
    } else {
        let bounds = &obs.bounds;
        if p.x == bounds.x {
            (obs.top_left, obs.bottom_left)
        } else if p.y == bounds.y {
            (obs.top_left, obs.top_right)
        } else if p.y == bounds.bottom() - 1 {
            (obs.bottom_left, obs.bottom_right)
        } else if p.x == bounds.right() - 1 {
            (obs.top_right, obs.bottom_right)
        } else {
            return;
        }
    };
    stack.push(Segment { start: v, end: a });
    stack.push(Segment { start: v, end: b });
}
