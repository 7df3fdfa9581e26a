use hashbrown::HashMap;
use rstar::{RTreeObject, AABB};

use crate::geometry::{Point, Position, Rectangle};
use crate::handles::{ObstacleId, PathId, VertexId};

/// Minimum clearance, in pixels, between a routed bend and the obstacle
/// corner it wraps. Also the per-route spacing between stacked bends.
pub(crate) const CLEARANCE: i32 = 4;

/// How a route wraps an obstacle corner: toward the obstacle's center or
/// away from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Winding {
    NotSet,
    Innie,
    Outie,
}

/// Durable identity of a routing vertex: an obstacle corner or a free point
/// (path endpoint or user waypoint).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Vertex {
    pub base: Point,
    pub obs: Option<ObstacleId>,
    pub corner: Position,
}

/// Per-solve annotations of a vertex, kept separate from its identity and
/// reset wholesale at each solve's search phase.
#[derive(Clone, Debug)]
pub(crate) struct VertexScratch {
    /// Current position; diverges from the base only while obstacles are
    /// grown mid-pass.
    pub pos: Point,
    pub winding: Winding,
    /// Bends handed out so far at this corner during materialization.
    pub count: i32,
    /// Routes passing through this corner.
    pub total_count: i32,
    /// Pixel step between stacked bends at this corner.
    pub offset: i32,
    /// Clearance bound imposed by the nearest foreign obstacle; zero means
    /// unbounded.
    pub shortest_distance: i32,
    pub distance_checked: bool,
    /// Paths routed through this vertex, with each path's approach angle.
    pub paths: Vec<PathId>,
    pub angles: HashMap<PathId, f64>,
}

impl VertexScratch {
    pub fn new(base: Point) -> Self {
        VertexScratch {
            pos: base,
            winding: Winding::NotSet,
            count: 0,
            total_count: 0,
            offset: CLEARANCE,
            shortest_distance: 0,
            distance_checked: false,
            paths: Vec::new(),
            angles: HashMap::new(),
        }
    }

    pub fn full_reset(&mut self, base: Point) {
        self.pos = base;
        self.winding = Winding::NotSet;
        self.count = 0;
        self.total_count = 0;
        self.offset = CLEARANCE;
        self.shortest_distance = 0;
        self.distance_checked = false;
        self.paths.clear();
        self.angles.clear();
    }

    /// Displaces the vertex outward along its corner quadrant by the stacked
    /// bend extent. Always paired with `shrink` within the same pass.
    pub fn grow(&mut self, corner: Position) {
        let modifier = if self.shortest_distance == 0 {
            self.total_count * CLEARANCE
        } else {
            self.shortest_distance / 2 - 1
        };
        self.pos = displace(self.pos, corner, modifier);
    }

    pub fn shrink(&mut self, base: Point) {
        self.pos = base;
    }

    /// Shrinks the bend spacing so the full stack fits inside the clearance
    /// bound.
    pub fn update_offset(&mut self) {
        if self.shortest_distance != 0 {
            self.offset = (self.shortest_distance / 2 - 1) / self.total_count.max(1);
        }
    }

    /// The bend point for the `steps`-th route peeling around this corner.
    pub fn bend(&self, base: Point, corner: Position, steps: i32) -> Point {
        displace(base, corner, steps * self.offset)
    }

    /// The region a bend stack occupies: the span from the base corner to the
    /// grown position, padded by `extent`, anchored by quadrant.
    pub fn deformed_rect(&self, base: Point, corner: Position, extent: i32) -> Rectangle {
        let (y, height) = if corner.has(Position::NORTH) {
            (self.pos.y - extent, base.y - self.pos.y + extent)
        } else {
            (base.y, self.pos.y - base.y + extent)
        };
        let (x, width) = if corner.has(Position::EAST) {
            (base.x, self.pos.x - base.x + extent)
        } else {
            (self.pos.x - extent, base.x - self.pos.x + extent)
        };
        Rectangle::new(x, y, width, height)
    }
}

fn displace(p: Point, corner: Position, modifier: i32) -> Point {
    let mut out = p;
    if corner.has(Position::NORTH) {
        out.y -= modifier;
    } else {
        out.y += modifier;
    }
    if corner.has(Position::EAST) {
        out.x += modifier;
    } else {
        out.x -= modifier;
    }
    out
}

/// A directed edge between two routing vertices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Segment {
    pub start: VertexId,
    pub end: VertexId,
}

/// An obstruction: bounds plus the four corner vertices routes may bend
/// around.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Obstacle {
    pub bounds: Rectangle,
    pub center: Point,
    pub top_left: VertexId,
    pub top_right: VertexId,
    pub bottom_left: VertexId,
    pub bottom_right: VertexId,
}

impl Obstacle {
    pub fn corners(&self) -> [VertexId; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }
}

/// R-tree entry mirroring one obstacle's bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ObstacleEnvelope {
    pub id: ObstacleId,
    pub bounds: Rectangle,
}

impl RTreeObject for ObstacleEnvelope {
    type Envelope = AABB<Point>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.bounds.top_left(), self.bounds.bottom_right())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_reverted_by_shrink() {
        let base = Point::new(10, 10);
        let mut scratch = VertexScratch::new(base);
        scratch.total_count = 2;
        scratch.grow(Position::NORTH_WEST);
        assert_eq!(scratch.pos, Point::new(10 - 2 * CLEARANCE, 10 - 2 * CLEARANCE));
        scratch.shrink(base);
        assert_eq!(scratch.pos, base);
    }

    #[test]
    fn bend_steps_away_from_the_corner_quadrant() {
        let base = Point::new(0, 0);
        let scratch = VertexScratch::new(base);
        assert_eq!(
            scratch.bend(base, Position::NORTH_WEST, 1),
            Point::new(-CLEARANCE, -CLEARANCE)
        );
        assert_eq!(
            scratch.bend(base, Position::SOUTH_EAST, 2),
            Point::new(2 * CLEARANCE, 2 * CLEARANCE)
        );
    }

    #[test]
    fn offset_shrinks_to_the_clearance_bound() {
        let mut scratch = VertexScratch::new(Point::new(0, 0));
        scratch.total_count = 2;
        scratch.shortest_distance = 10;
        scratch.update_offset();
        assert_eq!(scratch.offset, 2);
    }
}
