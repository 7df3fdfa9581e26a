//! Shortest-path connection routing around rectangular obstacles.
//!
//! The router maintains a set of axis-aligned obstacles and a set of
//! point-to-point connections, finds the shortest non-crossing polyline for
//! each connection, and fans routes that bend around the same obstacle
//! corner apart by deterministic pixel offsets. Updates are incremental:
//! mutations dirty only the affected connections and [`Router::solve`]
//! re-searches just those.
//!
//! ```
//! use bendroute_core::{Point, Rectangle, Router};
//!
//! let mut router = Router::new();
//! router.add_obstacle(Rectangle::new(0, 0, 100, 100)).unwrap();
//! let path = router.add_path(Point::new(-40, 60), Point::new(140, 60));
//! router.solve();
//! assert!(router.points(path).unwrap().len() > 2);
//! ```

pub mod geometry;
mod handles;
mod model;
mod path;
mod routing;
mod trace;

pub use geometry::{Point, Rectangle};
pub use handles::PathId;
pub use routing::{Router, RoutingError};
pub use trace::init_debug_logging;
