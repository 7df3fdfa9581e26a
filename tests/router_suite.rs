use bendroute_core::geometry::crosses_interior;
use bendroute_core::{Point, Rectangle, Router};
use rstest::rstest;

/// Every emitted edge must stay clear of the interiors of the given
/// obstacles.
fn assert_avoids(points: &[Point], obstacles: &[Rectangle]) {
    for pair in points.windows(2) {
        for rect in obstacles {
            assert!(
                !crosses_interior(pair[0], pair[1], rect),
                "edge {:?} -> {:?} crosses {:?}",
                pair[0],
                pair[1],
                rect
            );
        }
    }
}

fn occurrences(points: &[Point], target: Point) -> usize {
    points.iter().filter(|&&p| p == target).count()
}

#[rstest]
#[case(Point::new(0, 0), Point::new(100, 0))]
#[case(Point::new(-20, -20), Point::new(35, 70))]
#[case(Point::new(5, 5), Point::new(5, 90))]
fn unobstructed_path_is_a_straight_line(#[case] start: Point, #[case] end: Point) {
    let mut router = Router::new();
    let path = router.add_path(start, end);
    assert_eq!(router.solve(), 1);
    assert_eq!(router.points(path).unwrap(), &[start, end]);
}

#[test]
fn clear_obstacles_leave_direct_routes_alone() {
    let mut router = Router::new();
    router.add_obstacle(Rectangle::new(0, 0, 40, 40)).unwrap();
    let path = router.add_path(Point::new(-30, -30), Point::new(-30, 80));
    router.solve();
    assert_eq!(router.points(path).unwrap().len(), 2);
}

#[test]
fn route_bends_around_an_obstacle() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 40, 40);
    router.add_obstacle(bounds).unwrap();
    let path = router.add_path(Point::new(-30, 20), Point::new(80, 20));
    assert_eq!(router.solve(), 1);
    let points = router.points(path).unwrap();
    assert!(points.len() > 2, "expected bends, got {points:?}");
    assert_eq!(points.first(), Some(&Point::new(-30, 20)));
    assert_eq!(points.last(), Some(&Point::new(80, 20)));
    assert_avoids(points, &[bounds]);
}

#[test]
fn shared_corner_routes_get_distinct_offsets() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 100, 100);
    router.add_obstacle(bounds).unwrap();
    let first = router.add_path(Point::new(-40, 60), Point::new(60, -40));
    let second = router.add_path(Point::new(-45, 55), Point::new(55, -45));
    assert_eq!(router.solve(), 2);

    let a = router.points(first).unwrap().to_vec();
    let b = router.points(second).unwrap().to_vec();
    assert_eq!(a.len(), 3);
    assert_eq!(b.len(), 3);
    // Both wrap the same corner, at stacked clearances rather than on top of
    // each other or on the corner itself.
    assert_ne!(a[1], b[1]);
    assert_ne!(a[1], Point::new(0, 0));
    assert_ne!(b[1], Point::new(0, 0));
    assert!(a[1].distance(&b[1]) >= 4.0);
    assert_avoids(&a, &[bounds]);
    assert_avoids(&b, &[bounds]);
}

#[test]
fn second_solve_is_idempotent() {
    let mut router = Router::new();
    router.add_obstacle(Rectangle::new(0, 0, 100, 100)).unwrap();
    let first = router.add_path(Point::new(-40, 60), Point::new(60, -40));
    let second = router.add_path(Point::new(-45, 55), Point::new(55, -45));
    router.solve();
    let a = router.points(first).unwrap().to_vec();
    let b = router.points(second).unwrap().to_vec();

    assert_eq!(router.solve(), 0, "unchanged model must not re-search");
    assert_eq!(router.points(first).unwrap(), a.as_slice());
    assert_eq!(router.points(second).unwrap(), b.as_slice());
}

#[test]
fn obstacle_add_remove_round_trips() {
    let mut router = Router::new();
    let blocker = Rectangle::new(0, 0, 40, 40);
    router.add_obstacle(blocker).unwrap();
    let path = router.add_path(Point::new(-30, 20), Point::new(80, 20));
    router.solve();
    let before = router.points(path).unwrap().to_vec();

    let transient = Rectangle::new(45, 25, 20, 20);
    router.add_obstacle(transient).unwrap();
    assert_eq!(router.solve(), 1, "new obstacle must dirty the blocked path");
    assert_avoids(router.points(path).unwrap(), &[blocker, transient]);

    router.remove_obstacle(transient).unwrap();
    assert_eq!(router.solve(), 1);
    assert_eq!(router.points(path).unwrap(), before.as_slice());
}

#[test]
fn removing_the_blocker_restores_the_direct_route() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 40, 40);
    router.add_obstacle(bounds).unwrap();
    let path = router.add_path(Point::new(-30, 20), Point::new(80, 20));
    router.solve();
    assert!(router.points(path).unwrap().len() > 2);

    router.remove_obstacle(bounds).unwrap();
    assert_eq!(router.solve(), 1);
    assert_eq!(
        router.points(path).unwrap(),
        &[Point::new(-30, 20), Point::new(80, 20)]
    );
}

#[test]
fn moving_an_obstacle_reroutes_affected_paths() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 40, 40);
    router.add_obstacle(bounds).unwrap();
    let path = router.add_path(Point::new(-30, 20), Point::new(80, 20));
    router.solve();
    assert!(router.points(path).unwrap().len() > 2);

    router
        .update_obstacle(bounds, Rectangle::new(200, 200, 40, 40))
        .unwrap();
    assert_eq!(router.solve(), 1);
    assert_eq!(router.points(path).unwrap().len(), 2);
}

#[test]
fn bendpoints_decompose_into_child_searches() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 60, 60);
    router.add_obstacle(bounds).unwrap();
    let path = router.add_path(Point::new(-40, 30), Point::new(100, 30));
    let waypoint = Point::new(30, -20);
    router.set_bendpoints(path, vec![waypoint]).unwrap();

    assert_eq!(router.solve(), 2, "one search per bendpoint-bounded piece");

    let points = router.points(path).unwrap();
    assert_eq!(points.first(), Some(&Point::new(-40, 30)));
    assert_eq!(points.last(), Some(&Point::new(100, 30)));
    assert_eq!(occurrences(points, waypoint), 1);
    for pair in points.windows(2) {
        assert_ne!(pair[0], pair[1], "joint duplicated in {points:?}");
    }
    assert_avoids(points, &[bounds]);

    // The decomposition itself is stable.
    assert_eq!(router.solve(), 0);
}

#[test]
fn excluded_obstacles_are_routed_through() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 50, 50);
    router.add_obstacle(bounds).unwrap();
    let path = router.add_path(Point::new(-20, 25), Point::new(70, 25));
    router.set_excluded_obstacles(path, vec![bounds]).unwrap();
    router.solve();
    assert_eq!(
        router.points(path).unwrap(),
        &[Point::new(-20, 25), Point::new(70, 25)]
    );
}

#[test]
fn sealed_endpoint_reports_unroutable() {
    let mut router = Router::new();
    // A closed box of four bars around the start point.
    for bounds in [
        Rectangle::new(-20, -20, 60, 10),
        Rectangle::new(-20, 20, 60, 10),
        Rectangle::new(-20, -20, 10, 50),
        Rectangle::new(30, -20, 10, 50),
    ] {
        router.add_obstacle(bounds).unwrap();
    }
    let path = router.add_path(Point::new(0, 0), Point::new(100, 100));
    assert_eq!(router.solve(), 1);
    assert!(!router.is_routed(path));
    assert!(router.points(path).unwrap().is_empty());

    // Unroutable is a settled state, not a permanent re-search.
    assert_eq!(router.solve(), 0);
}

#[test]
fn moving_endpoints_redirties_the_path() {
    let mut router = Router::new();
    let path = router.add_path(Point::new(0, 0), Point::new(50, 0));
    router.solve();
    router
        .set_endpoints(path, Point::new(0, 10), Point::new(50, 10))
        .unwrap();
    assert_eq!(router.solve(), 1);
    assert_eq!(
        router.points(path).unwrap(),
        &[Point::new(0, 10), Point::new(50, 10)]
    );
}

#[test]
fn contract_violations_are_reported() {
    let mut router = Router::new();
    let bounds = Rectangle::new(0, 0, 10, 10);
    router.add_obstacle(bounds).unwrap();
    assert!(router.add_obstacle(bounds).is_err());
    assert!(router.remove_obstacle(Rectangle::new(5, 5, 1, 1)).is_err());

    let path = router.add_path(Point::new(-5, -5), Point::new(20, 20));
    router.remove_path(path).unwrap();
    assert!(router.remove_path(path).is_err());
    assert!(router.points(path).is_err());
}
