//! Integer pixel geometry shared by the account and game services.

use std::collections::VecDeque;

/// A point in map space. Usually represents pixel coordinates, but the
/// pathfinder reuses it for tile coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }

    /// Check whether the given point is within `radius` of this point,
    /// measured per axis.
    pub fn in_range_of(&self, other: &Point, radius: i32) -> bool {
        (self.x - other.x).abs() <= radius && (self.y - other.y).abs() <= radius
    }

    /// Squared euclidean distance, used for range checks without a sqrt.
    pub fn dist_squared(&self, other: &Point) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        dx * dx + dy * dy
    }
}

/// A rectangle in map space. Usually a pixel-based zone on a map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Rectangle { x, y, w, h }
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.x && p.x < self.x + self.w && p.y >= self.y && p.y < self.y + self.h
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }
}

/// A tile path produced by the pathfinder. The front of the queue is the
/// next step; the back is the destination tile.
pub type Path = VecDeque<Point>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_in_range_uses_per_axis_distance() {
        let a = Point::new(100, 100);

        assert!(a.in_range_of(&Point::new(100, 100), 0));
        assert!(a.in_range_of(&Point::new(132, 68), 32));
        assert!(!a.in_range_of(&Point::new(133, 100), 32));
        assert!(!a.in_range_of(&Point::new(100, 133), 32));
    }

    #[test]
    fn point_dist_squared() {
        let a = Point::new(0, 0);
        assert_eq!(a.dist_squared(&Point::new(3, 4)), 25);
        assert_eq!(a.dist_squared(&Point::new(-3, -4)), 25);
        assert_eq!(a.dist_squared(&a), 0);
    }

    #[test]
    fn rectangle_contains_is_half_open() {
        let r = Rectangle::new(10, 20, 30, 40);

        assert!(r.contains(&Point::new(10, 20)));
        assert!(r.contains(&Point::new(39, 59)));
        assert!(!r.contains(&Point::new(40, 20)));
        assert!(!r.contains(&Point::new(10, 60)));
        assert!(!r.contains(&Point::new(9, 20)));
    }

    #[test]
    fn rectangle_intersects_overlapping_and_disjoint() {
        let r = Rectangle::new(0, 0, 100, 100);

        assert!(r.intersects(&Rectangle::new(50, 50, 100, 100)));
        assert!(r.intersects(&Rectangle::new(-50, -50, 51, 51)));
        assert!(!r.intersects(&Rectangle::new(100, 0, 10, 10)));
        assert!(!r.intersects(&Rectangle::new(0, -10, 100, 10)));
    }
}
