use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntSize {
    pub width: i32,
    pub height: i32,
}

impl IntSize {
    pub const ZERO: IntSize = IntSize {
        width: 0,
        height: 0,
    };

    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Swap width and height
    pub fn rotated(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn to_short_string(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for IntSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntOffset {
    pub x: i32,
    pub y: i32,
}

impl IntOffset {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Rectangle with exclusive right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub const ZERO: IntRect = IntRect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(size: IntSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Build a rect from two arbitrary corners, normalizing the edge order.
    pub fn from_corners(a: IntOffset, b: IntOffset) -> Self {
        Self::new(a.x.min(b.x), a.y.min(b.y), a.x.max(b.x), a.y.max(b.y))
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width(), self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    pub fn top_left(&self) -> IntOffset {
        IntOffset::new(self.left, self.top)
    }

    pub fn bottom_right(&self) -> IntOffset {
        IntOffset::new(self.right, self.bottom)
    }

    pub fn overlaps(&self, other: &IntRect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn contains_rect(&self, other: &IntRect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Intersection of the two rects, `None` if they do not overlap
    pub fn intersect(&self, other: &IntRect) -> Option<IntRect> {
        let rect = IntRect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if rect.is_empty() { None } else { Some(rect) }
    }

    pub fn inflate(&self, horizontal: i32, vertical: i32) -> IntRect {
        IntRect::new(
            self.left - horizontal,
            self.top - vertical,
            self.right + horizontal,
            self.bottom + vertical,
        )
    }

    pub fn to_short_string(&self) -> String {
        format!("{},{},{},{}", self.left, self.top, self.right, self.bottom)
    }
}

impl fmt::Display for IntRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect() {
        let a = IntRect::new(0, 0, 100, 100);
        let b = IntRect::new(50, 80, 200, 300);
        assert_eq!(a.intersect(&b), Some(IntRect::new(50, 80, 100, 100)));

        let c = IntRect::new(100, 0, 200, 100);
        assert_eq!(a.intersect(&c), None);
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_from_corners_normalizes() {
        let rect = IntRect::from_corners(IntOffset::new(30, 5), IntOffset::new(10, 20));
        assert_eq!(rect, IntRect::new(10, 5, 30, 20));
        assert_eq!(rect.size(), IntSize::new(20, 15));
    }

    #[test]
    fn test_inflate_and_contains() {
        let rect = IntRect::new(10, 10, 20, 20).inflate(5, 2);
        assert_eq!(rect, IntRect::new(5, 8, 25, 22));
        assert!(rect.contains_rect(&IntRect::new(10, 10, 20, 20)));
        assert!(rect.contains_point(5, 8));
        assert!(!rect.contains_point(25, 8));
    }
}
