//! Small geometry helpers shared by the aperture catalog, the drawing state
//! machine, and the bounds pass.

use std::f64::consts::TAU;

/// An axis-aligned extent rectangle in Gerber (file-unit) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Extents {
    pub fn point(x: f64, y: f64) -> Self {
        Extents {
            x_min: x,
            x_max: x,
            y_min: y,
            y_max: y,
        }
    }

    /// The rectangle `(cx ± hx, cy ± hy)`.
    pub fn centered(cx: f64, cy: f64, hx: f64, hy: f64) -> Self {
        Extents {
            x_min: cx - hx,
            x_max: cx + hx,
            y_min: cy - hy,
            y_max: cy + hy,
        }
    }

    pub fn include(&mut self, x: f64, y: f64) {
        self.x_min = self.x_min.min(x);
        self.x_max = self.x_max.max(x);
        self.y_min = self.y_min.min(y);
        self.y_max = self.y_max.max(y);
    }

    pub fn union(&mut self, other: &Extents) {
        self.x_min = self.x_min.min(other.x_min);
        self.x_max = self.x_max.max(other.x_max);
        self.y_min = self.y_min.min(other.y_min);
        self.y_max = self.y_max.max(other.y_max);
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Extents {
        Extents {
            x_min: self.x_min + dx,
            x_max: self.x_max + dx,
            y_min: self.y_min + dy,
            y_max: self.y_max + dy,
        }
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

/// A reconstructed circular arc, ready to draw.
///
/// `end_angle` is direction-adjusted at construction: at or below
/// `start_angle` for clockwise arcs, at or above it for counter-clockwise,
/// so interpolating linearly between the two follows the commanded
/// direction and a full revolution spans exactly 2π.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcSegment {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
    pub start_angle: f64,
    pub end_angle: f64,
    pub clockwise: bool,
}

impl ArcSegment {
    pub fn sweep(&self) -> f64 {
        (self.end_angle - self.start_angle).abs()
    }

    pub fn arc_length(&self) -> f64 {
        self.sweep() * self.radius
    }

    pub fn point_at(&self, t: f64) -> (f64, f64) {
        let angle = self.start_angle + (self.end_angle - self.start_angle) * t;
        (
            self.center_x + self.radius * angle.cos(),
            self.center_y + self.radius * angle.sin(),
        )
    }

    pub fn start_point(&self) -> (f64, f64) {
        self.point_at(0.0)
    }

    pub fn end_point(&self) -> (f64, f64) {
        self.point_at(1.0)
    }
}

/// Rotate `(x, y)` about the origin by `degrees` counter-clockwise.
pub fn rotate_deg(x: f64, y: f64, degrees: f64) -> (f64, f64) {
    if degrees == 0.0 {
        return (x, y);
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    (x * cos - y * sin, x * sin + y * cos)
}

/// Normalize an angle into `[0, 2π)`.
pub fn normalize_positive(angle: f64) -> f64 {
    let wrapped = angle % TAU;
    if wrapped < 0.0 {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// The positive sweep from `start` to `end` travelling in the given
/// direction. A coincident start and end yields zero, not a full turn.
pub fn directed_sweep(start: f64, end: f64, clockwise: bool) -> f64 {
    if clockwise {
        normalize_positive(start - end)
    } else {
        normalize_positive(end - start)
    }
}

/// Whether an arc that starts at `start` and travels `sweep` radians in the
/// given direction passes through the angle `target`.
pub fn arc_covers_angle(start: f64, sweep: f64, clockwise: bool, target: f64) -> bool {
    if sweep >= TAU {
        return true;
    }
    let offset = if clockwise {
        normalize_positive(start - target)
    } else {
        normalize_positive(target - start)
    };
    offset <= sweep
}

/// Compare coordinates at three orders of magnitude below the file
/// precision, matching the arc-center radius tolerance.
pub fn epsilon_equals(a: f64, b: f64, precision: f64) -> bool {
    (a - b).abs() < precision / 1000.0
}

/// Convex hull of a point set (monotone chain), counter-clockwise.
///
/// Used for the envelope of a rectangle aperture swept along a line.
pub fn convex_hull(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut sorted: Vec<(f64, f64)> = points.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted.dedup();
    if sorted.len() < 3 {
        return sorted;
    }

    fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }

    let mut hull: Vec<(f64, f64)> = Vec::with_capacity(sorted.len() * 2);
    for &point in sorted.iter().chain(sorted.iter().rev().skip(1)) {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], point) <= 0.0 {
            hull.pop();
        }
        hull.push(point);
    }
    hull.pop();
    hull
}
