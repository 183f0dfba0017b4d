//! RGBA raster implementation of the [`Surface`] contract.
//!
//! Paths are flattened into device-space polylines as they are built, so the
//! transform in effect at construction time is the one that applies (as in
//! cairo). Fills run a scanline even-odd pass over the flattened subpaths,
//! optionally supersampled 4x vertically when antialiasing is on.

use std::path::Path;

use image::RgbaImage;

use super::{Antialias, FillRule, Operator, Surface};
use crate::error::GerberError;

/// Chord deviation tolerance for arc flattening, in device pixels.
const ARC_TOLERANCE: f64 = 0.2;

/// Row supersampling factor for antialiased fills.
const AA_SUBSAMPLES: usize = 4;

/// 2D affine transform, cairo layout: `x' = xx*x + xy*y + x0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Matrix {
    xx: f64,
    yx: f64,
    xy: f64,
    yy: f64,
    x0: f64,
    y0: f64,
}

impl Matrix {
    fn identity() -> Self {
        Matrix {
            xx: 1.0,
            yx: 0.0,
            xy: 0.0,
            yy: 1.0,
            x0: 0.0,
            y0: 0.0,
        }
    }

    /// `a * b`: apply `b` first, then `a`.
    fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
        Matrix {
            xx: a.xx * b.xx + a.xy * b.yx,
            yx: a.yx * b.xx + a.yy * b.yx,
            xy: a.xx * b.xy + a.xy * b.yy,
            yy: a.yx * b.xy + a.yy * b.yy,
            x0: a.xx * b.x0 + a.xy * b.y0 + a.x0,
            y0: a.yx * b.x0 + a.yy * b.y0 + a.y0,
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.xx * x + self.xy * y + self.x0,
            self.yx * x + self.yy * y + self.y0,
        )
    }

    /// Largest axis scale, used to pick arc flattening density.
    fn scale_magnitude(&self) -> f64 {
        let sx = self.xx.hypot(self.yx);
        let sy = self.xy.hypot(self.yy);
        sx.max(sy)
    }
}

/// Saved graphics state for save/restore pairs.
#[derive(Debug, Clone, Copy)]
struct GState {
    ctm: Matrix,
    source: [f64; 4],
    operator: Operator,
    antialias: Antialias,
}

/// An RGBA8 surface with a transform stack and a flattened path under
/// construction.
#[derive(Debug, Clone)]
pub struct RasterSurface {
    width: u32,
    height: u32,
    pixels: RgbaImage,
    ctm: Matrix,
    saved: Vec<GState>,
    source: [f64; 4],
    operator: Operator,
    #[allow(dead_code)]
    fill_rule: FillRule,
    antialias: Antialias,
    /// Device-space subpaths of the path under construction.
    subpaths: Vec<Vec<(f64, f64)>>,
    /// User-space current point, tracked for arc segment connection.
    current: Option<(f64, f64)>,
}

impl RasterSurface {
    /// An opaque white surface, used for the output image.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_fill(width, height, [255, 255, 255, 255])
    }

    /// A fully transparent surface, used for aperture masks.
    pub fn new_mask(width: u32, height: u32) -> Self {
        Self::with_fill(width, height, [0, 0, 0, 0])
    }

    fn with_fill(width: u32, height: u32, fill: [u8; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let pixels = RgbaImage::from_pixel(width, height, image::Rgba(fill));
        RasterSurface {
            width,
            height,
            pixels,
            ctm: Matrix::identity(),
            saved: Vec::new(),
            source: [0.0, 0.0, 0.0, 1.0],
            operator: Operator::Over,
            fill_rule: FillRule::EvenOdd,
            antialias: Antialias::None,
            subpaths: Vec::new(),
            current: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.pixels.get_pixel(x, y).0
    }

    /// Alpha channel at a pixel; the coverage value of mask surfaces.
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.pixels.get_pixel(x, y).0[3]
    }

    fn push_device_point(&mut self, x: f64, y: f64) {
        match self.subpaths.last_mut() {
            Some(subpath) => subpath.push((x, y)),
            None => self.subpaths.push(vec![(x, y)]),
        }
    }

    fn add_arc(&mut self, cx: f64, cy: f64, radius: f64, angle0: f64, angle1: f64, negative: bool) {
        let mut end = angle1;
        if negative {
            while end > angle0 {
                end -= std::f64::consts::TAU;
            }
        } else {
            while end < angle0 {
                end += std::f64::consts::TAU;
            }
        }
        let sweep = end - angle0;

        let start_x = cx + radius * angle0.cos();
        let start_y = cy + radius * angle0.sin();
        // As in cairo: an arc with a current point gets a connecting line
        // segment, otherwise it starts a new subpath.
        if self.current.is_some() {
            self.line_to(start_x, start_y);
        } else {
            self.move_to(start_x, start_y);
        }

        let device_radius = radius * self.ctm.scale_magnitude();
        let steps = arc_steps(sweep.abs(), device_radius);
        for k in 1..=steps {
            let angle = angle0 + sweep * (k as f64) / (steps as f64);
            let x = cx + radius * angle.cos();
            let y = cy + radius * angle.sin();
            let (dx, dy) = self.ctm.apply(x, y);
            self.push_device_point(dx, dy);
            self.current = Some((x, y));
        }
    }

    /// Composite `coverage` of the current source into one pixel.
    fn blend(&mut self, x: i64, y: i64, coverage: f64) {
        if coverage <= 0.0 || x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let coverage = coverage.min(1.0);
        let pixel = self.pixels.get_pixel_mut(x as u32, y as u32);
        match self.operator {
            Operator::Over => {
                let alpha = self.source[3] * coverage;
                for channel in 0..3 {
                    let src = self.source[channel] * 255.0;
                    let dst = pixel.0[channel] as f64;
                    pixel.0[channel] = (src * alpha + dst * (1.0 - alpha)).round() as u8;
                }
                let dst_a = pixel.0[3] as f64 / 255.0;
                let out_a = alpha + dst_a * (1.0 - alpha);
                pixel.0[3] = (out_a * 255.0).round() as u8;
            }
            Operator::Clear => {
                let keep = 1.0 - coverage * self.source[3];
                for channel in 0..4 {
                    pixel.0[channel] = (pixel.0[channel] as f64 * keep).round() as u8;
                }
            }
        }
    }

    /// Scanline even-odd fill of the flattened subpaths.
    fn fill_subpaths(&mut self) {
        let mut edges: Vec<((f64, f64), (f64, f64))> = Vec::new();
        let mut y_min = f64::INFINITY;
        let mut y_max = f64::NEG_INFINITY;

        for subpath in &self.subpaths {
            if subpath.len() < 2 {
                continue;
            }
            let n = subpath.len();
            for k in 0..n {
                // Subpaths close implicitly for filling.
                let a = subpath[k];
                let b = subpath[(k + 1) % n];
                if a.1 != b.1 {
                    edges.push((a, b));
                    y_min = y_min.min(a.1.min(b.1));
                    y_max = y_max.max(a.1.max(b.1));
                }
            }
        }

        if edges.is_empty() {
            return;
        }

        let row_start = (y_min.floor().max(0.0)) as i64;
        let row_end = (y_max.ceil().min(self.height as f64)) as i64;
        let subsamples = match self.antialias {
            Antialias::None => 1,
            Antialias::Default => AA_SUBSAMPLES,
        };
        let weight = 1.0 / subsamples as f64;
        let mut coverage = vec![0.0f64; self.width as usize];
        let mut crossings: Vec<f64> = Vec::new();

        for row in row_start..row_end {
            coverage.iter_mut().for_each(|c| *c = 0.0);
            let mut touched = false;

            for sub in 0..subsamples {
                let sample_y = row as f64 + (sub as f64 + 0.5) / subsamples as f64;
                crossings.clear();
                for &((x1, y1), (x2, y2)) in &edges {
                    let (top, bottom) = if y1 < y2 { (y1, y2) } else { (y2, y1) };
                    // Half-open interval keeps shared vertices from double
                    // counting under even-odd.
                    if sample_y >= top && sample_y < bottom {
                        let t = (sample_y - y1) / (y2 - y1);
                        crossings.push(x1 + t * (x2 - x1));
                    }
                }
                if crossings.is_empty() {
                    continue;
                }
                crossings.sort_by(|a, b| a.partial_cmp(b).unwrap());
                for pair in crossings.chunks_exact(2) {
                    let (span_a, span_b) = (pair[0], pair[1]);
                    if span_b <= span_a {
                        continue;
                    }
                    touched = true;
                    match self.antialias {
                        Antialias::None => {
                            // A pixel is covered when its center lies inside
                            // the span.
                            let first = (span_a - 0.5).ceil().max(0.0) as usize;
                            let last = ((span_b - 0.5).ceil().min(self.width as f64)) as usize;
                            for cell in coverage.iter_mut().take(last).skip(first) {
                                *cell += 1.0;
                            }
                        }
                        Antialias::Default => {
                            let first = span_a.floor().max(0.0) as usize;
                            let last = (span_b.ceil().min(self.width as f64)) as usize;
                            for (i, cell) in
                                coverage.iter_mut().enumerate().take(last).skip(first)
                            {
                                let left = (i as f64).max(span_a);
                                let right = ((i + 1) as f64).min(span_b);
                                if right > left {
                                    *cell += (right - left) * weight;
                                }
                            }
                        }
                    }
                }
            }

            if touched {
                for x in 0..self.width as usize {
                    if coverage[x] > 0.0 {
                        self.blend(x as i64, row, coverage[x]);
                    }
                }
            }
        }
    }
}

fn arc_steps(sweep: f64, device_radius: f64) -> usize {
    if device_radius <= ARC_TOLERANCE {
        return 2;
    }
    let max_step = 2.0 * (1.0 - ARC_TOLERANCE / device_radius).acos();
    ((sweep / max_step).ceil() as usize).clamp(2, 4096)
}

impl Surface for RasterSurface {
    fn save(&mut self) {
        self.saved.push(GState {
            ctm: self.ctm,
            source: self.source,
            operator: self.operator,
            antialias: self.antialias,
        });
    }

    fn restore(&mut self) {
        if let Some(state) = self.saved.pop() {
            self.ctm = state.ctm;
            self.source = state.source;
            self.operator = state.operator;
            self.antialias = state.antialias;
        }
    }

    fn scale(&mut self, sx: f64, sy: f64) {
        let op = Matrix {
            xx: sx,
            yx: 0.0,
            xy: 0.0,
            yy: sy,
            x0: 0.0,
            y0: 0.0,
        };
        self.ctm = Matrix::multiply(&self.ctm, &op);
    }

    fn translate(&mut self, tx: f64, ty: f64) {
        let op = Matrix {
            xx: 1.0,
            yx: 0.0,
            xy: 0.0,
            yy: 1.0,
            x0: tx,
            y0: ty,
        };
        self.ctm = Matrix::multiply(&self.ctm, &op);
    }

    fn rotate(&mut self, theta: f64) {
        let (sin, cos) = theta.sin_cos();
        let op = Matrix {
            xx: cos,
            yx: sin,
            xy: -sin,
            yy: cos,
            x0: 0.0,
            y0: 0.0,
        };
        self.ctm = Matrix::multiply(&self.ctm, &op);
    }

    fn set_source_rgba(&mut self, r: f64, g: f64, b: f64, a: f64) {
        self.source = [r, g, b, a];
    }

    fn set_antialias(&mut self, antialias: Antialias) {
        self.antialias = antialias;
    }

    fn set_fill_rule(&mut self, rule: FillRule) {
        self.fill_rule = rule;
    }

    fn set_operator(&mut self, operator: Operator) {
        self.operator = operator;
    }

    fn move_to(&mut self, x: f64, y: f64) {
        let (dx, dy) = self.ctm.apply(x, y);
        self.subpaths.push(vec![(dx, dy)]);
        self.current = Some((x, y));
    }

    fn line_to(&mut self, x: f64, y: f64) {
        if self.current.is_none() {
            self.move_to(x, y);
            return;
        }
        let (dx, dy) = self.ctm.apply(x, y);
        self.push_device_point(dx, dy);
        self.current = Some((x, y));
    }

    fn arc(&mut self, cx: f64, cy: f64, radius: f64, angle0: f64, angle1: f64) {
        self.add_arc(cx, cy, radius, angle0, angle1, false);
    }

    fn arc_negative(&mut self, cx: f64, cy: f64, radius: f64, angle0: f64, angle1: f64) {
        self.add_arc(cx, cy, radius, angle0, angle1, true);
    }

    fn close_path(&mut self) {
        if let Some(subpath) = self.subpaths.last_mut() {
            if let Some(&first) = subpath.first() {
                subpath.push(first);
            }
        }
        // The user-space current point returns to the subpath start; the
        // next move_to will reset it anyway, which is the only way region
        // contours continue from here.
        self.current = None;
    }

    fn fill(&mut self) {
        self.fill_subpaths();
        self.subpaths.clear();
        self.current = None;
    }

    fn mask_surface(&mut self, mask: &RasterSurface, x: f64, y: f64) {
        let x0 = x.round() as i64;
        let y0 = y.round() as i64;
        for my in 0..mask.height {
            for mx in 0..mask.width {
                let alpha = mask.alpha(mx, my);
                if alpha > 0 {
                    self.blend(
                        x0 + mx as i64,
                        y0 + my as i64,
                        alpha as f64 / 255.0,
                    );
                }
            }
        }
    }

    fn finish(&mut self) {
        self.subpaths.clear();
        self.saved.clear();
        self.current = None;
    }

    fn write_png(&self, path: &Path) -> Result<(), GerberError> {
        self.pixels
            .save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black(surface: &RasterSurface, x: u32, y: u32) -> bool {
        let [r, g, b, _] = surface.pixel(x, y);
        r < 64 && g < 64 && b < 64
    }

    #[test]
    fn test_new_surface_is_white() {
        let surface = RasterSurface::new(8, 8);
        assert_eq!(surface.pixel(4, 4), [255, 255, 255, 255]);
    }

    #[test]
    fn test_mask_surface_is_transparent() {
        let surface = RasterSurface::new_mask(8, 8);
        assert_eq!(surface.alpha(4, 4), 0);
    }

    #[test]
    fn test_fill_rectangle() {
        let mut surface = RasterSurface::new(20, 20);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.move_to(5.0, 5.0);
        surface.line_to(15.0, 5.0);
        surface.line_to(15.0, 15.0);
        surface.line_to(5.0, 15.0);
        surface.close_path();
        surface.fill();

        assert!(black(&surface, 10, 10));
        assert!(!black(&surface, 2, 2));
        assert!(!black(&surface, 17, 10));
    }

    #[test]
    fn test_even_odd_cutout() {
        // Outer square with an inner square in the same path: even-odd
        // leaves the inner region unfilled.
        let mut surface = RasterSurface::new(40, 40);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.move_to(5.0, 5.0);
        surface.line_to(35.0, 5.0);
        surface.line_to(35.0, 35.0);
        surface.line_to(5.0, 35.0);
        surface.close_path();
        surface.move_to(15.0, 15.0);
        surface.line_to(25.0, 15.0);
        surface.line_to(25.0, 25.0);
        surface.line_to(15.0, 25.0);
        surface.close_path();
        surface.fill();

        assert!(black(&surface, 10, 10), "ring body should be filled");
        assert!(!black(&surface, 20, 20), "inner square should be cut out");
    }

    #[test]
    fn test_arc_full_circle_fill() {
        let mut surface = RasterSurface::new(40, 40);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.arc(20.0, 20.0, 10.0, 0.0, std::f64::consts::TAU);
        surface.fill();

        assert!(black(&surface, 20, 20));
        assert!(black(&surface, 26, 20));
        assert!(!black(&surface, 20, 5));
    }

    #[test]
    fn test_transform_scale_translate() {
        // A unit square scaled 10x and translated lands at (10..20, 10..20).
        let mut surface = RasterSurface::new(40, 40);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.translate(10.0, 10.0);
        surface.scale(10.0, 10.0);
        surface.move_to(0.0, 0.0);
        surface.line_to(1.0, 0.0);
        surface.line_to(1.0, 1.0);
        surface.line_to(0.0, 1.0);
        surface.close_path();
        surface.fill();

        assert!(black(&surface, 15, 15));
        assert!(!black(&surface, 25, 25));
    }

    #[test]
    fn test_y_flip_transform() {
        // scale(1,-1); translate(0,-H) maps user y=0 to device y=H.
        let mut surface = RasterSurface::new(20, 20);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.scale(1.0, -1.0);
        surface.translate(0.0, -20.0);
        // Square near user-space origin (bottom of the device image).
        surface.move_to(2.0, 2.0);
        surface.line_to(8.0, 2.0);
        surface.line_to(8.0, 8.0);
        surface.line_to(2.0, 8.0);
        surface.close_path();
        surface.fill();

        assert!(black(&surface, 5, 15), "user y=5 should land near device bottom");
        assert!(!black(&surface, 5, 5));
    }

    #[test]
    fn test_save_restore() {
        let mut surface = RasterSurface::new(10, 10);
        surface.save();
        surface.scale(5.0, 5.0);
        surface.set_source_rgba(1.0, 0.0, 0.0, 1.0);
        surface.restore();
        // Back to identity transform and black source.
        surface.move_to(1.0, 1.0);
        surface.line_to(9.0, 1.0);
        surface.line_to(9.0, 9.0);
        surface.line_to(1.0, 9.0);
        surface.fill();
        assert!(black(&surface, 5, 5));
    }

    #[test]
    fn test_operator_clear_erases_alpha() {
        let mut mask = RasterSurface::new_mask(20, 20);
        mask.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        mask.arc(10.0, 10.0, 8.0, 0.0, std::f64::consts::TAU);
        mask.fill();
        assert!(mask.alpha(10, 10) > 200);

        mask.set_operator(Operator::Clear);
        mask.arc(10.0, 10.0, 3.0, 0.0, std::f64::consts::TAU);
        mask.fill();
        assert_eq!(mask.alpha(10, 10), 0, "hole should be cleared");
        assert!(mask.alpha(16, 10) > 200, "rim should survive");
    }

    #[test]
    fn test_mask_composite() {
        let mut mask = RasterSurface::new_mask(5, 5);
        mask.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        mask.move_to(0.0, 0.0);
        mask.line_to(5.0, 0.0);
        mask.line_to(5.0, 5.0);
        mask.line_to(0.0, 5.0);
        mask.fill();

        let mut surface = RasterSurface::new(20, 20);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.mask_surface(&mask, 10.0, 10.0);

        assert!(black(&surface, 12, 12));
        assert!(!black(&surface, 5, 5));
    }

    #[test]
    fn test_antialias_produces_partial_coverage() {
        let mut surface = RasterSurface::new(20, 20);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.set_antialias(Antialias::Default);
        // A diagonal triangle must produce at least one intermediate gray.
        surface.move_to(2.0, 2.0);
        surface.line_to(18.0, 2.0);
        surface.line_to(2.0, 18.0);
        surface.close_path();
        surface.fill();

        let mut saw_gray = false;
        for y in 0..20 {
            for x in 0..20 {
                let [r, ..] = surface.pixel(x, y);
                if r > 16 && r < 240 {
                    saw_gray = true;
                }
            }
        }
        assert!(saw_gray, "antialiased edge should contain gray pixels");
    }

    #[test]
    fn test_arc_negative_direction() {
        // A half annulus built clockwise: outer arc from 0 down to -pi,
        // inner arc back. Covers the lower half in math coordinates,
        // which is the upper device half without a flip.
        let mut surface = RasterSurface::new(40, 40);
        surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
        surface.arc_negative(20.0, 20.0, 15.0, 0.0, -std::f64::consts::PI);
        surface.arc(20.0, 20.0, 5.0, -std::f64::consts::PI, 0.0);
        surface.close_path();
        surface.fill();

        assert!(black(&surface, 20, 10), "annulus upper device half");
        assert!(!black(&surface, 20, 30), "other half empty");
        assert!(!black(&surface, 20, 20), "annulus center empty");
    }
}
