//! Standard apertures, holes, and the capability set every aperture
//! exposes: minimum feature size, extents, cached mask rendering, flashes,
//! and the stroke primitives used outside region mode.

use std::f64::consts::TAU;
use std::rc::Rc;

use log::debug;

use crate::expr::Environment;
use crate::geom::{convex_hull, ArcSegment, Extents};
use crate::state::GraphicsState;
use crate::surface::{Antialias, Operator, RasterSurface, Surface};

/// A concentric hole in a standard aperture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hole {
    Circular { diameter: f64 },
    Rectangular { width: f64, height: f64 },
}

/// A defined aperture. Macro apertures carry the modifier values that bind
/// `$1..$k` at instantiation.
#[derive(Debug, Clone, PartialEq)]
pub enum Aperture {
    Circle {
        diameter: f64,
        hole: Option<Hole>,
    },
    Rectangle {
        x_size: f64,
        y_size: f64,
        hole: Option<Hole>,
    },
    Obround {
        x_size: f64,
        y_size: f64,
        hole: Option<Hole>,
    },
    Polygon {
        outer_diameter: f64,
        vertices: u32,
        rotation: f64,
        hole: Option<Hole>,
    },
    Macro {
        name: String,
        args: Vec<f64>,
    },
}

/// A pre-rendered aperture mask at the fitted scale.
///
/// `x_min`/`y_max` are the Gerber-frame offsets from the flash point to the
/// mask's left and top edges (top in device orientation, after the Y-flip).
#[derive(Debug)]
pub struct ApertureMask {
    pub surface: RasterSurface,
    pub x_min: f64,
    pub y_max: f64,
}

impl Aperture {
    pub fn hole(&self) -> Option<Hole> {
        match self {
            Aperture::Circle { hole, .. }
            | Aperture::Rectangle { hole, .. }
            | Aperture::Obround { hole, .. }
            | Aperture::Polygon { hole, .. } => *hole,
            Aperture::Macro { .. } => None,
        }
    }

    /// The smallest radius useful for stepping a stroke with this aperture.
    pub fn min_feature_size(&self, state: &GraphicsState) -> Result<f64, String> {
        match self {
            Aperture::Circle { diameter, .. } => Ok(diameter / 2.0),
            Aperture::Rectangle { x_size, y_size, .. }
            | Aperture::Obround { x_size, y_size, .. } => Ok(x_size.min(*y_size) / 2.0),
            Aperture::Polygon { outer_diameter, .. } => Ok(outer_diameter / 2.0),
            Aperture::Macro { .. } => {
                let extents = self.extents(state)?;
                Ok(extents.width().min(extents.height()))
            }
        }
    }

    /// Extents relative to the flash point.
    pub fn extents(&self, state: &GraphicsState) -> Result<Extents, String> {
        match self {
            Aperture::Circle { diameter, .. } => {
                let radius = diameter / 2.0;
                Ok(Extents::centered(0.0, 0.0, radius, radius))
            }
            Aperture::Rectangle { x_size, y_size, .. }
            | Aperture::Obround { x_size, y_size, .. } => {
                Ok(Extents::centered(0.0, 0.0, x_size / 2.0, y_size / 2.0))
            }
            Aperture::Polygon { outer_diameter, .. } => {
                let radius = outer_diameter / 2.0;
                Ok(Extents::centered(0.0, 0.0, radius, radius))
            }
            Aperture::Macro { name, args } => {
                let definition = state
                    .macros
                    .get(name)
                    .ok_or_else(|| format!("macro `{name}` is not defined"))?;
                definition.bounds(&Environment::from_args(args))
            }
        }
    }

    /// The axis-aligned extent when flashed at `(x, y)`.
    pub fn bounds_at(&self, state: &GraphicsState, x: f64, y: f64) -> Result<Extents, String> {
        Ok(self.extents(state)?.translated(x, y))
    }
}

/// Fetch the cached mask for an aperture, rendering it on first use.
///
/// The no-hole variant exists because stroked lines and arcs must not show
/// the hole along the stroke interior; for apertures without holes both
/// cache entries alias one handle.
pub fn cached_mask(
    state: &mut GraphicsState,
    code: u32,
    with_hole: bool,
) -> Result<Rc<ApertureMask>, String> {
    let cache = if with_hole {
        &state.mask_cache
    } else {
        &state.mask_cache_no_hole
    };
    if let Some(mask) = cache.get(&code) {
        return Ok(mask.clone());
    }

    let aperture = state
        .apertures
        .get(&code)
        .cloned()
        .ok_or_else(|| format!("aperture D{code} is not defined"))?;

    let no_hole = Rc::new(render_mask(&aperture, state)?);
    debug!(
        "rendered mask for aperture D{code}: {}x{} px",
        no_hole.surface.width(),
        no_hole.surface.height()
    );
    let holed = match aperture.hole() {
        Some(hole) => Rc::new(subtract_hole(&no_hole, hole)),
        None => no_hole.clone(),
    };
    state.mask_cache_no_hole.insert(code, no_hole.clone());
    state.mask_cache.insert(code, holed.clone());

    Ok(if with_hole { holed } else { no_hole })
}

/// Render an aperture to a fresh mask surface at the fitted scale.
///
/// The surface is sized to the aperture extents; its transform maps the
/// Gerber frame (flash point at the origin, Y up) to device pixels, so the
/// shape routines below draw in unscaled coordinates.
fn render_mask(aperture: &Aperture, state: &GraphicsState) -> Result<ApertureMask, String> {
    let extents = aperture.extents(state)?;
    if !extents.width().is_finite() || !extents.height().is_finite() {
        // A macro expression dividing by zero gets here.
        return Err("aperture extents are not finite".into());
    }
    let scale = state.scale_factor;
    let width = (extents.width() * scale).ceil().max(1.0) as u32;
    let height = (extents.height() * scale).ceil().max(1.0) as u32;

    let mut surface = RasterSurface::new_mask(width, height);
    surface.set_antialias(Antialias::Default);
    surface.set_source_rgba(0.0, 0.0, 0.0, 1.0);
    surface.translate(-extents.x_min * scale, extents.y_max * scale);
    surface.scale(scale, -scale);

    match aperture {
        Aperture::Circle { diameter, .. } => {
            if *diameter > 0.0 {
                surface.arc(0.0, 0.0, diameter / 2.0, 0.0, TAU);
                surface.fill();
            }
        }
        Aperture::Rectangle { x_size, y_size, .. } => {
            fill_centered_rect(&mut surface, 0.0, 0.0, *x_size, *y_size);
        }
        Aperture::Obround { x_size, y_size, .. } => {
            fill_obround(&mut surface, *x_size, *y_size);
        }
        Aperture::Polygon {
            outer_diameter,
            vertices,
            rotation,
            ..
        } => {
            // Vertex 0 sits on +X; the rotation turns the whole surface.
            surface.save();
            surface.rotate(rotation.to_radians());
            let radius = outer_diameter / 2.0;
            for k in 0..*vertices {
                let angle = TAU * k as f64 / *vertices as f64;
                let x = radius * angle.cos();
                let y = radius * angle.sin();
                if k == 0 {
                    surface.move_to(x, y);
                } else {
                    surface.line_to(x, y);
                }
            }
            surface.close_path();
            surface.fill();
            surface.restore();
        }
        Aperture::Macro { name, args } => {
            let definition = state
                .macros
                .get(name)
                .ok_or_else(|| format!("macro `{name}` is not defined"))?;
            definition.render(&mut surface, &Environment::from_args(args))?;
        }
    }

    Ok(ApertureMask {
        surface,
        x_min: extents.x_min,
        y_max: extents.y_max,
    })
}

/// Deep-copy a rendered mask and clear the hole out of the copy.
fn subtract_hole(mask: &ApertureMask, hole: Hole) -> ApertureMask {
    let mut surface = mask.surface.clone();
    // The clone keeps the Gerber-frame transform set up by render_mask.
    surface.set_operator(Operator::Clear);
    match hole {
        Hole::Circular { diameter } => {
            if diameter > 0.0 {
                surface.arc(0.0, 0.0, diameter / 2.0, 0.0, TAU);
                surface.fill();
            }
        }
        Hole::Rectangular { width, height } => {
            if width > 0.0 && height > 0.0 {
                fill_centered_rect(&mut surface, 0.0, 0.0, width, height);
            }
        }
    }
    surface.set_operator(Operator::Over);
    ApertureMask {
        surface,
        x_min: mask.x_min,
        y_max: mask.y_max,
    }
}

fn fill_centered_rect(surface: &mut RasterSurface, cx: f64, cy: f64, width: f64, height: f64) {
    let hw = width / 2.0;
    let hh = height / 2.0;
    surface.move_to(cx - hw, cy - hh);
    surface.line_to(cx + hw, cy - hh);
    surface.line_to(cx + hw, cy + hh);
    surface.line_to(cx - hw, cy + hh);
    surface.close_path();
    surface.fill();
}

/// Two semicircles joined by a rectangle, oriented along the longer axis.
fn fill_obround(surface: &mut RasterSurface, x_size: f64, y_size: f64) {
    use std::f64::consts::{FRAC_PI_2, PI};
    if x_size > y_size {
        let radius = y_size / 2.0;
        let cap = (x_size - y_size) / 2.0;
        surface.arc(-cap, 0.0, radius, FRAC_PI_2, FRAC_PI_2 + PI);
        surface.arc(cap, 0.0, radius, -FRAC_PI_2, FRAC_PI_2);
        surface.close_path();
        surface.fill();
    } else if y_size > x_size {
        let radius = x_size / 2.0;
        let cap = (y_size - x_size) / 2.0;
        surface.arc(0.0, -cap, radius, PI, TAU);
        surface.arc(0.0, cap, radius, 0.0, PI);
        surface.close_path();
        surface.fill();
    } else if x_size > 0.0 {
        surface.arc(0.0, 0.0, x_size / 2.0, 0.0, TAU);
        surface.fill();
    }
}

/// Flash an aperture mask at a Gerber-frame point.
///
/// Masks are pre-scaled, so placement happens directly in device pixels;
/// the surface's one Y-flip is baked into the `image_height - ...` term.
pub fn flash_mask(
    surface: &mut RasterSurface,
    state: &mut GraphicsState,
    code: u32,
    x: f64,
    y: f64,
    with_hole: bool,
) -> Result<(), String> {
    let mask = cached_mask(state, code, with_hole)?;
    let device_x = (x + mask.x_min) * state.scale_factor + state.x_offset;
    let device_y =
        state.image_height as f64 - ((y + mask.y_max) * state.scale_factor + state.y_offset);
    surface.mask_surface(&mask.surface, device_x, device_y);
    Ok(())
}

impl Aperture {
    /// Stroke a straight segment with this aperture (region mode off).
    pub fn stroke_linear(
        &self,
        surface: &mut RasterSurface,
        state: &mut GraphicsState,
        code: u32,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Result<(), String> {
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let length = dx.hypot(dy);

        match self {
            Aperture::Circle { diameter, hole } => {
                let radius = diameter / 2.0;
                if length == 0.0 {
                    return flash_mask(surface, state, code, start.0, start.1, false);
                }
                if hole.is_some() && length < radius {
                    // A hole in a short stroke would punch through; step the
                    // full mask along the segment instead.
                    let steps = state.stroke_sub_steps.max(1);
                    for k in 0..=steps {
                        let t = k as f64 / steps as f64;
                        flash_mask(
                            surface,
                            state,
                            code,
                            start.0 + dx * t,
                            start.1 + dy * t,
                            true,
                        )?;
                    }
                    return Ok(());
                }
                // Optimized draw: the stroke body is the rectangle between
                // the endpoints offset by the radius; the endpoint flashes
                // cover the hole.
                let px = -dy / length * radius;
                let py = dx / length * radius;
                surface.move_to(start.0 + px, start.1 + py);
                surface.line_to(end.0 + px, end.1 + py);
                surface.line_to(end.0 - px, end.1 - py);
                surface.line_to(start.0 - px, start.1 - py);
                surface.close_path();
                surface.fill();
                flash_mask(surface, state, code, start.0, start.1, false)?;
                flash_mask(surface, state, code, end.0, end.1, false)
            }
            Aperture::Rectangle { x_size, y_size, .. } => {
                if length == 0.0 {
                    return flash_mask(surface, state, code, start.0, start.1, false);
                }
                // The swept rectangle covers the convex hull of the corner
                // positions at both endpoints.
                let hw = x_size / 2.0;
                let hh = y_size / 2.0;
                let mut corners = Vec::with_capacity(8);
                for &(cx, cy) in &[start, end] {
                    corners.push((cx - hw, cy - hh));
                    corners.push((cx + hw, cy - hh));
                    corners.push((cx + hw, cy + hh));
                    corners.push((cx - hw, cy + hh));
                }
                let hull = convex_hull(&corners);
                if let Some((&first, rest)) = hull.split_first() {
                    surface.move_to(first.0, first.1);
                    for &(x, y) in rest {
                        surface.line_to(x, y);
                    }
                    surface.close_path();
                    surface.fill();
                }
                flash_mask(surface, state, code, start.0, start.1, false)?;
                flash_mask(surface, state, code, end.0, end.1, false)
            }
            _ => {
                // Obround, polygon, and macro apertures stroke as
                // successive flashes along the center line.
                let step = (self.min_feature_size(state)? / 2.0).max(1e-9);
                let steps = ((length / step).ceil() as u32).max(1);
                for k in 0..=steps {
                    let t = k as f64 / steps as f64;
                    flash_mask(
                        surface,
                        state,
                        code,
                        start.0 + dx * t,
                        start.1 + dy * t,
                        true,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Stroke a circular arc with this aperture (region mode off).
    pub fn stroke_arc(
        &self,
        surface: &mut RasterSurface,
        state: &mut GraphicsState,
        code: u32,
        arc: &ArcSegment,
    ) -> Result<(), String> {
        let start = arc.start_point();
        let end = arc.end_point();

        match self {
            Aperture::Circle { diameter, hole } => {
                let pen_radius = diameter / 2.0;
                if arc.sweep() == 0.0 {
                    return flash_mask(surface, state, code, start.0, start.1, false);
                }
                if hole.is_some() && arc.arc_length() < pen_radius {
                    let steps = state.stroke_sub_steps.max(1);
                    for k in 0..=steps {
                        let (x, y) = arc.point_at(k as f64 / steps as f64);
                        flash_mask(surface, state, code, x, y, true)?;
                    }
                    return Ok(());
                }
                // Annular wedge between radius +/- pen radius, following
                // the commanded direction, endpoints flashed without holes.
                let outer = arc.radius + pen_radius;
                let inner = (arc.radius - pen_radius).max(0.0);
                // Clockwise sweeps with decreasing Gerber angle; paths are
                // built in the Gerber frame (the surface transform carries
                // the Y-flip), so clockwise maps to arc_negative here.
                if arc.clockwise {
                    surface.arc_negative(
                        arc.center_x,
                        arc.center_y,
                        outer,
                        arc.start_angle,
                        arc.end_angle,
                    );
                    surface.arc(
                        arc.center_x,
                        arc.center_y,
                        inner,
                        arc.end_angle,
                        arc.start_angle,
                    );
                } else {
                    surface.arc(
                        arc.center_x,
                        arc.center_y,
                        outer,
                        arc.start_angle,
                        arc.end_angle,
                    );
                    surface.arc_negative(
                        arc.center_x,
                        arc.center_y,
                        inner,
                        arc.end_angle,
                        arc.start_angle,
                    );
                }
                surface.close_path();
                surface.fill();
                flash_mask(surface, state, code, start.0, start.1, false)?;
                flash_mask(surface, state, code, end.0, end.1, false)
            }
            _ => {
                let step = (self.min_feature_size(state)? / 2.0).max(1e-9);
                let steps = ((arc.arc_length() / step).ceil() as u32).max(1);
                for k in 0..=steps {
                    let (x, y) = arc.point_at(k as f64 / steps as f64);
                    flash_mask(surface, state, code, x, y, true)?;
                }
                Ok(())
            }
        }
    }
}
