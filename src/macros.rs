//! Aperture macros: user-defined apertures composed of parametric
//! primitives.
//!
//! A macro body is a small program: comments, variable assignments, and
//! primitive statements whose every numeric field is an expression. Values
//! resolve when the aperture is instantiated, against an environment seeded
//! from the %AD modifier list. Rendering honors exposure (off erases via
//! operator-clear) under the surface's even-odd fill rule, so rings and
//! cut-outs compose.

use std::f64::consts::TAU;

use crate::expr::{parse_expression, Environment, Expr};
use crate::geom::{rotate_deg, Extents};
use crate::surface::{Operator, RasterSurface, Surface};

/// One statement in a macro body.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroStatement {
    Comment(String),
    VariableAssign { number: u32, value: Expr },
    Primitive(MacroPrimitive),
}

/// A macro primitive. Rotation fields are in degrees, counter-clockwise
/// about the macro origin.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroPrimitive {
    Circle {
        exposure: Expr,
        diameter: Expr,
        center_x: Expr,
        center_y: Expr,
    },
    VectorLine {
        exposure: Expr,
        width: Expr,
        start_x: Expr,
        start_y: Expr,
        end_x: Expr,
        end_y: Expr,
        rotation: Expr,
    },
    CenterLine {
        exposure: Expr,
        width: Expr,
        height: Expr,
        center_x: Expr,
        center_y: Expr,
        rotation: Expr,
    },
    LowerLeftLine {
        exposure: Expr,
        width: Expr,
        height: Expr,
        lower_left_x: Expr,
        lower_left_y: Expr,
        rotation: Expr,
    },
    Outline {
        exposure: Expr,
        /// All contour points including the start point.
        points: Vec<(Expr, Expr)>,
        rotation: Expr,
    },
    Polygon {
        exposure: Expr,
        num_vertices: Expr,
        center_x: Expr,
        center_y: Expr,
        diameter: Expr,
        rotation: Expr,
    },
    Moire {
        center_x: Expr,
        center_y: Expr,
        outer_diameter: Expr,
        ring_thickness: Expr,
        ring_gap: Expr,
        max_rings: Expr,
        cross_thickness: Expr,
        cross_length: Expr,
        rotation: Expr,
    },
    Thermal {
        center_x: Expr,
        center_y: Expr,
        outer_diameter: Expr,
        inner_diameter: Expr,
        gap_thickness: Expr,
        rotation: Expr,
    },
}

/// An aperture macro definition from an %AM block.
#[derive(Debug, Clone, PartialEq)]
pub struct ApertureMacro {
    pub name: String,
    pub statements: Vec<MacroStatement>,
}

impl ApertureMacro {
    /// Parse the `*`-separated statements of an %AM body (the name has
    /// already been split off by the parameter parser).
    pub fn parse(name: String, statements: &[&str]) -> Result<Self, String> {
        let mut parsed = Vec::with_capacity(statements.len());
        for statement in statements {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            parsed.push(parse_statement(statement)?);
        }
        Ok(ApertureMacro {
            name,
            statements: parsed,
        })
    }

    /// The union of the primitive extents, evaluated against `env`.
    ///
    /// Clear-exposure primitives only erase, so they never extend the
    /// bounds and are skipped.
    pub fn bounds(&self, env: &Environment) -> Result<Extents, String> {
        let mut env = env.clone();
        let mut bounds: Option<Extents> = None;

        for statement in &self.statements {
            match statement {
                MacroStatement::Comment(_) => {}
                MacroStatement::VariableAssign { number, value } => {
                    let resolved = value.eval(&env);
                    env.set(*number, resolved);
                }
                MacroStatement::Primitive(primitive) => {
                    if let Some(extents) = primitive_bounds(primitive, &env)? {
                        match &mut bounds {
                            Some(total) => total.union(&extents),
                            None => bounds = Some(extents),
                        }
                    }
                }
            }
        }

        bounds.ok_or_else(|| format!("macro `{}` has no drawable primitives", self.name))
    }

    /// Render the macro onto a prepared mask surface whose transform maps
    /// Gerber coordinates (macro origin at `(0, 0)`) to device pixels.
    pub fn render(&self, surface: &mut RasterSurface, env: &Environment) -> Result<(), String> {
        let mut env = env.clone();

        for statement in &self.statements {
            match statement {
                MacroStatement::Comment(_) => {}
                MacroStatement::VariableAssign { number, value } => {
                    let resolved = value.eval(&env);
                    env.set(*number, resolved);
                }
                MacroStatement::Primitive(primitive) => {
                    render_primitive(primitive, surface, &env)?;
                }
            }
        }

        Ok(())
    }
}

fn parse_statement(statement: &str) -> Result<MacroStatement, String> {
    // A leading `0` introduces a comment; the text after the space is kept.
    if statement == "0" {
        return Ok(MacroStatement::Comment(String::new()));
    }
    if let Some(text) = statement.strip_prefix("0 ") {
        return Ok(MacroStatement::Comment(text.to_string()));
    }

    // `$n=expr` assigns a variable.
    if let Some(rest) = statement.strip_prefix('$') {
        if let Some(eq) = rest.find('=') {
            let number: u32 = rest[..eq]
                .parse()
                .map_err(|_| format!("bad variable number in `{statement}`"))?;
            let value = parse_expression(&rest[eq + 1..]).map_err(|e| e.to_string())?;
            return Ok(MacroStatement::VariableAssign { number, value });
        }
    }

    let parts: Vec<&str> = statement.split(',').collect();
    let code: u32 = parts[0]
        .trim()
        .parse()
        .map_err(|_| format!("bad primitive code `{}`", parts[0]))?;
    let exprs: Vec<Expr> = parts[1..]
        .iter()
        .map(|p| parse_expression(p).map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;

    let arity = |expected: usize| -> Result<(), String> {
        if exprs.len() == expected {
            Ok(())
        } else {
            Err(format!(
                "primitive {code} takes {expected} modifiers, got {} in `{statement}`",
                exprs.len()
            ))
        }
    };

    let primitive = match code {
        1 => {
            arity(4)?;
            MacroPrimitive::Circle {
                exposure: exprs[0].clone(),
                diameter: exprs[1].clone(),
                center_x: exprs[2].clone(),
                center_y: exprs[3].clone(),
            }
        }
        2 | 20 => {
            arity(7)?;
            MacroPrimitive::VectorLine {
                exposure: exprs[0].clone(),
                width: exprs[1].clone(),
                start_x: exprs[2].clone(),
                start_y: exprs[3].clone(),
                end_x: exprs[4].clone(),
                end_y: exprs[5].clone(),
                rotation: exprs[6].clone(),
            }
        }
        21 => {
            arity(6)?;
            MacroPrimitive::CenterLine {
                exposure: exprs[0].clone(),
                width: exprs[1].clone(),
                height: exprs[2].clone(),
                center_x: exprs[3].clone(),
                center_y: exprs[4].clone(),
                rotation: exprs[5].clone(),
            }
        }
        22 => {
            arity(6)?;
            MacroPrimitive::LowerLeftLine {
                exposure: exprs[0].clone(),
                width: exprs[1].clone(),
                height: exprs[2].clone(),
                lower_left_x: exprs[3].clone(),
                lower_left_y: exprs[4].clone(),
                rotation: exprs[5].clone(),
            }
        }
        4 => {
            // exposure, n, sx, sy, (x,y) x n, rotation: 2n+5 modifiers.
            if exprs.len() < 7 || exprs.len() % 2 == 0 {
                return Err(format!(
                    "outline primitive needs an odd modifier count of at least 7, got {} in `{statement}`",
                    exprs.len()
                ));
            }
            let pair_count = (exprs.len() - 3) / 2;
            if let Expr::Literal(declared) = &exprs[1] {
                if *declared as usize + 1 != pair_count {
                    return Err(format!(
                        "outline declares {declared} points but carries {} pairs in `{statement}`",
                        pair_count - 1
                    ));
                }
            }
            let points = (0..pair_count)
                .map(|k| (exprs[2 + 2 * k].clone(), exprs[3 + 2 * k].clone()))
                .collect();
            MacroPrimitive::Outline {
                exposure: exprs[0].clone(),
                points,
                rotation: exprs[exprs.len() - 1].clone(),
            }
        }
        5 => {
            arity(6)?;
            MacroPrimitive::Polygon {
                exposure: exprs[0].clone(),
                num_vertices: exprs[1].clone(),
                center_x: exprs[2].clone(),
                center_y: exprs[3].clone(),
                diameter: exprs[4].clone(),
                rotation: exprs[5].clone(),
            }
        }
        6 => {
            arity(9)?;
            MacroPrimitive::Moire {
                center_x: exprs[0].clone(),
                center_y: exprs[1].clone(),
                outer_diameter: exprs[2].clone(),
                ring_thickness: exprs[3].clone(),
                ring_gap: exprs[4].clone(),
                max_rings: exprs[5].clone(),
                cross_thickness: exprs[6].clone(),
                cross_length: exprs[7].clone(),
                rotation: exprs[8].clone(),
            }
        }
        7 => {
            arity(6)?;
            MacroPrimitive::Thermal {
                center_x: exprs[0].clone(),
                center_y: exprs[1].clone(),
                outer_diameter: exprs[2].clone(),
                inner_diameter: exprs[3].clone(),
                gap_thickness: exprs[4].clone(),
                rotation: exprs[5].clone(),
            }
        }
        other => return Err(format!("unknown macro primitive code {other}")),
    };

    Ok(MacroStatement::Primitive(primitive))
}

fn exposure_on(exposure: &Expr, env: &Environment) -> bool {
    exposure.eval(env) >= 0.5
}

/// The four corners of a width x height rectangle centered at `(cx, cy)`,
/// rotated about the macro origin.
fn rect_corners(cx: f64, cy: f64, width: f64, height: f64, rotation: f64) -> [(f64, f64); 4] {
    let hw = width / 2.0;
    let hh = height / 2.0;
    [
        rotate_deg(cx - hw, cy - hh, rotation),
        rotate_deg(cx + hw, cy - hh, rotation),
        rotate_deg(cx + hw, cy + hh, rotation),
        rotate_deg(cx - hw, cy + hh, rotation),
    ]
}

fn extents_of(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Extents> {
    let mut iter = points.into_iter();
    let first = iter.next()?;
    let mut extents = Extents::point(first.0, first.1);
    for (x, y) in iter {
        extents.include(x, y);
    }
    Some(extents)
}

fn primitive_bounds(
    primitive: &MacroPrimitive,
    env: &Environment,
) -> Result<Option<Extents>, String> {
    let extents = match primitive {
        MacroPrimitive::Circle {
            exposure,
            diameter,
            center_x,
            center_y,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            let radius = diameter.eval(env).abs() / 2.0;
            Some(Extents::centered(
                center_x.eval(env),
                center_y.eval(env),
                radius,
                radius,
            ))
        }
        MacroPrimitive::VectorLine {
            exposure,
            width,
            start_x,
            start_y,
            end_x,
            end_y,
            rotation,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            let corners = vector_line_corners(
                width.eval(env),
                start_x.eval(env),
                start_y.eval(env),
                end_x.eval(env),
                end_y.eval(env),
                rotation.eval(env),
            );
            extents_of(corners)
        }
        MacroPrimitive::CenterLine {
            exposure,
            width,
            height,
            center_x,
            center_y,
            rotation,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            extents_of(rect_corners(
                center_x.eval(env),
                center_y.eval(env),
                width.eval(env),
                height.eval(env),
                rotation.eval(env),
            ))
        }
        MacroPrimitive::LowerLeftLine {
            exposure,
            width,
            height,
            lower_left_x,
            lower_left_y,
            rotation,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            let w = width.eval(env);
            let h = height.eval(env);
            extents_of(rect_corners(
                lower_left_x.eval(env) + w / 2.0,
                lower_left_y.eval(env) + h / 2.0,
                w,
                h,
                rotation.eval(env),
            ))
        }
        MacroPrimitive::Outline {
            exposure,
            points,
            rotation,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            let rotation = rotation.eval(env);
            extents_of(
                points
                    .iter()
                    .map(|(x, y)| rotate_deg(x.eval(env), y.eval(env), rotation)),
            )
        }
        MacroPrimitive::Polygon {
            exposure,
            num_vertices,
            center_x,
            center_y,
            diameter,
            rotation,
        } => {
            if !exposure_on(exposure, env) {
                return Ok(None);
            }
            let rotation = rotation.eval(env);
            extents_of(
                polygon_vertices(
                    num_vertices.eval(env),
                    center_x.eval(env),
                    center_y.eval(env),
                    diameter.eval(env),
                )?
                .into_iter()
                .map(|(x, y)| rotate_deg(x, y, rotation)),
            )
        }
        MacroPrimitive::Moire {
            center_x,
            center_y,
            outer_diameter,
            cross_thickness,
            cross_length,
            ..
        } => {
            let radius = (outer_diameter.eval(env) / 2.0).max(
                (cross_length.eval(env) / 2.0).hypot(cross_thickness.eval(env) / 2.0),
            );
            Some(Extents::centered(
                center_x.eval(env),
                center_y.eval(env),
                radius,
                radius,
            ))
        }
        MacroPrimitive::Thermal {
            center_x,
            center_y,
            outer_diameter,
            ..
        } => {
            let radius = outer_diameter.eval(env) / 2.0;
            Some(Extents::centered(
                center_x.eval(env),
                center_y.eval(env),
                radius,
                radius,
            ))
        }
    };

    Ok(extents)
}

fn vector_line_corners(
    width: f64,
    start_x: f64,
    start_y: f64,
    end_x: f64,
    end_y: f64,
    rotation: f64,
) -> [(f64, f64); 4] {
    let dx = end_x - start_x;
    let dy = end_y - start_y;
    let length = dx.hypot(dy);
    let (px, py) = if length > 0.0 {
        (-dy / length * width / 2.0, dx / length * width / 2.0)
    } else {
        (0.0, width / 2.0)
    };
    [
        rotate_deg(start_x + px, start_y + py, rotation),
        rotate_deg(start_x - px, start_y - py, rotation),
        rotate_deg(end_x - px, end_y - py, rotation),
        rotate_deg(end_x + px, end_y + py, rotation),
    ]
}

fn polygon_vertices(
    num_vertices: f64,
    center_x: f64,
    center_y: f64,
    diameter: f64,
) -> Result<Vec<(f64, f64)>, String> {
    let count = num_vertices.round();
    if !(3.0..=12.0).contains(&count) {
        return Err(format!(
            "polygon primitive vertex count {num_vertices} outside 3..=12"
        ));
    }
    let count = count as usize;
    let radius = diameter / 2.0;
    Ok((0..count)
        .map(|k| {
            let angle = TAU * k as f64 / count as f64;
            (
                center_x + radius * angle.cos(),
                center_y + radius * angle.sin(),
            )
        })
        .collect())
}

fn render_primitive(
    primitive: &MacroPrimitive,
    surface: &mut RasterSurface,
    env: &Environment,
) -> Result<(), String> {
    match primitive {
        MacroPrimitive::Circle {
            exposure,
            diameter,
            center_x,
            center_y,
        } => {
            let operator = operator_for(exposure, env);
            let radius = diameter.eval(env).abs() / 2.0;
            surface.save();
            surface.set_operator(operator);
            surface.arc(center_x.eval(env), center_y.eval(env), radius, 0.0, TAU);
            surface.fill();
            surface.restore();
        }
        MacroPrimitive::VectorLine {
            exposure,
            width,
            start_x,
            start_y,
            end_x,
            end_y,
            rotation,
        } => {
            let operator = operator_for(exposure, env);
            let corners = vector_line_corners(
                width.eval(env),
                start_x.eval(env),
                start_y.eval(env),
                end_x.eval(env),
                end_y.eval(env),
                rotation.eval(env),
            );
            fill_polygon(surface, operator, &corners);
        }
        MacroPrimitive::CenterLine {
            exposure,
            width,
            height,
            center_x,
            center_y,
            rotation,
        } => {
            let operator = operator_for(exposure, env);
            let corners = rect_corners(
                center_x.eval(env),
                center_y.eval(env),
                width.eval(env),
                height.eval(env),
                rotation.eval(env),
            );
            fill_polygon(surface, operator, &corners);
        }
        MacroPrimitive::LowerLeftLine {
            exposure,
            width,
            height,
            lower_left_x,
            lower_left_y,
            rotation,
        } => {
            let operator = operator_for(exposure, env);
            let w = width.eval(env);
            let h = height.eval(env);
            let corners = rect_corners(
                lower_left_x.eval(env) + w / 2.0,
                lower_left_y.eval(env) + h / 2.0,
                w,
                h,
                rotation.eval(env),
            );
            fill_polygon(surface, operator, &corners);
        }
        MacroPrimitive::Outline {
            exposure,
            points,
            rotation,
        } => {
            let operator = operator_for(exposure, env);
            let rotation = rotation.eval(env);
            let resolved: Vec<(f64, f64)> = points
                .iter()
                .map(|(x, y)| rotate_deg(x.eval(env), y.eval(env), rotation))
                .collect();
            fill_polygon(surface, operator, &resolved);
        }
        MacroPrimitive::Polygon {
            exposure,
            num_vertices,
            center_x,
            center_y,
            diameter,
            rotation,
        } => {
            let operator = operator_for(exposure, env);
            let rotation = rotation.eval(env);
            let resolved: Vec<(f64, f64)> = polygon_vertices(
                num_vertices.eval(env),
                center_x.eval(env),
                center_y.eval(env),
                diameter.eval(env),
            )?
            .into_iter()
            .map(|(x, y)| rotate_deg(x, y, rotation))
            .collect();
            fill_polygon(surface, operator, &resolved);
        }
        MacroPrimitive::Moire {
            center_x,
            center_y,
            outer_diameter,
            ring_thickness,
            ring_gap,
            max_rings,
            cross_thickness,
            cross_length,
            rotation,
        } => {
            let cx = center_x.eval(env);
            let cy = center_y.eval(env);
            let rotation = rotation.eval(env);
            if rotation != 0.0 && (cx != 0.0 || cy != 0.0) {
                return Err(
                    "moire rotation is only supported with the center at the origin".into(),
                );
            }

            surface.save();
            if rotation != 0.0 {
                surface.rotate(rotation.to_radians());
            }

            // Concentric ring pairs until the radius runs out or the
            // maximum ring count is reached.
            let thickness = ring_thickness.eval(env);
            let gap = ring_gap.eval(env);
            let rings = max_rings.eval(env).max(0.0) as u32;
            let mut outer = outer_diameter.eval(env) / 2.0;
            let mut drawn = 0;
            while drawn < rings && outer > 0.0 {
                let inner = (outer - thickness).max(0.0);
                surface.arc(cx, cy, outer, 0.0, TAU);
                if inner > 0.0 {
                    // New subpath; even-odd turns the circle pair into an
                    // annulus.
                    surface.move_to(cx + inner, cy);
                    surface.arc(cx, cy, inner, 0.0, TAU);
                }
                surface.fill();
                outer = inner - gap;
                drawn += 1;
            }

            // Two-rectangle crosshair.
            let ct = cross_thickness.eval(env);
            let cl = cross_length.eval(env);
            if ct > 0.0 && cl > 0.0 {
                fill_polygon(surface, Operator::Over, &rect_corners(cx, cy, cl, ct, 0.0));
                fill_polygon(surface, Operator::Over, &rect_corners(cx, cy, ct, cl, 0.0));
            }

            surface.restore();
        }
        MacroPrimitive::Thermal {
            center_x,
            center_y,
            outer_diameter,
            inner_diameter,
            gap_thickness,
            rotation,
        } => {
            let cx = center_x.eval(env);
            let cy = center_y.eval(env);
            let rotation = rotation.eval(env);
            if rotation != 0.0 && (cx != 0.0 || cy != 0.0) {
                return Err(
                    "thermal rotation is only supported with the center at the origin".into(),
                );
            }
            render_thermal(
                surface,
                cx,
                cy,
                outer_diameter.eval(env) / 2.0,
                inner_diameter.eval(env) / 2.0,
                gap_thickness.eval(env),
                rotation,
            );
        }
    }

    Ok(())
}

fn operator_for(exposure: &Expr, env: &Environment) -> Operator {
    if exposure_on(exposure, env) {
        Operator::Over
    } else {
        Operator::Clear
    }
}

fn fill_polygon(surface: &mut RasterSurface, operator: Operator, points: &[(f64, f64)]) {
    if points.len() < 3 {
        return;
    }
    surface.save();
    surface.set_operator(operator);
    surface.move_to(points[0].0, points[0].1);
    for &(x, y) in &points[1..] {
        surface.line_to(x, y);
    }
    surface.close_path();
    surface.fill();
    surface.restore();
}

/// Four 90-degree-rotated wedges between the inner and outer radii,
/// separated by straight gap strips along the (rotated) axes.
fn render_thermal(
    surface: &mut RasterSurface,
    cx: f64,
    cy: f64,
    outer_radius: f64,
    inner_radius: f64,
    gap: f64,
    rotation: f64,
) {
    let half_gap = gap / 2.0;
    if outer_radius <= 0.0 || half_gap >= outer_radius {
        return;
    }

    let outer_trim = (half_gap / outer_radius).clamp(-1.0, 1.0).asin();
    let quarter = TAU / 4.0;
    if quarter - 2.0 * outer_trim <= 0.0 {
        return;
    }
    let inner_trim = if inner_radius > half_gap {
        (half_gap / inner_radius).clamp(-1.0, 1.0).asin()
    } else {
        0.0
    };
    let inner_valid = inner_radius > half_gap && quarter - 2.0 * inner_trim > 0.0;
    let rotation = rotation.to_radians();

    for quadrant in 0..4 {
        let base = rotation + quadrant as f64 * quarter;
        surface.arc(
            cx,
            cy,
            outer_radius,
            base + outer_trim,
            base + quarter - outer_trim,
        );
        if inner_valid {
            surface.arc_negative(
                cx,
                cy,
                inner_radius,
                base + quarter - inner_trim,
                base + inner_trim,
            );
        } else {
            // The gap strips swallow the inner hole; the wedge bottoms out
            // at the corner where the two strips meet.
            let corner = half_gap * std::f64::consts::SQRT_2;
            let diagonal = base + quarter / 2.0;
            surface.line_to(cx + corner * diagonal.cos(), cy + corner * diagonal.sin());
        }
        surface.close_path();
        surface.fill();
    }
}
