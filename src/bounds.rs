//! The bounds pass: a dry run of the drawing state machine that never
//! touches a surface, producing the exact extents used to fit the image.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::commands::ParsedBlock;
use crate::draw::{DrawSink, Machine};
use crate::error::GerberError;
use crate::geom::{arc_covers_angle, ArcSegment, Extents};
use crate::state::GraphicsState;

/// Accumulated drawing extents in Gerber coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    /// False until the first stroke, flash, or region point lands.
    pub seen: bool,
}

impl ImageBounds {
    pub fn new() -> Self {
        ImageBounds {
            x_min: 0.0,
            x_max: 0.0,
            y_min: 0.0,
            y_max: 0.0,
            seen: false,
        }
    }

    pub fn update(&mut self, extents: &Extents) {
        if !self.seen {
            self.x_min = extents.x_min;
            self.x_max = extents.x_max;
            self.y_min = extents.y_min;
            self.y_max = extents.y_max;
            self.seen = true;
        } else {
            self.x_min = self.x_min.min(extents.x_min);
            self.x_max = self.x_max.max(extents.x_max);
            self.y_min = self.y_min.min(extents.y_min);
            self.y_max = self.y_max.max(extents.y_max);
        }
    }

    pub fn update_point(&mut self, x: f64, y: f64) {
        self.update(&Extents::point(x, y));
    }

    pub fn x_span(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn y_span(&self) -> f64 {
        self.y_max - self.y_min
    }
}

impl Default for ImageBounds {
    fn default() -> Self {
        ImageBounds::new()
    }
}

/// Sink that accumulates extents instead of drawing.
struct BoundsSink<'a> {
    bounds: &'a mut ImageBounds,
}

impl BoundsSink<'_> {
    fn aperture_extents_at(
        &mut self,
        state: &GraphicsState,
        x: f64,
        y: f64,
    ) -> Result<(), String> {
        let code = state
            .current_aperture
            .ok_or_else(|| "operation before any aperture selection".to_string())?;
        let aperture = state
            .apertures
            .get(&code)
            .ok_or_else(|| format!("aperture D{code} is not defined"))?;
        let extents = aperture.bounds_at(state, x, y)?;
        self.bounds.update(&extents);
        Ok(())
    }

    /// The four cardinal crossings an arc sweep covers, each expanded by
    /// the given callback.
    fn arc_crossings(arc: &ArcSegment) -> impl Iterator<Item = (f64, f64)> + '_ {
        const CARDINALS: [f64; 4] = [0.0, FRAC_PI_2, PI, -FRAC_PI_2];
        CARDINALS
            .iter()
            .filter(|&&angle| {
                arc_covers_angle(arc.start_angle, arc.sweep(), arc.clockwise, angle)
            })
            .map(|&angle| {
                (
                    arc.center_x + arc.radius * angle.cos(),
                    arc.center_y + arc.radius * angle.sin(),
                )
            })
    }
}

impl DrawSink for BoundsSink<'_> {
    fn flash(&mut self, state: &mut GraphicsState, x: f64, y: f64) -> Result<(), String> {
        self.aperture_extents_at(state, x, y)
    }

    fn stroke_linear(
        &mut self,
        state: &mut GraphicsState,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Result<(), String> {
        self.aperture_extents_at(state, start.0, start.1)?;
        self.aperture_extents_at(state, end.0, end.1)
    }

    fn stroke_arc(&mut self, state: &mut GraphicsState, arc: &ArcSegment) -> Result<(), String> {
        let (start_x, start_y) = arc.start_point();
        let (end_x, end_y) = arc.end_point();
        self.aperture_extents_at(state, start_x, start_y)?;
        self.aperture_extents_at(state, end_x, end_y)?;
        // Arc extremes lie on the axis crossings the sweep covers.
        for (x, y) in Self::arc_crossings(arc) {
            self.aperture_extents_at(state, x, y)?;
        }
        Ok(())
    }

    fn region_begin(&mut self) {}

    fn region_point(&mut self, x: f64, y: f64) {
        self.bounds.update_point(x, y);
    }

    fn region_line(&mut self, x: f64, y: f64) {
        self.bounds.update_point(x, y);
    }

    fn region_arc(&mut self, arc: &ArcSegment) {
        let (start_x, start_y) = arc.start_point();
        let (end_x, end_y) = arc.end_point();
        self.bounds.update_point(start_x, start_y);
        self.bounds.update_point(end_x, end_y);
        for (x, y) in Self::arc_crossings(arc) {
            self.bounds.update_point(x, y);
        }
    }

    fn region_subpath(&mut self, x: f64, y: f64) {
        self.bounds.update_point(x, y);
    }

    fn region_fill(&mut self, _state: &mut GraphicsState) -> Result<(), String> {
        Ok(())
    }
}

/// Walk the parsed stream with a fresh graphics state and return the exact
/// drawing extents.
pub fn compute_bounds(blocks: &[ParsedBlock]) -> Result<ImageBounds, GerberError> {
    let mut bounds = ImageBounds::new();
    let mut sink = BoundsSink {
        bounds: &mut bounds,
    };
    let mut machine = Machine::new(GraphicsState::new(), &mut sink);
    machine.run(blocks)?;
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::parse_blocks;
    use crate::lexer::tokenize;
    use approx::assert_relative_eq;

    fn bounds_of(input: &str) -> ImageBounds {
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        compute_bounds(&blocks).unwrap()
    }

    const HEADER: &str = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*";

    #[test]
    fn test_single_flash_bounds() {
        let bounds = bounds_of(&format!("{HEADER}X0Y0D03*M02*"));
        assert!(bounds.seen);
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.x_max, 0.005);
        assert_relative_eq!(bounds.y_min, -0.005);
        assert_relative_eq!(bounds.y_max, 0.005);
    }

    #[test]
    fn test_linear_stroke_bounds() {
        let bounds = bounds_of(&format!("{HEADER}X0Y0D02*G01X10000Y0D01*M02*"));
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.x_max, 1.005);
        assert_relative_eq!(bounds.y_min, -0.005);
        assert_relative_eq!(bounds.y_max, 0.005);
    }

    #[test]
    fn test_full_circle_bounds_include_all_crossings() {
        // Equal endpoints in multi-quadrant mode: a full revolution. I=0.5
        // puts the center at (0.5, 0), so the circle spans x 0..1 with a
        // 0.001 pen on top.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G75*G03*X0Y0D02*X0Y0I5000J0D01*M02*";
        let bounds = bounds_of(input);
        assert_relative_eq!(bounds.x_min, -0.0005, max_relative = 1e-6);
        assert_relative_eq!(bounds.x_max, 1.0005, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_min, -0.5005, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_max, 0.5005, max_relative = 1e-9);
    }

    #[test]
    fn test_quarter_arc_bounds_cover_crossed_axis_only() {
        // G03 quarter arc from (0, 1) to (1, 0) about the origin: the
        // sweep covers the +Y and +X cardinals only, so -X and -Y stay
        // untouched.
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G74*G03*X0Y10000D02*X10000Y0I0J10000D01*M02*";
        let bounds = bounds_of(input);
        assert_relative_eq!(bounds.x_min, -0.0005, max_relative = 1e-6);
        assert_relative_eq!(bounds.x_max, 1.0005, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_max, 1.0005, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_min, -0.0005, max_relative = 1e-6);
    }

    #[test]
    fn test_single_quadrant_wrong_direction_rejected() {
        // The quarter from (1, 0) to (0, 1) about the origin runs
        // clockwise as rendered; commanding it as G03 leaves no center
        // that sweeps the commanded way.
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G74*G03*X10000Y0D02*X0Y10000I10000J0D01*M02*";
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Geometry { .. })
        ));
    }

    #[test]
    fn test_region_bounds_are_contour_extents() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*G36*X0Y0D02*G01X10000Y0D01*X10000Y10000D01*X0Y10000D01*X0Y0D01*G37*M02*";
        let bounds = bounds_of(input);
        // Region contours carry no aperture width.
        assert_relative_eq!(bounds.x_min, 0.0);
        assert_relative_eq!(bounds.x_max, 1.0);
        assert_relative_eq!(bounds.y_max, 1.0);
    }

    #[test]
    fn test_step_and_repeat_expands_bounds() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%%SRX3Y2I2.0J1.0*%D10*X0Y0D03*%SRX1Y1I0J0*%M02*";
        let bounds = bounds_of(input);
        // 3x2 grid with 2.0 x 1.0 steps: flashes at x 0, 2, 4; y 0, 1.
        assert_relative_eq!(bounds.x_max, 4.005);
        assert_relative_eq!(bounds.y_max, 1.005);
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.y_min, -0.005);
    }

    #[test]
    fn test_no_draws_leaves_bounds_unseen() {
        let bounds = bounds_of("%FSLAX24Y24*%%MOIN*%M02*");
        assert!(!bounds.seen);
    }

    #[test]
    fn test_missing_m02_is_termination_error() {
        let blocks = parse_blocks(&tokenize(&format!("{HEADER}X0Y0D03*")).unwrap()).unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Termination(_))
        ));
    }

    #[test]
    fn test_flash_in_region_is_geometry_error() {
        let blocks = parse_blocks(
            &tokenize(&format!("{HEADER}G36*X0Y0D03*G37*M02*")).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Geometry { .. })
        ));
    }

    #[test]
    fn test_arc_without_quadrant_mode_is_geometry_error() {
        let blocks = parse_blocks(
            &tokenize(&format!("{HEADER}G03*X0Y0D02*X0Y0I5000J0D01*M02*")).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Geometry { .. })
        ));
    }

    #[test]
    fn test_single_quadrant_center_selection() {
        // From (1, 0) to (0, 1) with I=1, J=0 under G74 G02: of the
        // candidate centers {(0,0), (2,0)}, only (0,0) puts both endpoints
        // at equal radius (1) with a quarter sweep. The stroke stays
        // inside the unit quarter.
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G74*G02*X10000Y0D02*X0Y10000I10000J0D01*M02*";
        let bounds = bounds_of(input);
        assert_relative_eq!(bounds.x_max, 1.0005, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_max, 1.0005, max_relative = 1e-9);
        assert_relative_eq!(bounds.x_min, -0.0005, max_relative = 1e-6);
        assert_relative_eq!(bounds.y_min, -0.0005, max_relative = 1e-6);
    }

    #[test]
    fn test_single_quadrant_no_acceptable_center() {
        // Endpoints that no candidate center can serve at equal radii.
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G74*G02*X10000Y0D02*X0Y30000I10000J0D01*M02*";
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Geometry { .. })
        ));
    }

    #[test]
    fn test_nested_step_and_repeat_rejected() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%%SRX2Y1I1.0J0*%D10*X0Y0D03*%SRX2Y1I1.0J0*%M02*";
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        assert!(matches!(
            compute_bounds(&blocks),
            Err(GerberError::Format { .. })
        ));
    }
}
