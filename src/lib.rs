//! Gerber RS-274X interpreter and rasterizer.
//!
//! The pipeline: bytes -> lexer -> parser -> `[DataBlock]` -> bounds pass
//! -> fitted transform -> render pass -> PNG. Parsing is a pure function
//! of the input text; the two passes run serially over the same parsed
//! stream with a fresh graphics state each.

pub mod apertures;
pub mod bounds;
pub mod commands;
pub mod coord;
pub mod draw;
pub mod error;
pub mod expr;
pub mod geom;
pub mod lexer;
pub mod macros;
pub mod render;
pub mod state;
pub mod surface;

use std::path::Path;

pub use commands::ParsedBlock;
pub use error::GerberError;
pub use surface::RasterSurface;

use surface::Surface;

/// Renderer configuration.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Target pixel dimensions.
    pub image_width: u32,
    pub image_height: u32,
    /// Fraction of each image dimension reserved as margin (total).
    pub margin_fraction: f64,
    /// Antialias body fills. Aperture masks always render antialiased;
    /// their sub-aperture detail needs it.
    pub antialias: bool,
    /// Sub-steps per short stroke when a hole forces the stepped path.
    pub stroke_sub_steps: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            image_width: 1024,
            image_height: 1024,
            margin_fraction: 0.10,
            antialias: false,
            stroke_sub_steps: 100,
        }
    }
}

/// Lex and parse Gerber source text into a typed block stream.
pub fn parse(input: &str) -> Result<Vec<ParsedBlock>, GerberError> {
    let blocks = lexer::tokenize(input)?;
    commands::parse_blocks(&blocks)
}

/// Render a parsed block stream to a raster surface (both passes).
pub fn render_to_surface(
    blocks: &[ParsedBlock],
    options: &RenderOptions,
) -> Result<RasterSurface, GerberError> {
    render::render_blocks(blocks, options)
}

/// Read, parse, render, and export one Gerber file to PNG.
pub fn render_file(
    input: &Path,
    output: &Path,
    options: &RenderOptions,
) -> Result<(), GerberError> {
    let source = std::fs::read_to_string(input)?;
    let blocks = parse(&source)?;
    let surface = render_to_surface(&blocks, options)?;
    surface.write_png(output)
}

// Whole-file scenarios live here against the public API: literal Gerber
// sources through lex -> parse -> bounds -> render, asserting on computed
// bounds and sampled pixels.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::compute_bounds;
    use approx::assert_relative_eq;

    fn options(size: u32) -> RenderOptions {
        RenderOptions {
            image_width: size,
            image_height: size,
            ..RenderOptions::default()
        }
    }

    fn render(input: &str, size: u32) -> RasterSurface {
        let blocks = parse(input).unwrap();
        render_to_surface(&blocks, &options(size)).unwrap()
    }

    fn is_black(surface: &RasterSurface, x: u32, y: u32) -> bool {
        surface.pixel(x, y)[0] < 64
    }

    /// True when any pixel within `radius` of the probe is inked; absorbs
    /// rounding at thin-feature probes.
    fn black_near(surface: &RasterSurface, x: u32, y: u32, radius: u32) -> bool {
        let x_range = x.saturating_sub(radius)..=(x + radius).min(surface.width() - 1);
        for px in x_range {
            let y_range = y.saturating_sub(radius)..=(y + radius).min(surface.height() - 1);
            for py in y_range {
                if is_black(surface, px, py) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_parse_propagates_lexical_errors() {
        assert!(matches!(parse("M02"), Err(GerberError::Lexical(_))));
    }

    #[test]
    fn test_minimal_file_flashes_one_disk() {
        let input = "%FSLAX24Y24*%\n%MOIN*%\n%ADD10C,0.010*%\nD10*\nX0Y0D03*\nM02*\n";
        let blocks = parse(input).unwrap();
        assert_eq!(blocks.len(), 6);

        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.x_max, 0.005);
        assert_relative_eq!(bounds.y_min, -0.005);
        assert_relative_eq!(bounds.y_max, 0.005);

        // 100 px image, 10% margin: the disk fills the 90 px content box.
        let surface = render_to_surface(&blocks, &options(100)).unwrap();
        assert!(is_black(&surface, 50, 50), "disk center");
        assert!(is_black(&surface, 50 + 40, 50), "disk body toward the rim");
        assert!(!is_black(&surface, 2, 2), "margin corner white");
        assert!(
            !is_black(&surface, 50 + 48, 50),
            "just outside the disk white"
        );
    }

    #[test]
    fn test_linear_stroke_draws_a_capsule() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X0Y0D02*X10000Y0D01*M02*";
        let blocks = parse(input).unwrap();

        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.x_max, 1.005);
        assert_relative_eq!(bounds.y_min, -0.005);
        assert_relative_eq!(bounds.y_max, 0.005);

        // The fit puts the thin strip at the bottom margin: y=0 lands at
        // H - (0.005 * scale + margin/2).
        let surface = render_to_surface(&blocks, &options(220)).unwrap();
        let scale = (220.0 - 22.0) / 1.01;
        let row = (220.0 - (0.005 * scale + 11.0)) as u32;
        assert!(black_near(&surface, 110, row, 2), "capsule middle");
        assert!(black_near(&surface, 12, row, 3), "capsule start cap");
        assert!(black_near(&surface, 208, row, 3), "capsule end cap");
        assert!(!black_near(&surface, 110, row - 30, 2), "above the stroke");
    }

    #[test]
    fn test_full_circle_multi_quadrant_draws_annulus() {
        // Equal start and end points under G75: a full revolution. I=0.5
        // places the center at (0.5, 0).
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.050*%D10*G75*G03*X0Y0D02*X0Y0I5000J0D01*M02*";
        let blocks = parse(input).unwrap();

        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, -0.025, max_relative = 1e-9);
        assert_relative_eq!(bounds.x_max, 1.025, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_min, -0.525, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_max, 0.525, max_relative = 1e-9);

        let surface = render_to_surface(&blocks, &options(220)).unwrap();
        // Spans are 1.05 x 1.05: scale = 198 / 1.05, offsets center the
        // ring at device (110, 110).
        let scale = 198.0 / 1.05;
        let device = |x: f64, y: f64| -> (u32, u32) {
            let ox = 0.025 * scale + 11.0;
            let oy = 0.525 * scale + 11.0;
            ((x * scale + ox) as u32, (220.0 - (y * scale + oy)) as u32)
        };

        // Ring samples at the four cardinal points of the circle.
        for (x, y) in [(1.0, 0.0), (0.0, 0.0), (0.5, 0.5), (0.5, -0.5)] {
            let (px, py) = device(x, y);
            assert!(black_near(&surface, px, py, 2), "ring at ({x}, {y})");
        }
        // Inside the ring and at its center: white.
        let (cx, cy) = device(0.5, 0.0);
        assert!(!black_near(&surface, cx, cy, 2), "annulus center");
        let (ix, iy) = device(0.5, 0.25);
        assert!(!black_near(&surface, ix, iy, 2), "inside the ring");
    }

    #[test]
    fn test_region_with_cut_in_stays_open() {
        // Outer contour, then a second contour inside the same region
        // opened by a D02 move: even-odd leaves the inner region unfilled.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G36*\
                     X0Y0D02*G01X40000Y0D01*X40000Y40000D01*X0Y40000D01*X0Y0D01*\
                     X10000Y10000D02*X30000Y10000D01*X30000Y30000D01*X10000Y30000D01*X10000Y10000D01*\
                     G37*M02*";
        let surface = render(input, 100);

        // Content box 90 px over a 4x4 span: outer square 5..95, inner
        // 27.5..72.5.
        assert!(is_black(&surface, 50, 12), "band between the contours");
        assert!(is_black(&surface, 12, 50), "left band");
        assert!(!is_black(&surface, 50, 50), "cut-in not overwritten");
        assert!(!is_black(&surface, 2, 2), "outside the region");
    }

    #[test]
    fn test_single_quadrant_clockwise_quarter_arc() {
        // From (1, 0) to (0, 1) with I=1, J=0 under G74 G02: the candidate
        // centers are {(0,0), (2,0)} and only (0,0) gives equal radii with
        // a quarter sweep the commanded way.
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.100*%D10*G74*G02*X10000Y0D02*X0Y10000I10000J0D01*M02*";
        let blocks = parse(input).unwrap();

        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_max, 1.05, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_max, 1.05, max_relative = 1e-9);
        assert_relative_eq!(bounds.x_min, -0.05, max_relative = 1e-9);
        assert_relative_eq!(bounds.y_min, -0.05, max_relative = 1e-9);

        let surface = render_to_surface(&blocks, &options(220)).unwrap();
        let scale = 198.0 / 1.1;
        let device = |x: f64, y: f64| -> (u32, u32) {
            let offset = 0.05 * scale + 11.0;
            (
                (x * scale + offset) as u32,
                (220.0 - (y * scale + offset)) as u32,
            )
        };

        let mid = std::f64::consts::FRAC_1_SQRT_2;
        let (mx, my) = device(mid, mid);
        assert!(black_near(&surface, mx, my, 2), "stroke at the arc midpoint");
        let (sx, sy) = device(1.0, 0.0);
        assert!(black_near(&surface, sx, sy, 2), "stroke at the start point");
        let (ix, iy) = device(0.3, 0.3);
        assert!(!black_near(&surface, ix, iy, 2), "inside the quarter radius");
        assert!(
            !black_near(&surface, 20, 200, 1),
            "near the origin untouched"
        );
    }

    #[test]
    fn test_aperture_macro_with_variables_renders_ring() {
        // DONUT: an outer disk of $1 minus an erased disk of $1-$2,
        // flashed once at the origin.
        let input = "%FSLAX24Y24*%%MOIN*%\
                     %AMDONUT*1,1,$1,0,0*1,0,$1-$2,0,0*%\
                     %ADD20DONUT,0.050X0.020*%\
                     D20*X0Y0D03*M02*";
        let blocks = parse(input).unwrap();

        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, -0.025);
        assert_relative_eq!(bounds.x_max, 0.025);

        // Scale 90 px / 0.05 = 1800: outer radius 45 px, erased radius
        // 27 px.
        let surface = render_to_surface(&blocks, &options(100)).unwrap();
        assert!(!is_black(&surface, 50, 50), "donut hole");
        assert!(is_black(&surface, 50 + 35, 50), "ring body");
        assert!(is_black(&surface, 50, 50 - 35), "ring body above");
        assert!(!is_black(&surface, 50 + 10, 50), "inside the hole");
        assert!(!is_black(&surface, 50 + 48, 50), "outside the ring");
    }

    #[test]
    fn test_polygon_vertex_extremes_render() {
        for vertices in [3, 12] {
            let input = format!(
                "%FSLAX24Y24*%%MOIN*%%ADD10P,0.080X{vertices}*%D10*X0Y0D03*M02*"
            );
            let surface = render(&input, 100);
            assert!(
                is_black(&surface, 50, 50),
                "{vertices}-gon center should be inked"
            );
        }
    }

    #[test]
    fn test_zero_diameter_circle_renders_nothing() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0*%D10*X0Y0D03*M02*";
        let surface = render(input, 64);
        for y in 0..64 {
            for x in 0..64 {
                assert_eq!(surface.pixel(x, y), [255, 255, 255, 255]);
            }
        }
    }

    #[test]
    fn test_zero_width_format_rejects_coordinates() {
        let input = "%FSLAX00Y00*%%MOIN*%%ADD10C,0.010*%D10*X1Y0D03*M02*";
        assert!(matches!(parse(input), Err(GerberError::Format { .. })));
    }

    #[test]
    fn test_rectangle_stroke_with_equal_endpoints_is_one_flash() {
        let input =
            "%FSLAX24Y24*%%MOIN*%%ADD10R,0.040X0.020*%D10*X0Y0D02*G01X0Y0D01*M02*";
        let surface = render(input, 100);
        // One rectangle, 90x45 px after fitting, hugging the lower margin.
        assert!(is_black(&surface, 50, 70), "rectangle body");
        assert!(!is_black(&surface, 50, 30), "above the rectangle");
    }

    #[test]
    fn test_step_and_repeat_tiles_flashes() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%\
                     %SRX2Y1I0.02J0*%D10*X0Y0D03*%SRX1Y1I0J0*%M02*";
        let blocks = parse(input).unwrap();
        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, -0.005);
        assert_relative_eq!(bounds.x_max, 0.025);

        // Two disks side by side.
        let surface = render_to_surface(&blocks, &options(120)).unwrap();
        let scale = 108.0 / 0.03;
        let offset = 0.005 * scale + 6.0;
        let left = (0.0 * scale + offset) as u32;
        let right = (0.02 * scale + offset) as u32;
        let row = 120 - (0.005 * scale + 6.0) as u32;
        assert!(black_near(&surface, left, row, 2), "first copy");
        assert!(black_near(&surface, right, row, 2), "second copy");
    }

    #[test]
    fn test_clear_polarity_erases() {
        // A dark flash, then a smaller clear flash over its center.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%%ADD11C,0.006*%\
                     D10*X0Y0D03*%LPC*%D11*X0Y0D03*M02*";
        let surface = render(input, 100);
        assert!(!is_black(&surface, 50, 50), "clear flash erased the center");
        // The dark rim survives: the clear disk (radius 27 px here) is
        // smaller than the dark one (radius 45 px).
        let mut rim_dark = false;
        for x in 8..20 {
            if is_black(&surface, x, 50) {
                rim_dark = true;
            }
        }
        assert!(rim_dark, "outer rim still dark");
    }

    #[test]
    fn test_deprecated_commands_are_ignored() {
        let input = "%FSLAX24Y24*%%MOIN*%%IPPOS*%%LNtop_copper*%\
                     %ADD10C,0.010*%G54D10*G70*G90*X0Y0D03*M01*M02*";
        let surface = render(input, 64);
        assert!(is_black(&surface, 32, 32), "flash still lands");
    }

    #[test]
    fn test_comments_are_preserved_but_inert() {
        let input =
            "G04 Layer: top copper*%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X0Y0D03*M02*";
        let blocks = parse(input).unwrap();
        assert!(blocks.iter().any(|b| matches!(
            &b.data,
            commands::DataBlock::Comment(text) if text == "Layer: top copper"
        )));
        let surface = render_to_surface(&blocks, &options(64)).unwrap();
        assert!(is_black(&surface, 32, 32));
    }

    #[test]
    fn test_missing_m02_fails_with_termination_error() {
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X0Y0D03*";
        let blocks = parse(input).unwrap();
        assert!(matches!(
            render_to_surface(&blocks, &options(64)),
            Err(GerberError::Termination(_))
        ));
    }

    #[test]
    fn test_incremental_notation_accumulates() {
        // Two incremental moves of +0.5 each: flashes at 0.5 and 1.0.
        let input = "%FSLIX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X5000Y0D03*X5000Y0D03*M02*";
        let blocks = parse(input).unwrap();
        let bounds = compute_bounds(&blocks).unwrap();
        assert_relative_eq!(bounds.x_min, 0.495);
        assert_relative_eq!(bounds.x_max, 1.005);
    }
}
