//! The render pass: fit the computed bounds into the target image, then
//! walk the stream again against a raster surface.

use log::debug;

use crate::apertures::flash_mask;
use crate::bounds::{compute_bounds, ImageBounds};
use crate::commands::ParsedBlock;
use crate::draw::{DrawSink, Machine};
use crate::error::GerberError;
use crate::geom::ArcSegment;
use crate::state::{GraphicsState, Polarity};
use crate::surface::{Antialias, FillRule, RasterSurface, Surface};
use crate::RenderOptions;

/// Sink that draws operations onto the fitted surface.
struct RenderSink<'a> {
    surface: &'a mut RasterSurface,
}

impl RenderSink<'_> {
    /// Dark adds ink, Clear paints the background back in. Both fill
    /// even-odd.
    fn apply_polarity(&mut self, polarity: Polarity) {
        match polarity {
            Polarity::Dark => self.surface.set_source_rgba(0.0, 0.0, 0.0, 1.0),
            Polarity::Clear => self.surface.set_source_rgba(1.0, 1.0, 1.0, 1.0),
        }
    }

    fn current_code(state: &GraphicsState) -> Result<u32, String> {
        state
            .current_aperture
            .ok_or_else(|| "operation before any aperture selection".to_string())
    }
}

impl DrawSink for RenderSink<'_> {
    fn flash(&mut self, state: &mut GraphicsState, x: f64, y: f64) -> Result<(), String> {
        let code = Self::current_code(state)?;
        self.apply_polarity(state.polarity);
        flash_mask(self.surface, state, code, x, y, true)
    }

    fn stroke_linear(
        &mut self,
        state: &mut GraphicsState,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Result<(), String> {
        let code = Self::current_code(state)?;
        let aperture = state
            .apertures
            .get(&code)
            .cloned()
            .ok_or_else(|| format!("aperture D{code} is not defined"))?;
        self.apply_polarity(state.polarity);
        aperture.stroke_linear(self.surface, state, code, start, end)
    }

    fn stroke_arc(&mut self, state: &mut GraphicsState, arc: &ArcSegment) -> Result<(), String> {
        let code = Self::current_code(state)?;
        let aperture = state
            .apertures
            .get(&code)
            .cloned()
            .ok_or_else(|| format!("aperture D{code} is not defined"))?;
        self.apply_polarity(state.polarity);
        aperture.stroke_arc(self.surface, state, code, arc)
    }

    fn region_begin(&mut self) {}

    fn region_point(&mut self, x: f64, y: f64) {
        self.surface.move_to(x, y);
    }

    fn region_line(&mut self, x: f64, y: f64) {
        self.surface.line_to(x, y);
    }

    fn region_arc(&mut self, arc: &ArcSegment) {
        // Contours are built in the Gerber frame; the surface transform
        // carries the one Y-flip, and the even-odd fill rule is blind to
        // the flipped device winding. Clockwise therefore means a
        // decreasing Gerber angle: arc_negative.
        if arc.clockwise {
            self.surface.arc_negative(
                arc.center_x,
                arc.center_y,
                arc.radius,
                arc.start_angle,
                arc.end_angle,
            );
        } else {
            self.surface.arc(
                arc.center_x,
                arc.center_y,
                arc.radius,
                arc.start_angle,
                arc.end_angle,
            );
        }
    }

    fn region_subpath(&mut self, x: f64, y: f64) {
        self.surface.close_path();
        self.surface.move_to(x, y);
    }

    fn region_fill(&mut self, state: &mut GraphicsState) -> Result<(), String> {
        self.surface.close_path();
        self.apply_polarity(state.polarity);
        self.surface.fill();
        Ok(())
    }
}

/// The fitted transform derived from the bounds: margined min-scale plus
/// translation.
#[derive(Debug, Clone, Copy)]
struct FittedTransform {
    scale: f64,
    x_offset: f64,
    y_offset: f64,
}

fn fit_bounds(bounds: &ImageBounds, options: &RenderOptions) -> FittedTransform {
    let width = options.image_width as f64;
    let height = options.image_height as f64;
    let x_margin = width * options.margin_fraction;
    let y_margin = height * options.margin_fraction;

    // Degenerate spans (a single zero-size flash) fall back to unit span
    // so the transform stays finite.
    let x_span = bounds.x_span().max(f64::EPSILON);
    let y_span = bounds.y_span().max(f64::EPSILON);

    let x_scale = (width - x_margin) / x_span;
    let y_scale = (height - y_margin) / y_span;
    let scale = x_scale.min(y_scale);

    FittedTransform {
        scale,
        x_offset: -(bounds.x_min * scale) + x_margin / 2.0,
        y_offset: -(bounds.y_min * scale) + y_margin / 2.0,
    }
}

/// Run both passes over a parsed stream and return the rendered surface.
pub fn render_blocks(
    blocks: &[ParsedBlock],
    options: &RenderOptions,
) -> Result<RasterSurface, GerberError> {
    let bounds = compute_bounds(blocks)?;
    let mut surface = RasterSurface::new(options.image_width, options.image_height);

    if !bounds.seen {
        debug!("no drawable content; producing a blank image");
        return Ok(surface);
    }

    let fitted = fit_bounds(&bounds, options);
    debug!(
        "bounds x [{:.6}, {:.6}] y [{:.6}, {:.6}], scale {:.3}, offsets ({:.2}, {:.2})",
        bounds.x_min, bounds.x_max, bounds.y_min, bounds.y_max, fitted.scale, fitted.x_offset,
        fitted.y_offset
    );

    surface.set_fill_rule(FillRule::EvenOdd);
    surface.set_antialias(if options.antialias {
        Antialias::Default
    } else {
        Antialias::None
    });
    // Invert the Y axis exactly once at surface setup; everything after
    // this speaks the Gerber frame (Y up, math-convention angles).
    surface.scale(1.0, -1.0);
    surface.translate(0.0, -(options.image_height as f64));
    surface.translate(fitted.x_offset, fitted.y_offset);
    surface.scale(fitted.scale, fitted.scale);

    let mut state = GraphicsState::new();
    state.scale_factor = fitted.scale;
    state.x_offset = fitted.x_offset;
    state.y_offset = fitted.y_offset;
    state.image_width = options.image_width;
    state.image_height = options.image_height;
    state.stroke_sub_steps = options.stroke_sub_steps;

    let mut sink = RenderSink {
        surface: &mut surface,
    };
    let mut machine = Machine::new(state, &mut sink);
    let result = machine.run(blocks);
    let released = machine.state.release_masks();
    debug!("released {released} cached aperture masks");
    result?;

    surface.finish();
    Ok(surface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::parse_blocks;
    use crate::lexer::tokenize;

    fn render(input: &str, options: &RenderOptions) -> RasterSurface {
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        render_blocks(&blocks, options).unwrap()
    }

    fn small_options() -> RenderOptions {
        RenderOptions {
            image_width: 100,
            image_height: 100,
            ..RenderOptions::default()
        }
    }

    fn black(surface: &RasterSurface, x: u32, y: u32) -> bool {
        surface.pixel(x, y)[0] < 64
    }

    #[test]
    fn test_minimal_flash_lands_at_center() {
        let surface = render(
            "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X0Y0D03*M02*",
            &small_options(),
        );
        assert!(black(&surface, 50, 50), "disk at image center");
        assert!(!black(&surface, 10, 10), "margin stays white");
    }

    #[test]
    fn test_fit_bounds_margins() {
        let mut bounds = ImageBounds::new();
        bounds.update(&crate::geom::Extents {
            x_min: 0.0,
            x_max: 2.0,
            y_min: 0.0,
            y_max: 1.0,
        });
        let options = RenderOptions {
            image_width: 200,
            image_height: 200,
            ..RenderOptions::default()
        };
        let fitted = fit_bounds(&bounds, &options);
        // X is the binding axis: (200 - 20) / 2.0 = 90 px per unit.
        assert!((fitted.scale - 90.0).abs() < 1e-9);
        assert!((fitted.x_offset - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_file_renders_blank() {
        let surface = render("%FSLAX24Y24*%%MOIN*%M02*", &small_options());
        for probe in [(0, 0), (50, 50), (99, 99)] {
            assert_eq!(surface.pixel(probe.0, probe.1), [255, 255, 255, 255]);
        }
    }

    #[test]
    fn test_clear_polarity_erases() {
        // A dark flash, then a clear flash over half of it.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%%ADD11C,0.006*%D10*X0Y0D03*%LPC*%D11*X0Y0D03*M02*";
        let surface = render(input, &small_options());
        assert!(!black(&surface, 50, 50), "clear flash erased the center");
        // The dark rim survives: the clear disk (radius 27 px here) is
        // smaller than the dark one (radius 45 px).
        let mut rim_dark = false;
        for x in 8..20 {
            if black(&surface, x, 50) {
                rim_dark = true;
            }
        }
        assert!(rim_dark, "outer rim still dark");
    }

    #[test]
    fn test_region_cut_in_even_odd() {
        // Outer square contour, then an inner square contour started by a
        // D02 move inside the same region: even-odd leaves the inner
        // square unfilled.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.001*%D10*G36*\
                     X0Y0D02*G01X40000Y0D01*X40000Y40000D01*X0Y40000D01*X0Y0D01*\
                     X10000Y10000D02*X30000Y10000D01*X30000Y30000D01*X10000Y30000D01*X10000Y10000D01*\
                     G37*M02*";
        let surface = render(input, &small_options());
        assert!(black(&surface, 50, 8 + 4), "outer ring filled");
        assert!(!black(&surface, 50, 50), "inner square cut out");
    }

    #[test]
    fn test_bounds_contain_all_drawn_pixels() {
        // Every inked pixel must land inside the fitted bounds box.
        let input = "%FSLAX24Y24*%%MOIN*%%ADD10C,0.010*%D10*X0Y0D02*G01X10000Y5000D01*X0Y0D03*M02*";
        let blocks = parse_blocks(&tokenize(input).unwrap()).unwrap();
        let bounds = compute_bounds(&blocks).unwrap();
        let options = small_options();
        let surface = render_blocks(&blocks, &options).unwrap();

        let fitted = fit_bounds(&bounds, &options);
        let x_low = bounds.x_min * fitted.scale + fitted.x_offset;
        let x_high = bounds.x_max * fitted.scale + fitted.x_offset;
        let y_low = bounds.y_min * fitted.scale + fitted.y_offset;
        let y_high = bounds.y_max * fitted.scale + fitted.y_offset;

        for y in 0..surface.height() {
            for x in 0..surface.width() {
                if black(&surface, x, y) {
                    let device_x = x as f64 + 0.5;
                    // Undo the Y flip to compare in the Gerber frame.
                    let device_y = options.image_height as f64 - (y as f64 + 0.5);
                    assert!(
                        device_x >= x_low - 1.5 && device_x <= x_high + 1.5,
                        "pixel ({x}, {y}) outside x bounds"
                    );
                    assert!(
                        device_y >= y_low - 1.5 && device_y <= y_high + 1.5,
                        "pixel ({x}, {y}) outside y bounds"
                    );
                }
            }
        }
    }
}
