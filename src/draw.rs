//! The drawing state machine.
//!
//! One machine drives both passes: it owns the modal state updates,
//! destination computation, arc reconstruction (multi- and single-quadrant),
//! region contour bookkeeping, and step-and-repeat replay, and dispatches
//! the actual drawing through a [`DrawSink`]. The bounds pass plugs in a
//! sink that only accumulates extents; the render pass plugs in a surface.
//! Keeping the walk identical is what makes the computed bounds exact.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use log::warn;

use crate::commands::{DataBlock, Interpolation, Operation, ParsedBlock, StateFunction};
use crate::coord::Notation;
use crate::error::GerberError;
use crate::geom::{directed_sweep, epsilon_equals, ArcSegment};
use crate::state::{GraphicsState, InterpolationMode, QuadrantMode};

/// Receiver for the machine's drawing operations.
///
/// Sink methods return plain message strings; the machine wraps them with
/// the offending block text and index.
pub trait DrawSink {
    /// Stamp the current aperture at a point, with the current polarity.
    fn flash(&mut self, state: &mut GraphicsState, x: f64, y: f64) -> Result<(), String>;
    /// Stroke a straight segment with the current aperture.
    fn stroke_linear(
        &mut self,
        state: &mut GraphicsState,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Result<(), String>;
    /// Stroke an arc with the current aperture.
    fn stroke_arc(&mut self, state: &mut GraphicsState, arc: &ArcSegment) -> Result<(), String>;

    /// G36: a region opens; any path state resets.
    fn region_begin(&mut self);
    /// Start a contour at a point.
    fn region_point(&mut self, x: f64, y: f64);
    /// Append a straight edge to the active contour.
    fn region_line(&mut self, x: f64, y: f64);
    /// Append an arc edge to the active contour.
    fn region_arc(&mut self, arc: &ArcSegment);
    /// D02 inside a region: close the contour, open a new one at the point.
    fn region_subpath(&mut self, x: f64, y: f64);
    /// Fill every accumulated contour even-odd with the current polarity.
    fn region_fill(&mut self, state: &mut GraphicsState) -> Result<(), String>;
}

/// An open step-and-repeat block being recorded for replay.
struct SrBlock {
    x_repeat: u32,
    y_repeat: u32,
    i_step: f64,
    j_step: f64,
    start_x: f64,
    start_y: f64,
    blocks: Vec<ParsedBlock>,
}

pub struct Machine<'a, S: DrawSink> {
    pub state: GraphicsState,
    sink: &'a mut S,
    /// Whether a region contour has been started since G36 or the last
    /// fill.
    in_contour: bool,
    sr: Option<SrBlock>,
    /// Grid offset applied to absolute destinations while replaying a
    /// step-and-repeat copy.
    sr_offset: (f64, f64),
}

impl<'a, S: DrawSink> Machine<'a, S> {
    pub fn new(state: GraphicsState, sink: &'a mut S) -> Self {
        Machine {
            state,
            sink,
            in_contour: false,
            sr: None,
            sr_offset: (0.0, 0.0),
        }
    }

    /// Walk the block stream to completion.
    pub fn run(&mut self, blocks: &[ParsedBlock]) -> Result<(), GerberError> {
        for block in blocks {
            self.process(block)?;
        }

        // EOF flushes an unterminated step-and-repeat block.
        self.flush_sr()?;

        if self.state.region_active && self.in_contour {
            // Some files end the region implicitly at M02.
            self.sink
                .region_fill(&mut self.state)
                .map_err(GerberError::Termination)?;
            self.in_contour = false;
        }

        if !self.state.file_complete {
            return Err(GerberError::Termination(
                "end of input reached without M02".into(),
            ));
        }
        Ok(())
    }

    fn process(&mut self, block: &ParsedBlock) -> Result<(), GerberError> {
        // Record for step-and-repeat replay. The opening %SR% installed the
        // block after its own processing, so it never records itself, and
        // the closing %SR% is filtered here.
        if let Some(sr) = &mut self.sr {
            if !matches!(block.data, DataBlock::StepAndRepeat { .. }) {
                sr.blocks.push(block.clone());
            }
        }

        match &block.data {
            DataBlock::FormatSpec(format) => {
                self.state.set_format(*format, block.index, &block.text)
            }
            DataBlock::Mode(units) => self.state.set_units(*units, block.index, &block.text),
            DataBlock::ApertureDef { code, aperture } => {
                self.state
                    .define_aperture(*code, aperture.clone(), block.index, &block.text)
            }
            DataBlock::MacroDef(definition) => {
                self.state.define_macro(definition.clone());
                Ok(())
            }
            DataBlock::LevelPolarity(polarity) => {
                // A polarity change inside a region flushes what has been
                // outlined so far under the old polarity.
                if self.state.region_active && self.in_contour {
                    self.sink
                        .region_fill(&mut self.state)
                        .map_err(|message| {
                            GerberError::geometry(block.index, &block.text, message)
                        })?;
                    self.in_contour = false;
                }
                self.state.polarity = *polarity;
                Ok(())
            }
            DataBlock::StepAndRepeat {
                x_repeat,
                y_repeat,
                i_step,
                j_step,
            } => self.handle_step_and_repeat(*x_repeat, *y_repeat, *i_step, *j_step, block),
            DataBlock::SelectAperture(code) => {
                self.state.select_aperture(*code, block.index, &block.text)
            }
            DataBlock::Interpolation(interpolation) => {
                self.handle_interpolation(interpolation, block)
            }
            DataBlock::StateChange(function) => self.handle_state_change(*function, block),
            DataBlock::Comment(_) | DataBlock::Deprecated(_) => Ok(()),
        }
    }

    fn handle_state_change(
        &mut self,
        function: StateFunction,
        block: &ParsedBlock,
    ) -> Result<(), GerberError> {
        match function {
            StateFunction::RegionOn => {
                self.state.region_active = true;
                self.in_contour = false;
                self.sink.region_begin();
            }
            StateFunction::RegionOff => {
                if self.in_contour {
                    self.sink
                        .region_fill(&mut self.state)
                        .map_err(|message| {
                            GerberError::geometry(block.index, &block.text, message)
                        })?;
                }
                self.in_contour = false;
                self.state.region_active = false;
            }
            StateFunction::SingleQuadrant => {
                self.state.quadrant_mode = Some(QuadrantMode::Single);
            }
            StateFunction::MultiQuadrant => {
                self.state.quadrant_mode = Some(QuadrantMode::Multi);
            }
            StateFunction::EndOfFile => {
                self.state.file_complete = true;
            }
            StateFunction::UnitInch | StateFunction::UnitMillimeter => {
                // The deprecated unit-by-function codes do not change the
                // unit mode here; %MO% owns it.
                warn!(
                    "deprecated unit change `{}` in block {} ignored",
                    block.text, block.index
                );
            }
            StateFunction::NotationAbsolute
            | StateFunction::NotationIncremental
            | StateFunction::ProgramStop
            | StateFunction::OptionalStop
            | StateFunction::PrepareForFlash => {}
        }
        Ok(())
    }

    fn handle_interpolation(
        &mut self,
        interpolation: &Interpolation,
        block: &ParsedBlock,
    ) -> Result<(), GerberError> {
        if let Some(function) = interpolation.function {
            self.state.interpolation_mode = Some(function);
        }
        let Some(operation) = interpolation.operation else {
            return Ok(());
        };

        let (new_x, new_y) = self.destination(interpolation);

        match operation {
            Operation::Move => {
                if self.state.region_active && self.in_contour {
                    self.sink.region_subpath(new_x, new_y);
                }
            }
            Operation::Flash => {
                if self.state.region_active {
                    return Err(GerberError::geometry(
                        block.index,
                        &block.text,
                        "flash inside a region",
                    ));
                }
                self.require_aperture(block)?;
                self.sink
                    .flash(&mut self.state, new_x, new_y)
                    .map_err(|message| GerberError::geometry(block.index, &block.text, message))?;
            }
            Operation::Interpolate => {
                let mode = match self.state.interpolation_mode {
                    Some(mode) => mode,
                    None => {
                        // Many CAD exports never emit an explicit G01.
                        warn!(
                            "interpolation before any mode in block {}; assuming linear",
                            block.index
                        );
                        self.state.interpolation_mode = Some(InterpolationMode::Linear);
                        InterpolationMode::Linear
                    }
                };

                if self.state.region_active {
                    if !self.in_contour {
                        self.sink.region_point(self.state.current_x, self.state.current_y);
                        self.in_contour = true;
                    }
                    match mode {
                        InterpolationMode::Linear => self.sink.region_line(new_x, new_y),
                        InterpolationMode::Clockwise | InterpolationMode::CounterClockwise => {
                            let arc = self.reconstruct_arc(new_x, new_y, interpolation, block)?;
                            self.sink.region_arc(&arc);
                        }
                    }
                } else {
                    self.require_aperture(block)?;
                    match mode {
                        InterpolationMode::Linear => {
                            let start = (self.state.current_x, self.state.current_y);
                            self.sink
                                .stroke_linear(&mut self.state, start, (new_x, new_y))
                                .map_err(|message| {
                                    GerberError::geometry(block.index, &block.text, message)
                                })?;
                        }
                        InterpolationMode::Clockwise | InterpolationMode::CounterClockwise => {
                            let arc = self.reconstruct_arc(new_x, new_y, interpolation, block)?;
                            self.sink.stroke_arc(&mut self.state, &arc).map_err(
                                |message| GerberError::geometry(block.index, &block.text, message),
                            )?;
                        }
                    }
                }
            }
        }

        self.state.update_current_point(new_x, new_y);
        Ok(())
    }

    /// Modal destination: omitted X or Y means "unchanged"; incremental
    /// notation offsets from the current point. Step-and-repeat replay
    /// offsets absolute destinations by the active grid offset.
    fn destination(&self, interpolation: &Interpolation) -> (f64, f64) {
        let incremental = self.state.notation == Some(Notation::Incremental);
        let x = match interpolation.x {
            None => self.state.current_x,
            Some(value) if incremental => self.state.current_x + value,
            Some(value) => value + self.sr_offset.0,
        };
        let y = match interpolation.y {
            None => self.state.current_y,
            Some(value) if incremental => self.state.current_y + value,
            Some(value) => value + self.sr_offset.1,
        };
        (x, y)
    }

    fn require_aperture(&self, block: &ParsedBlock) -> Result<u32, GerberError> {
        self.state.current_aperture.ok_or_else(|| {
            GerberError::definition(
                block.index,
                &block.text,
                "operation before any aperture selection",
            )
        })
    }

    /// Reconstruct the arc center and direction-adjusted angles.
    fn reconstruct_arc(
        &self,
        new_x: f64,
        new_y: f64,
        interpolation: &Interpolation,
        block: &ParsedBlock,
    ) -> Result<ArcSegment, GerberError> {
        let clockwise = self.state.interpolation_mode == Some(InterpolationMode::Clockwise);
        let quadrant_mode = self.state.quadrant_mode.ok_or_else(|| {
            GerberError::geometry(block.index, &block.text, "arc without a quadrant mode")
        })?;

        let cur_x = self.state.current_x;
        let cur_y = self.state.current_y;
        let precision = self.state.file_precision;

        match quadrant_mode {
            QuadrantMode::Multi => {
                // I and J are signed offsets from the current point to the
                // center.
                let center_x = cur_x + interpolation.i;
                let center_y = cur_y + interpolation.j;
                let radius = (new_x - center_x).hypot(new_y - center_y);
                let start_angle = (cur_y - center_y).atan2(cur_x - center_x);
                let mut end_angle = (new_y - center_y).atan2(new_x - center_x);

                let coincident = epsilon_equals(new_x, cur_x, precision)
                    && epsilon_equals(new_y, cur_y, precision);
                if coincident {
                    // Equal endpoints command a full revolution.
                    end_angle = if clockwise {
                        start_angle - TAU
                    } else {
                        start_angle + TAU
                    };
                } else if clockwise && end_angle > start_angle {
                    end_angle -= TAU;
                } else if !clockwise && end_angle < start_angle {
                    end_angle += TAU;
                }

                Ok(ArcSegment {
                    center_x,
                    center_y,
                    radius,
                    start_angle,
                    end_angle,
                    clockwise,
                })
            }
            QuadrantMode::Single => {
                // I and J are magnitudes; the center is one of four
                // candidates, searched in a fixed order so ties break
                // deterministically. A center is acceptable when both
                // endpoints sit at the same radius and the arc between
                // them spans at most a quadrant in the commanded
                // direction; spans straddling the +-pi branch wrap before
                // the comparison, which is how a nominal 3pi/2 difference
                // reads as a quarter turn.
                let i = interpolation.i.abs();
                let j = interpolation.j.abs();
                let candidates = [
                    (cur_x - i, cur_y - j),
                    (cur_x - i, cur_y + j),
                    (cur_x + i, cur_y - j),
                    (cur_x + i, cur_y + j),
                ];

                for (center_x, center_y) in candidates {
                    let start_radius = (cur_x - center_x).hypot(cur_y - center_y);
                    let end_radius = (new_x - center_x).hypot(new_y - center_y);
                    if !epsilon_equals(start_radius, end_radius, precision) {
                        continue;
                    }
                    let start_angle = (cur_y - center_y).atan2(cur_x - center_x);
                    let end_angle = (new_y - center_y).atan2(new_x - center_x);
                    // Signed minor span in (-pi, pi].
                    let ccw = directed_sweep(start_angle, end_angle, false);
                    let span = if ccw > PI { ccw - TAU } else { ccw };
                    if span.abs() > FRAC_PI_2 + 1e-9 {
                        continue;
                    }
                    // The sweep must also run in the commanded sense. The
                    // image is rendered Y-flipped, so a clockwise command
                    // is an increasing Gerber-frame angle: a non-negative
                    // span. A zero span satisfies either command.
                    let direction_matches = if clockwise {
                        span >= 0.0
                    } else {
                        span <= 0.0
                    };
                    if !direction_matches {
                        continue;
                    }
                    return Ok(ArcSegment {
                        center_x,
                        center_y,
                        radius: end_radius,
                        start_angle,
                        end_angle: start_angle + span,
                        clockwise: span < 0.0,
                    });
                }

                Err(GerberError::geometry(
                    block.index,
                    &block.text,
                    "single-quadrant arc has no acceptable center in the commanded direction",
                ))
            }
        }
    }

    fn handle_step_and_repeat(
        &mut self,
        x_repeat: u32,
        y_repeat: u32,
        i_step: f64,
        j_step: f64,
        block: &ParsedBlock,
    ) -> Result<(), GerberError> {
        if self.sr.is_some() {
            if x_repeat == 1 && y_repeat == 1 {
                return self.flush_sr();
            }
            // Sources disagree on whether SR content may contain SR;
            // nesting is rejected.
            return Err(GerberError::format(
                block.index,
                &block.text,
                "nested step-and-repeat blocks are not allowed",
            ));
        }

        if x_repeat > 1 || y_repeat > 1 {
            self.sr = Some(SrBlock {
                x_repeat,
                y_repeat,
                i_step,
                j_step,
                start_x: self.state.current_x,
                start_y: self.state.current_y,
                blocks: Vec::new(),
            });
        }
        Ok(())
    }

    /// Replay the recorded block over the remaining grid positions. The
    /// first copy was drawn live while recording.
    fn flush_sr(&mut self) -> Result<(), GerberError> {
        let Some(sr) = self.sr.take() else {
            return Ok(());
        };

        for y_index in 0..sr.y_repeat {
            for x_index in 0..sr.x_repeat {
                if x_index == 0 && y_index == 0 {
                    continue;
                }
                let offset_x = x_index as f64 * sr.i_step;
                let offset_y = y_index as f64 * sr.j_step;
                self.sr_offset = (offset_x, offset_y);
                self.state
                    .update_current_point(sr.start_x + offset_x, sr.start_y + offset_y);

                for replayed in &sr.blocks {
                    if matches!(
                        replayed.data,
                        DataBlock::FormatSpec(_)
                            | DataBlock::Mode(_)
                            | DataBlock::ApertureDef { .. }
                            | DataBlock::MacroDef(_)
                    ) {
                        // Definitions ran on the live copy; repeating them
                        // would trip the uniqueness checks.
                        continue;
                    }
                    self.process(replayed)?;
                }
            }
        }

        self.sr_offset = (0.0, 0.0);
        Ok(())
    }
}
