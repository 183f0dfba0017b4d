//! The mutable execution context shared by the bounds and render passes.

use std::collections::HashMap;
use std::rc::Rc;

use crate::apertures::{Aperture, ApertureMask};
use crate::coord::{CoordinateFormat, Notation, Units};
use crate::error::GerberError;
use crate::macros::ApertureMacro;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMode {
    Linear,
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadrantMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Dark,
    Clear,
}

/// Graphics state for one pass over the block stream.
///
/// Created fresh per pass and destroyed at pass end; never reused across
/// files. The mask caches fill lazily during the render pass and are
/// released exactly once by [`GraphicsState::release_masks`].
#[derive(Debug)]
pub struct GraphicsState {
    pub current_x: f64,
    pub current_y: f64,
    pub current_aperture: Option<u32>,
    pub interpolation_mode: Option<InterpolationMode>,
    pub quadrant_mode: Option<QuadrantMode>,
    pub region_active: bool,
    pub polarity: Polarity,
    pub notation: Option<Notation>,
    pub units: Option<Units>,
    /// `10^-decimals` once the format specification is seen.
    pub file_precision: f64,
    pub format: Option<CoordinateFormat>,
    pub file_complete: bool,

    pub apertures: HashMap<u32, Aperture>,
    pub macros: HashMap<String, ApertureMacro>,

    /// Rendered aperture masks, hole subtracted.
    pub mask_cache: HashMap<u32, Rc<ApertureMask>>,
    /// Rendered aperture masks before hole subtraction. For apertures
    /// without holes both caches share one handle.
    pub mask_cache_no_hole: HashMap<u32, Rc<ApertureMask>>,

    /// Fitted transform, set after the bounds pass.
    pub scale_factor: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub image_width: u32,
    pub image_height: u32,
    /// Sub-steps per short stroke when a hole forces the stepped path.
    pub stroke_sub_steps: u32,
}

impl GraphicsState {
    pub fn new() -> Self {
        GraphicsState {
            current_x: 0.0,
            current_y: 0.0,
            current_aperture: None,
            interpolation_mode: None,
            quadrant_mode: None,
            region_active: false,
            polarity: Polarity::Dark,
            notation: None,
            units: None,
            file_precision: 0.0,
            format: None,
            file_complete: false,
            apertures: HashMap::new(),
            macros: HashMap::new(),
            mask_cache: HashMap::new(),
            mask_cache_no_hole: HashMap::new(),
            scale_factor: 1.0,
            x_offset: 0.0,
            y_offset: 0.0,
            image_width: 0,
            image_height: 0,
            stroke_sub_steps: 100,
        }
    }

    pub fn set_format(
        &mut self,
        format: CoordinateFormat,
        index: usize,
        block: &str,
    ) -> Result<(), GerberError> {
        if self.format.is_some() {
            return Err(GerberError::format(
                index,
                block,
                "format specification appears more than once",
            ));
        }
        self.file_precision = format.precision();
        self.notation = Some(format.notation);
        self.format = Some(format);
        Ok(())
    }

    pub fn set_units(
        &mut self,
        units: Units,
        index: usize,
        block: &str,
    ) -> Result<(), GerberError> {
        if self.units.is_some() {
            return Err(GerberError::format(
                index,
                block,
                "unit mode appears more than once",
            ));
        }
        self.units = Some(units);
        Ok(())
    }

    pub fn define_aperture(
        &mut self,
        code: u32,
        aperture: Aperture,
        index: usize,
        block: &str,
    ) -> Result<(), GerberError> {
        if code < 10 {
            return Err(GerberError::definition(
                index,
                block,
                format!("aperture number {code} is below 10"),
            ));
        }
        if self.apertures.contains_key(&code) {
            return Err(GerberError::definition(
                index,
                block,
                format!("aperture D{code} is already defined"),
            ));
        }
        if let Aperture::Macro { name, .. } = &aperture {
            if !self.macros.contains_key(name) {
                return Err(GerberError::definition(
                    index,
                    block,
                    format!("aperture D{code} references undefined macro `{name}`"),
                ));
            }
        }
        self.apertures.insert(code, aperture);
        Ok(())
    }

    pub fn define_macro(&mut self, definition: ApertureMacro) {
        self.macros.insert(definition.name.clone(), definition);
    }

    pub fn select_aperture(
        &mut self,
        code: u32,
        index: usize,
        block: &str,
    ) -> Result<(), GerberError> {
        if !self.apertures.contains_key(&code) {
            return Err(GerberError::definition(
                index,
                block,
                format!("aperture D{code} selected before definition"),
            ));
        }
        self.current_aperture = Some(code);
        Ok(())
    }

    pub fn update_current_point(&mut self, x: f64, y: f64) {
        self.current_x = x;
        self.current_y = y;
    }

    /// Release every cached mask surface exactly once.
    ///
    /// The no-hole cache aliases the with-hole cache for apertures without
    /// holes, so handles are deduplicated by identity before release.
    /// Returns the number of distinct surfaces released.
    pub fn release_masks(&mut self) -> usize {
        let mut handles: Vec<Rc<ApertureMask>> = Vec::new();
        for (_, mask) in self
            .mask_cache
            .drain()
            .chain(self.mask_cache_no_hole.drain())
        {
            if !handles.iter().any(|seen| Rc::ptr_eq(seen, &mask)) {
                handles.push(mask);
            }
        }
        let released = handles.len();
        drop(handles);
        released
    }
}

impl Default for GraphicsState {
    fn default() -> Self {
        GraphicsState::new()
    }
}
