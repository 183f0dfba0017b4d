//! Token-to-DataBlock parsing: parameter dispatch on the leading two-letter
//! code, data dispatch on the `(G|M)<code>` prefix.

use log::warn;

use crate::apertures::{Aperture, Hole};
use crate::coord::{CoordinateFormat, Notation, Units, ZeroOmission};
use crate::error::GerberError;
use crate::lexer::{Block, BlockKind};
use crate::macros::ApertureMacro;
use crate::state::{InterpolationMode, Polarity};

/// State-change functions carried by [`DataBlock::StateChange`]. The
/// deprecated ones are parsed and silently ignored by both passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFunction {
    RegionOn,
    RegionOff,
    SingleQuadrant,
    MultiQuadrant,
    EndOfFile,
    /// G70 (deprecated unit-by-function).
    UnitInch,
    /// G71 (deprecated unit-by-function).
    UnitMillimeter,
    /// G90 (deprecated notation-by-function).
    NotationAbsolute,
    /// G91 (deprecated notation-by-function).
    NotationIncremental,
    /// M00 (deprecated).
    ProgramStop,
    /// M01 (deprecated).
    OptionalStop,
    /// G55 (deprecated prepare-for-flash).
    PrepareForFlash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Interpolate,
    Move,
    Flash,
}

/// A coordinate data block: optional interpolation function, optional
/// operation, modal X/Y, per-block I/J (defaulting to zero).
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolation {
    pub function: Option<InterpolationMode>,
    pub operation: Option<Operation>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub i: f64,
    pub j: f64,
}

/// A fully parsed block.
#[derive(Debug, Clone, PartialEq)]
pub enum DataBlock {
    FormatSpec(CoordinateFormat),
    Mode(Units),
    ApertureDef { code: u32, aperture: Aperture },
    MacroDef(ApertureMacro),
    LevelPolarity(Polarity),
    StepAndRepeat {
        x_repeat: u32,
        y_repeat: u32,
        i_step: f64,
        j_step: f64,
    },
    SelectAperture(u32),
    Interpolation(Interpolation),
    StateChange(StateFunction),
    Comment(String),
    /// A recognized-but-deprecated parameter (IN, AS, LN, IR, IP, MI, OF,
    /// SF), kept for diagnostics, ignored by the passes.
    Deprecated(String),
}

/// A parsed block with its source text and stream index for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBlock {
    pub data: DataBlock,
    pub index: usize,
    pub text: String,
}

/// Parse the raw block stream into typed data blocks.
///
/// The parser is stateful only for the coordinate format, which it needs to
/// scale coordinate literals; everything else is validated by the passes.
pub fn parse_blocks(blocks: &[Block]) -> Result<Vec<ParsedBlock>, GerberError> {
    let mut parsed = Vec::with_capacity(blocks.len());
    let mut format: Option<CoordinateFormat> = None;

    for block in blocks {
        let data = match block.kind {
            BlockKind::Parameter => parse_parameter(block, &mut format)?,
            BlockKind::Data => parse_data(block, format.as_ref())?,
        };
        parsed.push(ParsedBlock {
            data,
            index: block.index,
            text: block.content.clone(),
        });
    }

    Ok(parsed)
}

// ─── Parameter blocks ───────────────────────────────────────────────

fn parse_parameter(
    block: &Block,
    format: &mut Option<CoordinateFormat>,
) -> Result<DataBlock, GerberError> {
    let statements: Vec<&str> = block
        .content
        .split('*')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let first = statements.first().copied().unwrap_or("");

    if first.len() < 2 {
        return Err(GerberError::format(
            block.index,
            &block.content,
            "parameter block too short",
        ));
    }

    match &first[..2] {
        "FS" => {
            if format.is_some() {
                return Err(GerberError::format(
                    block.index,
                    &block.content,
                    "format specification appears more than once",
                ));
            }
            let spec = parse_format_spec(first, block)?;
            *format = Some(spec);
            Ok(DataBlock::FormatSpec(spec))
        }
        "MO" => match first {
            "MOIN" => Ok(DataBlock::Mode(Units::Inches)),
            "MOMM" => Ok(DataBlock::Mode(Units::Millimeters)),
            other => Err(GerberError::format(
                block.index,
                &block.content,
                format!("unknown unit mode `{other}`"),
            )),
        },
        "AD" => parse_aperture_def(first, block),
        "AM" => {
            let name = first[2..].trim();
            if name.is_empty() {
                return Err(GerberError::format(
                    block.index,
                    &block.content,
                    "aperture macro without a name",
                ));
            }
            let definition = ApertureMacro::parse(name.to_string(), &statements[1..])
                .map_err(|message| GerberError::format(block.index, &block.content, message))?;
            Ok(DataBlock::MacroDef(definition))
        }
        "SR" => parse_step_and_repeat(first, block),
        "LP" => match first {
            "LPC" => Ok(DataBlock::LevelPolarity(Polarity::Clear)),
            "LPD" => Ok(DataBlock::LevelPolarity(Polarity::Dark)),
            other => Err(GerberError::format(
                block.index,
                &block.content,
                format!("unknown level polarity `{other}`"),
            )),
        },
        "IN" | "AS" | "LN" | "IR" | "IP" | "MI" | "OF" | "SF" => {
            warn!(
                "deprecated parameter `{}` in block {} ignored",
                block.content, block.index
            );
            Ok(DataBlock::Deprecated(block.content.clone()))
        }
        other => Err(GerberError::format(
            block.index,
            &block.content,
            format!("unknown parameter code `{other}`"),
        )),
    }
}

/// `FS` + `L|T` + `A|I` + `X<int><dec>Y<int><dec>`; X and Y must match.
fn parse_format_spec(statement: &str, block: &Block) -> Result<CoordinateFormat, GerberError> {
    let bad = |message: String| GerberError::format(block.index, &block.content, message);
    let bytes = statement.as_bytes();
    if bytes.len() != 10 {
        return Err(bad(format!("malformed format specification `{statement}`")));
    }

    let zero_omission = match bytes[2] {
        b'L' => ZeroOmission::Leading,
        b'T' => ZeroOmission::Trailing,
        other => return Err(bad(format!("bad zero-omission mode `{}`", other as char))),
    };
    let notation = match bytes[3] {
        b'A' => Notation::Absolute,
        b'I' => Notation::Incremental,
        other => return Err(bad(format!("bad coordinate notation `{}`", other as char))),
    };
    if bytes[4] != b'X' || bytes[7] != b'Y' {
        return Err(bad(format!("malformed format specification `{statement}`")));
    }

    let digit = |byte: u8, what: &str| -> Result<u8, GerberError> {
        let value = (byte as char)
            .to_digit(10)
            .ok_or_else(|| bad(format!("bad {what} digit count `{}`", byte as char)))?
            as u8;
        if value > 7 {
            return Err(bad(format!("{what} digit count {value} outside 0..=7")));
        }
        Ok(value)
    };
    let x_integer = digit(bytes[5], "X integer")?;
    let x_decimal = digit(bytes[6], "X decimal")?;
    let y_integer = digit(bytes[8], "Y integer")?;
    let y_decimal = digit(bytes[9], "Y decimal")?;

    if x_integer != y_integer || x_decimal != y_decimal {
        return Err(bad(format!(
            "X and Y formats disagree: X{x_integer}{x_decimal} vs Y{y_integer}{y_decimal}"
        )));
    }

    Ok(CoordinateFormat {
        integer_digits: x_integer,
        decimal_digits: x_decimal,
        zero_omission,
        notation,
    })
}

/// `AD` + `D<num>` + shape (`C`, `R`, `O`, `P`) or macro name, then an
/// `X`-separated modifier list.
fn parse_aperture_def(statement: &str, block: &Block) -> Result<DataBlock, GerberError> {
    let bad = |message: String| GerberError::format(block.index, &block.content, message);
    let rest = statement[2..]
        .strip_prefix('D')
        .ok_or_else(|| bad(format!("aperture definition without D code `{statement}`")))?;

    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let code: u32 = rest[..digits]
        .parse()
        .map_err(|_| bad(format!("bad aperture number in `{statement}`")))?;

    let template = &rest[digits..];
    let (name, modifier_text) = match template.find(',') {
        Some(comma) => (&template[..comma], &template[comma + 1..]),
        None => (template, ""),
    };
    if name.is_empty() {
        return Err(bad(format!("aperture D{code} without a shape")));
    }

    let modifiers: Vec<f64> = if modifier_text.is_empty() {
        Vec::new()
    } else {
        modifier_text
            .split('X')
            .map(|m| {
                m.trim()
                    .parse::<f64>()
                    .map_err(|_| bad(format!("bad aperture modifier `{m}` in `{statement}`")))
            })
            .collect::<Result<_, _>>()?
    };

    let definition = |message: String| GerberError::definition(block.index, &block.content, message);

    let aperture = match name {
        "C" => {
            let diameter = *modifiers
                .first()
                .ok_or_else(|| bad(format!("circle aperture D{code} missing diameter")))?;
            if diameter < 0.0 {
                return Err(definition(format!("circle aperture D{code} has negative diameter")));
            }
            Aperture::Circle {
                diameter,
                hole: parse_hole(&modifiers[1..], code, block)?,
            }
        }
        "R" | "O" => {
            if modifiers.len() < 2 {
                return Err(bad(format!("aperture D{code} needs X and Y sizes")));
            }
            let (x_size, y_size) = (modifiers[0], modifiers[1]);
            if x_size <= 0.0 || y_size <= 0.0 {
                return Err(definition(format!("aperture D{code} sizes must be positive")));
            }
            let hole = parse_hole(&modifiers[2..], code, block)?;
            if name == "R" {
                Aperture::Rectangle { x_size, y_size, hole }
            } else {
                Aperture::Obround { x_size, y_size, hole }
            }
        }
        "P" => {
            if modifiers.len() < 2 {
                return Err(bad(format!(
                    "polygon aperture D{code} needs diameter and vertex count"
                )));
            }
            let outer_diameter = modifiers[0];
            if outer_diameter <= 0.0 {
                return Err(definition(format!(
                    "polygon aperture D{code} diameter must be positive"
                )));
            }
            let vertices = modifiers[1];
            if vertices.fract() != 0.0 || !(3.0..=12.0).contains(&vertices) {
                return Err(definition(format!(
                    "polygon aperture D{code} vertex count {vertices} outside 3..=12"
                )));
            }
            let rotation = modifiers.get(2).copied().unwrap_or(0.0);
            Aperture::Polygon {
                outer_diameter,
                vertices: vertices as u32,
                rotation,
                hole: parse_hole(&modifiers[3..], code, block)?,
            }
        }
        macro_name => Aperture::Macro {
            name: macro_name.to_string(),
            args: modifiers,
        },
    };

    Ok(DataBlock::ApertureDef { code, aperture })
}

/// One trailing value makes a circular hole, two a rectangular one.
fn parse_hole(modifiers: &[f64], code: u32, block: &Block) -> Result<Option<Hole>, GerberError> {
    let illegal = |message: String| GerberError::definition(block.index, &block.content, message);
    match modifiers {
        [] => Ok(None),
        [diameter] => {
            if *diameter < 0.0 {
                return Err(illegal(format!("aperture D{code} has a negative hole diameter")));
            }
            Ok(Some(Hole::Circular { diameter: *diameter }))
        }
        [width, height] => {
            if *width < 0.0 || *height < 0.0 {
                return Err(illegal(format!("aperture D{code} has negative hole dimensions")));
            }
            Ok(Some(Hole::Rectangular {
                width: *width,
                height: *height,
            }))
        }
        more => Err(illegal(format!(
            "aperture D{code} has {} hole modifiers, at most 2 allowed",
            more.len()
        ))),
    }
}

/// `SR` + `X<r>Y<r>I<step>J<step>`, all optional, defaults `1,1,0,0`.
fn parse_step_and_repeat(statement: &str, block: &Block) -> Result<DataBlock, GerberError> {
    let bad = |message: String| GerberError::format(block.index, &block.content, message);
    let body = &statement[2..];

    let field = |key: char| -> Option<&str> {
        let at = body.find(key)?;
        let rest = &body[at + 1..];
        let end = rest
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        Some(&rest[..end])
    };

    let x_repeat: u32 = match field('X') {
        Some(text) => text
            .parse()
            .map_err(|_| bad(format!("bad X repeat in `{statement}`")))?,
        None => 1,
    };
    let y_repeat: u32 = match field('Y') {
        Some(text) => text
            .parse()
            .map_err(|_| bad(format!("bad Y repeat in `{statement}`")))?,
        None => 1,
    };
    let i_step: f64 = match field('I') {
        Some(text) => text
            .parse()
            .map_err(|_| bad(format!("bad I step in `{statement}`")))?,
        None => 0.0,
    };
    let j_step: f64 = match field('J') {
        Some(text) => text
            .parse()
            .map_err(|_| bad(format!("bad J step in `{statement}`")))?,
        None => 0.0,
    };

    if x_repeat < 1 || y_repeat < 1 {
        return Err(bad(format!("step-and-repeat counts must be at least 1 in `{statement}`")));
    }
    if i_step < 0.0 || j_step < 0.0 {
        return Err(bad(format!("step-and-repeat steps must be non-negative in `{statement}`")));
    }

    Ok(DataBlock::StepAndRepeat {
        x_repeat,
        y_repeat,
        i_step,
        j_step,
    })
}

// ─── Data blocks ────────────────────────────────────────────────────

fn parse_data(block: &Block, format: Option<&CoordinateFormat>) -> Result<DataBlock, GerberError> {
    let content = block.content.as_str();
    let bad = |message: String| GerberError::format(block.index, content, message);

    // Function-code prefix.
    if let Some(rest) = content.strip_prefix('G') {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 || digits > 2 {
            return Err(bad(format!("malformed G code in `{content}`")));
        }
        let code: u32 = rest[..digits].parse().unwrap_or(u32::MAX);
        let tail = &rest[digits..];

        match code {
            4 => {
                // The rest of the block is the comment text.
                return Ok(DataBlock::Comment(
                    tail.strip_prefix(' ').unwrap_or(tail).to_string(),
                ));
            }
            1 | 2 | 3 => {
                let function = Some(match code {
                    1 => InterpolationMode::Linear,
                    2 => InterpolationMode::Clockwise,
                    _ => InterpolationMode::CounterClockwise,
                });
                return parse_coordinate_word(tail, function, block, format);
            }
            36 | 37 | 74 | 75 => {
                if !tail.is_empty() {
                    return Err(bad(format!("unexpected content after G{code}: `{tail}`")));
                }
                let function = match code {
                    36 => StateFunction::RegionOn,
                    37 => StateFunction::RegionOff,
                    74 => StateFunction::SingleQuadrant,
                    _ => StateFunction::MultiQuadrant,
                };
                return Ok(DataBlock::StateChange(function));
            }
            70 | 71 | 90 | 91 => {
                if !tail.is_empty() {
                    return Err(bad(format!("unexpected content after G{code}: `{tail}`")));
                }
                let function = match code {
                    70 => StateFunction::UnitInch,
                    71 => StateFunction::UnitMillimeter,
                    90 => StateFunction::NotationAbsolute,
                    _ => StateFunction::NotationIncremental,
                };
                return Ok(DataBlock::StateChange(function));
            }
            54 => {
                // Deprecated select-aperture prefix; the D code follows.
                if tail.is_empty() {
                    return Err(bad("G54 without an aperture selection".into()));
                }
                return parse_coordinate_word(tail, None, block, format);
            }
            55 => {
                // Deprecated prepare-for-flash; the flash follows, if any.
                if tail.is_empty() {
                    return Ok(DataBlock::StateChange(StateFunction::PrepareForFlash));
                }
                return parse_coordinate_word(tail, None, block, format);
            }
            other => return Err(bad(format!("unrecognized function code G{other}"))),
        }
    }

    if let Some(rest) = content.strip_prefix('M') {
        let code: u32 = rest
            .parse()
            .map_err(|_| bad(format!("malformed M code in `{content}`")))?;
        let function = match code {
            0 => StateFunction::ProgramStop,
            1 => StateFunction::OptionalStop,
            2 => StateFunction::EndOfFile,
            other => return Err(bad(format!("unrecognized function code M{other}"))),
        };
        return Ok(DataBlock::StateChange(function));
    }

    parse_coordinate_word(content, None, block, format)
}

/// Parse `X.. Y.. I.. J.. D..` with modal X/Y and per-block I/J defaults.
fn parse_coordinate_word(
    word: &str,
    function: Option<InterpolationMode>,
    block: &Block,
    format: Option<&CoordinateFormat>,
) -> Result<DataBlock, GerberError> {
    let bad = |message: String| GerberError::format(block.index, &block.content, message);

    let mut x: Option<f64> = None;
    let mut y: Option<f64> = None;
    let mut i: Option<f64> = None;
    let mut j: Option<f64> = None;
    let mut d_code: Option<u32> = None;

    let bytes = word.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        let key = bytes[pos] as char;
        pos += 1;
        match key {
            ' ' | '\t' => {}
            'X' | 'Y' | 'I' | 'J' => {
                let start = pos;
                if pos < bytes.len() && (bytes[pos] == b'+' || bytes[pos] == b'-') {
                    pos += 1;
                }
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                let literal = &word[start..pos];
                let format = format.ok_or_else(|| {
                    bad("coordinate data before format specification".into())
                })?;
                let value = format
                    .scale_literal(literal)
                    .map_err(|message| bad(message))?;
                match key {
                    'X' => x = Some(value),
                    'Y' => y = Some(value),
                    'I' => i = Some(value),
                    _ => j = Some(value),
                }
            }
            'D' => {
                let start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                d_code = Some(
                    word[start..pos]
                        .parse()
                        .map_err(|_| bad(format!("malformed D code in `{word}`")))?,
                );
            }
            other => {
                return Err(bad(format!("unexpected character `{other}` in `{word}`")));
            }
        }
    }

    let has_coordinates = x.is_some() || y.is_some() || i.is_some() || j.is_some();

    match d_code {
        Some(code @ 1..=3) => {
            let operation = Some(match code {
                1 => Operation::Interpolate,
                2 => Operation::Move,
                _ => Operation::Flash,
            });
            Ok(DataBlock::Interpolation(Interpolation {
                function,
                operation,
                x,
                y,
                i: i.unwrap_or(0.0),
                j: j.unwrap_or(0.0),
            }))
        }
        Some(code) if code >= 10 => {
            if has_coordinates {
                return Err(bad(format!(
                    "aperture selection D{code} cannot carry coordinate data"
                )));
            }
            Ok(DataBlock::SelectAperture(code))
        }
        Some(code) => Err(bad(format!("unknown operation code D{code}"))),
        None => {
            if has_coordinates {
                // Coordinate data without a D code is deprecated and
                // rejected outright.
                return Err(bad(format!("coordinate data without a D code in `{word}`")));
            }
            Ok(DataBlock::Interpolation(Interpolation {
                function,
                operation: None,
                x: None,
                y: None,
                i: 0.0,
                j: 0.0,
            }))
        }
    }
}
