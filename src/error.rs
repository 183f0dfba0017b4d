use thiserror::Error;

/// Errors raised while lexing, parsing, or rendering a Gerber file.
///
/// Every variant except `Io` and `Png` carries the text of the offending
/// block and its index in the block stream, so a failure can be traced back
/// to the exact command in the input file.
#[derive(Error, Debug)]
pub enum GerberError {
    /// Malformed block boundaries or non-ASCII input.
    #[error("lexical error: {0}")]
    Lexical(String),

    /// Violations of the coordinate-format rules: a second %FS or %MO,
    /// coordinate data before %FS, mismatched X/Y precision, digit counts
    /// out of range.
    #[error("format error in block {index} `{block}`: {message}")]
    Format {
        index: usize,
        block: String,
        message: String,
    },

    /// Bad aperture or macro definitions: numbers below 10, duplicates,
    /// use before definition, illegal hole dimensions.
    #[error("definition error in block {index} `{block}`: {message}")]
    Definition {
        index: usize,
        block: String,
        message: String,
    },

    /// Geometry that cannot be drawn: arcs without a quadrant mode, a
    /// single-quadrant arc with no acceptable center, a flash inside a
    /// region, macro rotation with a non-origin center.
    #[error("geometry error in block {index} `{block}`: {message}")]
    Geometry {
        index: usize,
        block: String,
        message: String,
    },

    /// The block stream ended without an M02.
    #[error("termination error: {0}")]
    Termination(String),

    /// The input could not be read or the output could not be written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PNG encoding failed.
    #[error("PNG error: {0}")]
    Png(#[from] image::ImageError),
}

impl GerberError {
    pub fn format(index: usize, block: &str, message: impl Into<String>) -> Self {
        GerberError::Format {
            index,
            block: block.to_string(),
            message: message.into(),
        }
    }

    pub fn definition(index: usize, block: &str, message: impl Into<String>) -> Self {
        GerberError::Definition {
            index,
            block: block.to_string(),
            message: message.into(),
        }
    }

    pub fn geometry(index: usize, block: &str, message: impl Into<String>) -> Self {
        GerberError::Geometry {
            index,
            block: block.to_string(),
            message: message.into(),
        }
    }
}
