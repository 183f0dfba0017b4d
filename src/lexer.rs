use crate::error::GerberError;

/// Raw block kinds produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Content between `%` delimiters. May contain embedded `*` statement
    /// separators (aperture macro definitions do).
    Parameter,
    /// A word command terminated by `*`.
    Data,
}

/// One raw block with its position in the stream, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub content: String,
    pub index: usize,
}

impl Block {
    fn parameter(content: String, index: usize) -> Self {
        Block {
            kind: BlockKind::Parameter,
            content,
            index,
        }
    }

    fn data(content: String, index: usize) -> Self {
        Block {
            kind: BlockKind::Data,
            content,
            index,
        }
    }
}

/// Tokenize a Gerber file into a sequence of raw blocks.
///
/// Gerber uses `*` as a statement terminator and `%...%` to group extended
/// (parameter) commands. A parameter block is kept whole here, embedded `*`
/// separators included; the parser splits it into statements. Whitespace
/// and line terminators outside tokens are dropped.
pub fn tokenize(input: &str) -> Result<Vec<Block>, GerberError> {
    if !input.is_ascii() {
        return Err(GerberError::Lexical(
            "input contains non-ASCII bytes".into(),
        ));
    }

    let mut blocks = Vec::new();
    let mut chars = input.chars().peekable();
    let mut index = 0usize;

    while let Some(&ch) = chars.peek() {
        match ch {
            '%' => {
                chars.next(); // consume opening '%'
                let mut content = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '%' {
                        closed = true;
                        break;
                    }
                    // Line terminators are ignored inside blocks; spaces are
                    // kept because macro comment text contains them.
                    if c != '\n' && c != '\r' {
                        content.push(c);
                    }
                }
                if !closed {
                    return Err(GerberError::Lexical(format!(
                        "unterminated parameter block `%{content}`"
                    )));
                }
                let content = content.trim().to_string();
                if !content.is_empty() {
                    blocks.push(Block::parameter(content, index));
                    index += 1;
                }
            }
            '\n' | '\r' | ' ' | '\t' => {
                chars.next();
            }
            _ => {
                let mut content = String::new();
                let mut terminated = false;
                while let Some(&c) = chars.peek() {
                    if c == '*' {
                        chars.next();
                        terminated = true;
                        break;
                    }
                    if c == '%' {
                        break; // let the outer loop handle the parameter block
                    }
                    chars.next();
                    if c != '\n' && c != '\r' {
                        content.push(c);
                    }
                }
                if !terminated {
                    return Err(GerberError::Lexical(format!(
                        "data block `{content}` not terminated by `*`"
                    )));
                }
                let content = content.trim().to_string();
                if !content.is_empty() {
                    blocks.push(Block::data(content, index));
                    index += 1;
                }
            }
        }
    }

    Ok(blocks)
}
