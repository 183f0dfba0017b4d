//! Arithmetic expressions used by aperture macros.
//!
//! Macro modifiers are infix expressions over literals, variables (`$1`,
//! `$2`, ...) and the operators `+ - x /` (Gerber spells multiplication `x`
//! because `*` is the statement terminator). Parsing goes through
//! shunting-yard into postfix order, and the postfix sequence is folded into
//! an expression tree that can be evaluated any number of times against a
//! variable environment.

use std::collections::HashMap;
use std::fmt;

use crate::error::GerberError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Multiplication and division bind tighter than addition/subtraction.
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
        }
    }

    fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
            // Division by zero yields a nonfinite value but does not fault.
            BinaryOp::Div => left / right,
        }
    }

    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => 'x',
            BinaryOp::Div => '/',
        }
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Variable(u32),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate against an environment. Unset variables read as 0.0.
    pub fn eval(&self, env: &Environment) -> f64 {
        match self {
            Expr::Literal(value) => *value,
            Expr::Variable(number) => env.get(*number),
            Expr::Binary(op, left, right) => op.apply(left.eval(env), right.eval(env)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Variable(number) => write!(f, "${number}"),
            Expr::Binary(op, left, right) => {
                write!(f, "({left}{}{right})", op.symbol())
            }
        }
    }
}

/// Variable bindings for one aperture instantiation.
///
/// A small dense map keyed by the integer variable number; a fresh owned
/// value per instantiation so apertures never share mutable bindings.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    values: HashMap<u32, f64>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Bind `$1..$k` positionally from an aperture definition's modifiers.
    pub fn from_args(args: &[f64]) -> Self {
        let mut env = Environment::new();
        for (slot, &value) in args.iter().enumerate() {
            env.set(slot as u32 + 1, value);
        }
        env
    }

    pub fn get(&self, number: u32) -> f64 {
        self.values.get(&number).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, number: u32, value: f64) {
        self.values.insert(number, value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Variable(u32),
    Operator(BinaryOp),
    LeftParen,
    RightParen,
}

/// Postfix output of the shunting-yard stage.
#[derive(Debug, Clone, Copy)]
enum Postfix {
    Number(f64),
    Variable(u32),
    Operator(BinaryOp),
}

/// Parse an infix macro expression into an expression tree.
pub fn parse_expression(input: &str) -> Result<Expr, GerberError> {
    let tokens = tokenize(input)?;
    let postfix = to_postfix(&tokens, input)?;
    fold_postfix(&postfix, input)
}

fn tokenize(input: &str) -> Result<Vec<Token>, GerberError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' => {
                chars.next();
            }
            '$' => {
                chars.next();
                let mut accumulator = String::new();
                while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    accumulator.push(chars.next().unwrap());
                }
                let number: u32 = accumulator.parse().map_err(|_| {
                    GerberError::Lexical(format!("bad variable `${accumulator}` in `{input}`"))
                })?;
                tokens.push(Token::Variable(number));
            }
            '0'..='9' | '.' => {
                tokens.push(Token::Number(read_number(&mut chars, input, false)?));
            }
            '-' => {
                chars.next();
                // A minus at the start of an expression or right after an
                // operator or opening paren is a sign, not a subtraction.
                let unary = matches!(
                    tokens.last(),
                    None | Some(Token::Operator(_)) | Some(Token::LeftParen)
                );
                if unary && chars.peek().is_some_and(|c| c.is_ascii_digit() || *c == '.') {
                    tokens.push(Token::Number(read_number(&mut chars, input, true)?));
                } else {
                    tokens.push(Token::Operator(BinaryOp::Sub));
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Operator(BinaryOp::Add));
            }
            'x' | 'X' => {
                chars.next();
                tokens.push(Token::Operator(BinaryOp::Mul));
            }
            '/' => {
                chars.next();
                tokens.push(Token::Operator(BinaryOp::Div));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LeftParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RightParen);
            }
            other => {
                return Err(GerberError::Lexical(format!(
                    "unexpected character `{other}` in expression `{input}`"
                )));
            }
        }
    }

    Ok(tokens)
}

fn read_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    input: &str,
    negative: bool,
) -> Result<f64, GerberError> {
    let mut accumulator = String::new();
    if negative {
        accumulator.push('-');
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit() || *c == '.') {
        accumulator.push(chars.next().unwrap());
    }
    accumulator.parse().map_err(|_| {
        GerberError::Lexical(format!("bad number `{accumulator}` in `{input}`"))
    })
}

/// Shunting-yard: infix tokens to postfix order.
fn to_postfix(tokens: &[Token], input: &str) -> Result<Vec<Postfix>, GerberError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut stack: Vec<Token> = Vec::new();

    for &token in tokens {
        match token {
            Token::Number(value) => output.push(Postfix::Number(value)),
            Token::Variable(number) => output.push(Postfix::Variable(number)),
            Token::Operator(op) => {
                while let Some(Token::Operator(top)) = stack.last() {
                    // Left associativity: pop operators of equal or higher
                    // precedence before pushing this one.
                    if top.precedence() >= op.precedence() {
                        output.push(Postfix::Operator(*top));
                        stack.pop();
                    } else {
                        break;
                    }
                }
                stack.push(Token::Operator(op));
            }
            Token::LeftParen => stack.push(Token::LeftParen),
            Token::RightParen => loop {
                match stack.pop() {
                    Some(Token::Operator(op)) => output.push(Postfix::Operator(op)),
                    Some(Token::LeftParen) => break,
                    _ => {
                        return Err(GerberError::Lexical(format!(
                            "unmatched `)` in expression `{input}`"
                        )));
                    }
                }
            },
        }
    }

    while let Some(token) = stack.pop() {
        match token {
            Token::Operator(op) => output.push(Postfix::Operator(op)),
            _ => {
                return Err(GerberError::Lexical(format!(
                    "unmatched `(` in expression `{input}`"
                )));
            }
        }
    }

    Ok(output)
}

/// Fold a postfix sequence into an expression tree.
fn fold_postfix(postfix: &[Postfix], input: &str) -> Result<Expr, GerberError> {
    let mut stack: Vec<Expr> = Vec::new();

    for &item in postfix {
        match item {
            Postfix::Number(value) => stack.push(Expr::Literal(value)),
            Postfix::Variable(number) => stack.push(Expr::Variable(number)),
            Postfix::Operator(op) => {
                let right = stack.pop();
                let left = stack.pop();
                match (left, right) {
                    (Some(left), Some(right)) => {
                        stack.push(Expr::Binary(op, Box::new(left), Box::new(right)));
                    }
                    _ => {
                        return Err(GerberError::Lexical(format!(
                            "operator `{}` missing operand in `{input}`",
                            op.symbol()
                        )));
                    }
                }
            }
        }
    }

    if stack.len() != 1 {
        return Err(GerberError::Lexical(format!(
            "malformed expression `{input}`"
        )));
    }
    Ok(stack.pop().unwrap())
}
