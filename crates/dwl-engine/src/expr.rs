//! Derivation formula evaluation.
//!
//! A small expression language over the projected row: column references,
//! numeric and string literals, arithmetic (`+ - * / %`), parentheses, and
//! the helper functions `ROUND, ABS, COALESCE, CONCAT, UPPER, LOWER, LEN,
//! SPLIT`. NULL propagates through arithmetic; `COALESCE` is the escape
//! hatch. Formulas are parsed once per chunk and evaluated per row.

use std::fmt;

use dwl_store::SqlValue;

#[derive(Debug, Clone, PartialEq)]
pub struct EvalError(pub String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "derivation error: {}", self.0)
    }
}

impl std::error::Error for EvalError {}

fn err<T>(msg: impl Into<String>) -> Result<T, EvalError> {
    Err(EvalError(msg.into()))
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Int(i64),
    Float(f64),
    Text(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Text(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return err("unterminated string literal");
                    }
                    let c = bytes[i] as char;
                    if c == '\'' {
                        // Doubled quote is an escaped quote.
                        if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                            s.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    s.push(c);
                    i += 1;
                }
                tokens.push(Token::Text(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut saw_dot = false;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_digit() {
                        i += 1;
                    } else if c == '.' && !saw_dot {
                        saw_dot = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let raw = &input[start..i];
                if saw_dot {
                    match raw.parse() {
                        Ok(f) => tokens.push(Token::Float(f)),
                        Err(_) => return err(format!("bad number {raw}")),
                    }
                } else {
                    match raw.parse() {
                        Ok(n) => tokens.push(Token::Int(n)),
                        Err(_) => return err(format!("bad number {raw}")),
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => return err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub fn parse(input: &str) -> Result<Expr, EvalError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return err("trailing input after expression");
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvalError> {
        match self.next() {
            Some(t) if t == *token => Ok(()),
            other => err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.next();
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let inner = self.factor()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Float(f)) => Ok(Expr::Float(f)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.expr()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name.to_ascii_uppercase(), args))
                } else {
                    Ok(Expr::Column(name))
                }
            }
            other => err(format!("unexpected token {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Column resolution context: name -> value, case-insensitive.
pub trait RowContext {
    fn value_of(&self, column: &str) -> Option<SqlValue>;
}

impl RowContext for Vec<(String, SqlValue)> {
    fn value_of(&self, column: &str) -> Option<SqlValue> {
        self.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, v)| v.clone())
    }
}

pub fn eval(expr: &Expr, row: &dyn RowContext) -> Result<SqlValue, EvalError> {
    match expr {
        Expr::Int(n) => Ok(SqlValue::Int(Some(*n))),
        Expr::Float(f) => Ok(SqlValue::Float(Some(*f))),
        Expr::Text(s) => Ok(SqlValue::Text(Some(s.clone()))),
        Expr::Column(name) => row
            .value_of(name)
            .ok_or_else(|| EvalError(format!("unknown column {name}"))),
        Expr::Unary(UnaryOp::Neg, inner) => match eval(inner, row)? {
            SqlValue::Int(Some(n)) => Ok(SqlValue::Int(Some(-n))),
            SqlValue::Float(Some(f)) => Ok(SqlValue::Float(Some(-f))),
            v if v.is_null() => Ok(SqlValue::Float(None)),
            other => err(format!("cannot negate {other:?}")),
        },
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, row)?;
            let r = eval(rhs, row)?;
            arith(*op, l, r)
        }
        Expr::Call(name, args) => call(name, args, row),
    }
}

fn arith(op: BinaryOp, l: SqlValue, r: SqlValue) -> Result<SqlValue, EvalError> {
    if l.is_null() || r.is_null() {
        return Ok(SqlValue::Float(None));
    }
    // Integer arithmetic stays integral except division.
    if let (SqlValue::Int(Some(a)), SqlValue::Int(Some(b))) = (&l, &r) {
        let (a, b) = (*a, *b);
        return match op {
            BinaryOp::Add => Ok(SqlValue::Int(Some(a + b))),
            BinaryOp::Sub => Ok(SqlValue::Int(Some(a - b))),
            BinaryOp::Mul => Ok(SqlValue::Int(Some(a * b))),
            BinaryOp::Div => {
                if b == 0 {
                    err("division by zero")
                } else if a % b == 0 {
                    Ok(SqlValue::Int(Some(a / b)))
                } else {
                    Ok(SqlValue::Float(Some(a as f64 / b as f64)))
                }
            }
            BinaryOp::Rem => {
                if b == 0 {
                    err("division by zero")
                } else {
                    Ok(SqlValue::Int(Some(a % b)))
                }
            }
        };
    }
    let a = as_f64(&l)?;
    let b = as_f64(&r)?;
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return err("division by zero");
            }
            a / b
        }
        BinaryOp::Rem => {
            if b == 0.0 {
                return err("division by zero");
            }
            a % b
        }
    };
    Ok(SqlValue::Float(Some(out)))
}

fn call(name: &str, args: &[Expr], row: &dyn RowContext) -> Result<SqlValue, EvalError> {
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval(a, row)?);
    }
    match name {
        "COALESCE" => {
            for v in values {
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(SqlValue::Text(None))
        }
        "CONCAT" => {
            let mut out = String::new();
            for v in &values {
                if !v.is_null() {
                    out.push_str(&v.read_large_text());
                }
            }
            Ok(SqlValue::Text(Some(out)))
        }
        "UPPER" => text_fn(name, &values, |s| s.to_uppercase()),
        "LOWER" => text_fn(name, &values, |s| s.to_lowercase()),
        "LEN" => {
            let [v] = values.as_slice() else {
                return err("LEN takes one argument");
            };
            if v.is_null() {
                return Ok(SqlValue::Int(None));
            }
            Ok(SqlValue::Int(Some(v.read_large_text().chars().count() as i64)))
        }
        "ABS" => {
            let [v] = values.as_slice() else {
                return err("ABS takes one argument");
            };
            match v {
                SqlValue::Int(Some(n)) => Ok(SqlValue::Int(Some(n.abs()))),
                v if v.is_null() => Ok(SqlValue::Float(None)),
                other => Ok(SqlValue::Float(Some(as_f64(other)?.abs()))),
            }
        }
        "ROUND" => {
            let (v, digits) = match values.as_slice() {
                [v] => (v, 0i64),
                [v, d] => {
                    let SqlValue::Int(Some(d)) = d else {
                        return err("ROUND digits must be an integer");
                    };
                    (v, *d)
                }
                _ => return err("ROUND takes one or two arguments"),
            };
            if v.is_null() {
                return Ok(SqlValue::Float(None));
            }
            let factor = 10f64.powi(digits as i32);
            let rounded = (as_f64(v)? * factor).round() / factor;
            if digits == 0 {
                Ok(SqlValue::Int(Some(rounded as i64)))
            } else {
                Ok(SqlValue::Float(Some(rounded)))
            }
        }
        "SPLIT" => {
            let [s, sep, idx] = values.as_slice() else {
                return err("SPLIT takes (text, separator, index)");
            };
            if s.is_null() {
                return Ok(SqlValue::Text(None));
            }
            let SqlValue::Int(Some(idx)) = idx else {
                return err("SPLIT index must be an integer");
            };
            let text = s.read_large_text();
            let sep = sep.read_large_text();
            if sep.is_empty() {
                return err("SPLIT separator must not be empty");
            }
            let part = text.split(&sep).nth(*idx as usize).map(str::to_string);
            Ok(SqlValue::Text(part))
        }
        other => err(format!("unknown function {other}")),
    }
}

fn text_fn(
    name: &str,
    values: &[SqlValue],
    f: impl Fn(&str) -> String,
) -> Result<SqlValue, EvalError> {
    let [v] = values else {
        return err(format!("{name} takes one argument"));
    };
    if v.is_null() {
        return Ok(SqlValue::Text(None));
    }
    Ok(SqlValue::Text(Some(f(&v.read_large_text()))))
}

fn as_f64(v: &SqlValue) -> Result<f64, EvalError> {
    match v {
        SqlValue::Int(Some(n)) => Ok(*n as f64),
        SqlValue::Float(Some(f)) => Ok(*f),
        SqlValue::Bool(Some(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        SqlValue::Text(Some(s)) => s
            .trim()
            .parse()
            .map_err(|_| EvalError(format!("{s:?} is not numeric"))),
        _ => err("null in numeric context"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Vec<(String, SqlValue)> {
        vec![
            ("amount".to_string(), SqlValue::Float(Some(12.345))),
            ("qty".to_string(), SqlValue::Int(Some(4))),
            ("name".to_string(), SqlValue::Text(Some("Ada".into()))),
            ("missing_val".to_string(), SqlValue::Text(None)),
        ]
    }

    fn run(formula: &str) -> SqlValue {
        eval(&parse(formula).unwrap(), &row()).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("1 + 2 * 3"), SqlValue::Int(Some(7)));
        assert_eq!(run("(1 + 2) * 3"), SqlValue::Int(Some(9)));
        assert_eq!(run("-qty + 10"), SqlValue::Int(Some(6)));
        assert_eq!(run("7 % 4"), SqlValue::Int(Some(3)));
        assert_eq!(run("10 / 4"), SqlValue::Float(Some(2.5)));
    }

    #[test]
    fn column_references_are_case_insensitive() {
        assert_eq!(run("QTY * 2"), SqlValue::Int(Some(8)));
    }

    #[test]
    fn helpers() {
        assert_eq!(run("ROUND(amount, 2)"), SqlValue::Float(Some(12.35)));
        assert_eq!(run("ROUND(amount)"), SqlValue::Int(Some(12)));
        assert_eq!(run("ABS(0 - qty)"), SqlValue::Int(Some(4)));
        assert_eq!(
            run("CONCAT(UPPER(name), '-', qty)"),
            SqlValue::Text(Some("ADA-4".into()))
        );
        assert_eq!(run("LOWER(name)"), SqlValue::Text(Some("ada".into())));
        assert_eq!(run("LEN(name)"), SqlValue::Int(Some(3)));
        assert_eq!(
            run("SPLIT('a|b|c', '|', 1)"),
            SqlValue::Text(Some("b".into()))
        );
        assert_eq!(
            run("COALESCE(missing_val, 'fallback')"),
            SqlValue::Text(Some("fallback".into()))
        );
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        assert!(run("missing_val + 1").is_null());
    }

    #[test]
    fn quoted_strings_escape_quotes() {
        assert_eq!(
            run("CONCAT('it''s ', name)"),
            SqlValue::Text(Some("it's Ada".into()))
        );
    }

    #[test]
    fn errors_are_reported_not_panicked() {
        assert!(eval(&parse("nope_col + 1").unwrap(), &row()).is_err());
        assert!(parse("1 +").is_err());
        assert!(eval(&parse("1 / 0").unwrap(), &row()).is_err());
        assert!(eval(&parse("NOSUCH(1)").unwrap(), &row()).is_err());
    }
}
