//! Recursive-descent parser producing an unbound syntax tree.
//!
//! ```text
//! query      := or_expr descriptor*
//! or_expr    := and_expr (("OR" | "||") and_expr)*
//! and_expr   := not_expr (("AND" | "&&") not_expr)*
//! not_expr   := ("NOT" | "!") not_expr | atom
//! atom       := "(" or_expr ")" | TRUEPREDICATE | FALSEPREDICATE | comparison
//! comparison := [ANY | SOME | ALL | NONE] operand operator ["[c]"] operand
//! descriptor := SORT(path dir, ...) | DISTINCT(path, ...) | LIMIT(n)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::query::lexer::{Lexer, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Quantifier {
    Any,
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BeginsWith,
    EndsWith,
    Contains,
    Like,
    In,
    Between,
    Text,
}

impl CompareOp {
    pub fn is_string_op(self) -> bool {
        matches!(
            self,
            Self::BeginsWith | Self::EndsWith | Self::Contains | Self::Like | Self::Text
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::BeginsWith => "BEGINSWITH",
            Self::EndsWith => "ENDSWITH",
            Self::Contains => "CONTAINS",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::Between => "BETWEEN",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Path { segments: Vec<String>, position: usize },
    Literal { value: Value, position: usize },
    Arg { index: usize, position: usize },
    List { items: Vec<Operand>, position: usize },
}

impl Operand {
    pub fn position(&self) -> usize {
        match self {
            Self::Path { position, .. }
            | Self::Literal { position, .. }
            | Self::Arg { position, .. }
            | Self::List { position, .. } => *position,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pred {
    True,
    False,
    And(Box<Pred>, Box<Pred>),
    Or(Box<Pred>, Box<Pred>),
    Not(Box<Pred>),
    Compare {
        quantifier: Quantifier,
        lhs: Operand,
        op: CompareOp,
        case_insensitive: bool,
        rhs: Operand,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SortKey {
    pub segments: Vec<String>,
    pub ascending: bool,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DescriptorAst {
    Sort(Vec<SortKey>),
    Distinct(Vec<(Vec<String>, usize)>),
    Limit(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedQuery {
    pub predicate: Pred,
    pub descriptors: Vec<DescriptorAst>,
}

const RESERVED: &[&str] = &[
    "and", "or", "not", "any", "some", "all", "none", "in", "between", "beginswith", "endswith",
    "contains", "like", "text", "sort", "distinct", "limit", "truepredicate", "falsepredicate",
];

/// Deepest predicate or list nesting a query may have.
pub(crate) const MAX_DEPTH: usize = 1000;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Parses a complete query string.
pub(crate) fn parse(text: &str) -> CoreResult<ParsedQuery> {
    let mut parser = Parser {
        tokens: Lexer::tokenize(text)?,
        pos: 0,
        depth: 0,
    };
    let predicate = parser.or_expr()?;
    let mut descriptors = Vec::new();
    while let Some(descriptor) = parser.descriptor()? {
        descriptors.push(descriptor);
    }
    if parser.peek().kind != TokenKind::Eof {
        return Err(parser.err_expected("end of query"));
    }
    Ok(ParsedQuery {
        predicate,
        descriptors,
    })
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof and the parser never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, word: &str) -> bool {
        if self.peek().is_keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> CoreResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.err_expected(what))
        }
    }

    /// One level deeper in the syntax tree. Every call is paired with
    /// [`Self::leave`] on success; errors abandon the parse.
    fn enter(&mut self) -> CoreResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CoreError::parse(
                format!("query nests deeper than {MAX_DEPTH} levels"),
                self.peek().position,
            ));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn err_expected(&self, what: &str) -> CoreError {
        let token = self.peek();
        let found = match &token.kind {
            TokenKind::Eof => "end of query".to_owned(),
            TokenKind::Ident(name) => format!("'{name}'"),
            other => format!("{other:?}"),
        };
        CoreError::parse(format!("expected {what}, found {found}"), token.position)
    }

    fn or_expr(&mut self) -> CoreResult<Pred> {
        let mut lhs = self.and_expr()?;
        let mut levels = 0;
        while self.eat(&TokenKind::Or) || self.eat_kw("or") {
            self.enter()?;
            levels += 1;
            let rhs = self.and_expr()?;
            lhs = Pred::Or(Box::new(lhs), Box::new(rhs));
        }
        self.leave(levels);
        Ok(lhs)
    }

    fn and_expr(&mut self) -> CoreResult<Pred> {
        let mut lhs = self.not_expr()?;
        let mut levels = 0;
        while self.eat(&TokenKind::And) || self.eat_kw("and") {
            self.enter()?;
            levels += 1;
            let rhs = self.not_expr()?;
            lhs = Pred::And(Box::new(lhs), Box::new(rhs));
        }
        self.leave(levels);
        Ok(lhs)
    }

    fn not_expr(&mut self) -> CoreResult<Pred> {
        if self.eat(&TokenKind::Not) || self.eat_kw("not") {
            self.enter()?;
            let inner = self.not_expr()?;
            self.leave(1);
            return Ok(Pred::Not(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> CoreResult<Pred> {
        if self.eat(&TokenKind::LParen) {
            self.enter()?;
            let inner = self.or_expr()?;
            self.expect(&TokenKind::RParen, "')'")?;
            self.leave(1);
            return Ok(inner);
        }
        if self.eat_kw("truepredicate") {
            return Ok(Pred::True);
        }
        if self.eat_kw("falsepredicate") {
            return Ok(Pred::False);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> CoreResult<Pred> {
        let quantifier = if self.eat_kw("any") || self.eat_kw("some") {
            Quantifier::Any
        } else if self.eat_kw("all") {
            Quantifier::All
        } else if self.eat_kw("none") {
            Quantifier::None
        } else {
            Quantifier::Any
        };
        let lhs = self.operand()?;
        let op = self.operator()?;
        let case_insensitive = self.eat(&TokenKind::CaseInsensitive);
        let rhs = match op {
            CompareOp::Between => {
                let rhs = self.operand()?;
                match &rhs {
                    Operand::List { items, .. } if items.len() == 2 => rhs,
                    other => {
                        return Err(CoreError::parse(
                            "BETWEEN needs a list of two values",
                            other.position(),
                        ))
                    }
                }
            }
            _ => self.operand()?,
        };
        Ok(Pred::Compare {
            quantifier,
            lhs,
            op,
            case_insensitive,
            rhs,
        })
    }

    fn operator(&mut self) -> CoreResult<CompareOp> {
        let symbol = match self.peek().kind {
            TokenKind::Eq => Some(CompareOp::Eq),
            TokenKind::Ne => Some(CompareOp::Ne),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Le => Some(CompareOp::Le),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Ge => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = symbol {
            self.pos += 1;
            return Ok(op);
        }
        let words = [
            ("beginswith", CompareOp::BeginsWith),
            ("endswith", CompareOp::EndsWith),
            ("contains", CompareOp::Contains),
            ("like", CompareOp::Like),
            ("in", CompareOp::In),
            ("between", CompareOp::Between),
            ("text", CompareOp::Text),
        ];
        for (word, op) in words {
            if self.eat_kw(word) {
                return Ok(op);
            }
        }
        Err(self.err_expected("a comparison operator"))
    }

    fn operand(&mut self) -> CoreResult<Operand> {
        let token = self.peek().clone();
        let position = token.position;
        let literal = |value: Value| Operand::Literal { value, position };
        let operand = match token.kind {
            TokenKind::Int(v) => literal(Value::Int(v)),
            TokenKind::Float(v) => literal(Value::Double(v)),
            TokenKind::Str(v) => literal(Value::String(v)),
            TokenKind::Oid(v) => literal(Value::ObjectId(v)),
            TokenKind::Uuid(v) => literal(Value::Uuid(v)),
            TokenKind::Timestamp(v) => literal(Value::Timestamp(v)),
            TokenKind::Binary(v) => literal(Value::Binary(v)),
            TokenKind::Arg(index) => Operand::Arg { index, position },
            TokenKind::Minus => {
                self.pos += 1;
                let value = match self.peek().kind {
                    TokenKind::Int(v) => Value::Int(-v),
                    TokenKind::Float(v) => Value::Double(-v),
                    _ => return Err(self.err_expected("a number after '-'")),
                };
                literal(value)
            }
            TokenKind::LBrace => {
                self.pos += 1;
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBrace) {
                    loop {
                        items.push(self.operand()?);
                        if self.eat(&TokenKind::RBrace) {
                            break;
                        }
                        self.expect(&TokenKind::Comma, "',' or '}'")?;
                    }
                }
                self.leave(1);
                return Ok(Operand::List { items, position });
            }
            TokenKind::Ident(ref name) => {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    "true" => literal(Value::Bool(true)),
                    "false" => literal(Value::Bool(false)),
                    "null" | "nil" => literal(Value::Null),
                    _ if RESERVED.contains(&lower.as_str()) => {
                        return Err(self.err_expected("a property or value"))
                    }
                    _ => return self.path(),
                }
            }
            _ => return Err(self.err_expected("a property or value")),
        };
        self.pos += 1;
        Ok(operand)
    }

    fn path(&mut self) -> CoreResult<Operand> {
        let position = self.peek().position;
        let mut segments = Vec::new();
        loop {
            match self.advance().kind {
                TokenKind::Ident(name) => segments.push(name),
                _ => {
                    self.pos -= 1;
                    return Err(self.err_expected("a property name"));
                }
            }
            let continues = self.peek().kind == TokenKind::Dot
                && matches!(self.peek_nth(1).kind, TokenKind::Ident(_));
            if !continues {
                break;
            }
            self.pos += 1;
        }
        Ok(Operand::Path { segments, position })
    }

    fn path_segments(&mut self) -> CoreResult<(Vec<String>, usize)> {
        match self.path()? {
            Operand::Path { segments, position } => Ok((segments, position)),
            _ => Err(self.err_expected("a property path")),
        }
    }

    fn descriptor(&mut self) -> CoreResult<Option<DescriptorAst>> {
        if self.eat_kw("sort") {
            self.expect(&TokenKind::LParen, "'('")?;
            let mut keys = Vec::new();
            loop {
                let (segments, position) = self.path_segments()?;
                let ascending = if self.eat_kw("asc") || self.eat_kw("ascending") {
                    true
                } else if self.eat_kw("desc") || self.eat_kw("descending") {
                    false
                } else {
                    return Err(self.err_expected("ASC or DESC"));
                };
                keys.push(SortKey {
                    segments,
                    ascending,
                    position,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Some(DescriptorAst::Sort(keys)));
        }
        if self.eat_kw("distinct") {
            self.expect(&TokenKind::LParen, "'('")?;
            let mut paths = vec![self.path_segments()?];
            while self.eat(&TokenKind::Comma) {
                paths.push(self.path_segments()?);
            }
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Some(DescriptorAst::Distinct(paths)));
        }
        if self.eat_kw("limit") {
            self.expect(&TokenKind::LParen, "'('")?;
            let limit = match self.peek().kind {
                TokenKind::Int(n) if n >= 0 => usize::try_from(n).unwrap_or(usize::MAX),
                _ => return Err(self.err_expected("a non-negative limit")),
            };
            self.pos += 1;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Some(DescriptorAst::Limit(limit)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str], position: usize) -> Operand {
        Operand::Path {
            segments: segments.iter().map(|s| (*s).to_owned()).collect(),
            position,
        }
    }

    #[test]
    fn precedence_and_grouping() {
        let parsed = parse("a == 1 || b == 2 && !(c == 3)").unwrap();
        let Pred::Or(lhs, rhs) = parsed.predicate else {
            panic!("expected OR at the root");
        };
        assert!(matches!(*lhs, Pred::Compare { op: CompareOp::Eq, .. }));
        let Pred::And(_, not) = *rhs else {
            panic!("expected AND on the right");
        };
        assert!(matches!(*not, Pred::Not(_)));
    }

    #[test]
    fn paths_quantifiers_and_modifiers() {
        let parsed = parse("ALL dogs.name BEGINSWITH[c] 'r'").unwrap();
        assert_eq!(
            parsed.predicate,
            Pred::Compare {
                quantifier: Quantifier::All,
                lhs: path(&["dogs", "name"], 4),
                op: CompareOp::BeginsWith,
                case_insensitive: true,
                rhs: Operand::Literal {
                    value: Value::from("r"),
                    position: 28,
                },
            }
        );
        let parsed = parse("@links.Person.dog.@count > 0").unwrap();
        let Pred::Compare { lhs, .. } = parsed.predicate else {
            panic!("expected a comparison");
        };
        assert_eq!(lhs, path(&["@links", "Person", "dog", "@count"], 0));
    }

    #[test]
    fn descriptors() {
        let parsed = parse("TRUEPREDICATE SORT(age DESC, name ASC) DISTINCT(name) LIMIT(5)").unwrap();
        assert_eq!(parsed.predicate, Pred::True);
        assert_eq!(parsed.descriptors.len(), 3);
        assert_eq!(parsed.descriptors[2], DescriptorAst::Limit(5));
        let DescriptorAst::Sort(keys) = &parsed.descriptors[0] else {
            panic!("expected SORT first");
        };
        assert!(!keys[0].ascending && keys[1].ascending);
    }

    #[test]
    fn lists_between_and_negative_numbers() {
        let parsed = parse("age BETWEEN {-1, 10.5} AND name IN {'a', $0}").unwrap();
        let Pred::And(between, within) = parsed.predicate else {
            panic!("expected AND");
        };
        assert!(matches!(*between, Pred::Compare { op: CompareOp::Between, .. }));
        assert!(matches!(*within, Pred::Compare { op: CompareOp::In, .. }));
    }

    #[test]
    fn errors_point_at_the_offending_token() {
        let err = parse("age > ").unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 6, .. }));
        let err = parse("age 18").unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 4, .. }));
        let err = parse("age BETWEEN {1}").unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 12, .. }));
        assert!(parse("a == 1 extra").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let parens = format!("{}age == 1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = parse(&parens).unwrap_err();
        assert!(matches!(err, CoreError::Parse { position, .. } if position == MAX_DEPTH + 1));

        assert!(matches!(parse(&format!("{}age == 1", "!".repeat(200_000))), Err(CoreError::Parse { .. })));
        let chain = vec!["age == 1"; 200_000].join(" && ");
        assert!(matches!(parse(&chain), Err(CoreError::Parse { .. })));
        assert!(matches!(
            parse(&format!("age IN {}1{}", "{".repeat(200_000), "}".repeat(200_000))),
            Err(CoreError::Parse { .. })
        ));

        let fine = format!("{}age == 1{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&fine).is_ok());
    }
}
