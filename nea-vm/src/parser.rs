//! Recursive-descent parser for sandbox code
//!
//! Grammar follows Python's precedence ladder:
//!
//! ```text
//! expr       := or_test ['if' or_test 'else' expr]
//! or_test    := and_test ('or' and_test)*
//! and_test   := not_test ('and' not_test)*
//! not_test   := 'not' not_test | comparison
//! comparison := arith (cmp_op arith)*
//! arith      := term (('+'|'-') term)*
//! term       := factor (('*'|'/'|'//'|'%') factor)*
//! factor     := ('+'|'-') factor | power
//! power      := postfix ['**' factor]
//! postfix    := atom (call | subscript | '.' NAME)*
//! ```

use crate::ast::{BinOp, BoolOp, CmpOp, Expr, FStringPart, Stmt, StmtKind, Target, UnaryOp};
use crate::error::{self, Error, Result};
use crate::lexer::{tokenize, Tok, Token};
use serde_json::{Number, Value};

/// Keywords the sandbox recognizes but refuses to run
pub const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "def", "class", "try", "except", "finally", "with", "return", "lambda", "yield", "global",
    "nonlocal", "del", "raise", "assert", "async", "await",
];

/// Every reserved word; none of these can be used as a name
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "break", "continue", "elif", "else", "for", "from", "if",
    "import", "in", "is", "not", "or", "pass", "while", "def", "class", "try", "except",
    "finally", "with", "return", "lambda", "yield", "global", "nonlocal", "del", "raise",
    "assert", "async", "await",
];

/// Parse a block of code into statements
pub fn parse(src: &str) -> Result<Vec<Stmt>> {
    let tokens = tokenize(src)?;
    Parser::new(tokens).module()
}

/// Parse a standalone expression, as found inside f-string fields
pub fn parse_expression(src: &str, line: usize) -> Result<Expr> {
    let mut tokens = tokenize(src.trim())?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.expr()?;
    while parser.peek() == &Tok::Newline {
        parser.pos += 1;
    }
    if parser.peek() != &Tok::Eof {
        return Err(parser.error("invalid syntax in f-string expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    // =========================================================================
    // Token helpers
    // =========================================================================

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        error::syntax(message, self.line())
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.advance() {
            Tok::Name(n) if !KEYWORDS.contains(&n.as_str()) => Ok(n),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a name"))
            }
        }
    }

    /// Whether the next token can begin an expression
    fn starts_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(n) => {
                !KEYWORDS.contains(&n.as_str())
                    || matches!(n.as_str(), "True" | "False" | "None" | "not")
            }
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(o) => matches!(*o, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn module(&mut self) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                Tok::Indent => return Err(self.error("unexpected indent")),
                Tok::Dedent => {
                    self.pos += 1;
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Vec<Stmt>> {
        if self.check_kw("if") {
            return Ok(vec![self.if_stmt()?]);
        }
        if self.check_kw("for") {
            return Ok(vec![self.for_stmt()?]);
        }
        if self.check_kw("while") {
            let line = self.line();
            self.pos += 1;
            let test = self.expr()?;
            self.expect_op(":")?;
            let body = self.suite()?;
            return Ok(vec![Stmt {
                line,
                kind: StmtKind::While { test, body },
            }]);
        }
        self.simple_line()
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        // `if` or `elif`
        let line = self.line();
        self.pos += 1;
        let test = self.expr()?;
        self.expect_op(":")?;
        let body = self.suite()?;
        let orelse = if self.check_kw("elif") {
            vec![self.if_stmt()?]
        } else if self.eat_kw("else") {
            self.expect_op(":")?;
            self.suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            line,
            kind: StmtKind::If { test, body, orelse },
        })
    }

    fn for_stmt(&mut self) -> Result<Stmt> {
        let line = self.line();
        self.pos += 1;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        self.expect_op(":")?;
        let body = self.suite()?;
        Ok(Stmt {
            line,
            kind: StmtKind::For { target, iter, body },
        })
    }

    /// Indented block, or simple statements on the same line
    fn suite(&mut self) -> Result<Vec<Stmt>> {
        if self.peek() != &Tok::Newline {
            return self.simple_line();
        }
        self.pos += 1;
        if self.peek() != &Tok::Indent {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn simple_line(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = vec![self.small_stmt()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.small_stmt()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            Tok::Eof => Ok(stmts),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn small_stmt(&mut self) -> Result<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Name(kw) if kw == "pass" => {
                self.pos += 1;
                StmtKind::Pass
            }
            Tok::Name(kw) if kw == "break" => {
                self.pos += 1;
                StmtKind::Break
            }
            Tok::Name(kw) if kw == "continue" => {
                self.pos += 1;
                StmtKind::Continue
            }
            Tok::Name(kw) if kw == "import" => {
                self.pos += 1;
                return self.import_stmt(line);
            }
            Tok::Name(kw) if kw == "from" => {
                self.pos += 1;
                let module = self.dotted_name()?;
                self.expect_kw("import")?;
                let parens = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    if self.eat_op("*") {
                        return Err(self.error("wildcard imports are not supported"));
                    }
                    let name = self.identifier()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.identifier()?)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !self.eat_op(",") || (parens && self.check_op(")")) {
                        break;
                    }
                }
                if parens {
                    self.expect_op(")")?;
                }
                StmtKind::ImportFrom { module, names }
            }
            Tok::Name(kw) if UNSUPPORTED_KEYWORDS.contains(&kw.as_str()) => {
                return Err(self.error(format!(
                    "'{}' is not supported in this sandbox; write straight-line code using \
                     loops, conditionals and tool calls instead",
                    kw
                )));
            }
            _ => self.expr_stmt()?,
        };
        Ok(Stmt { line, kind })
    }

    fn import_stmt(&mut self, line: usize) -> Result<Stmt> {
        let module = self.dotted_name()?;
        let alias = if self.eat_kw("as") {
            Some(self.identifier()?)
        } else {
            None
        };
        if self.check_op(",") {
            return Err(self.error("import one module per statement"));
        }
        Ok(Stmt {
            line,
            kind: StmtKind::Import { module, alias },
        })
    }

    fn dotted_name(&mut self) -> Result<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn expr_stmt(&mut self) -> Result<StmtKind> {
        let first = self.testlist()?;

        if let Tok::Op(op) = self.peek() {
            if let Some(bin) = BinOp::from_augmented(op) {
                self.pos += 1;
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_)) {
                    return Err(self.error("illegal expression for augmented assignment"));
                }
                let value = self.testlist()?;
                return Ok(StmtKind::AugAssign {
                    target,
                    op: bin,
                    value,
                });
            }
        }

        // Annotated assignment: the annotation is parsed and ignored
        if self.check_op(":") && matches!(first, Expr::Name(_)) {
            self.pos += 1;
            self.expr()?;
            if !self.eat_op("=") {
                return Ok(StmtKind::Pass);
            }
            let value = self.testlist()?;
            let target = self.to_target(first)?;
            return Ok(StmtKind::Assign {
                targets: vec![target],
                value,
            });
        }

        if !self.check_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| self.error("invalid syntax"))?;
        let targets = exprs
            .into_iter()
            .map(|e| self.to_target(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr) -> Result<Target> {
        match expr {
            Expr::Name(n) => Ok(Target::Name(n)),
            Expr::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Expr::Attribute { attr, .. } => Err(self.error(format!(
                "cannot assign to attribute '{}'",
                attr
            ))),
            Expr::Literal(_) => Err(self.error("cannot assign to literal")),
            Expr::Call { .. } => Err(self.error("cannot assign to function call")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    /// Loop and comprehension targets: `x`, `k, v`, `(i, (a, b))`
    fn target_list(&mut self) -> Result<Target> {
        let first = self.postfix()?;
        if !self.check_op(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_kw("in") {
                break;
            }
            items.push(self.postfix()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Comma-separated expressions; more than one becomes a tuple
    fn testlist(&mut self) -> Result<Expr> {
        let first = self.expr()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> Result<Expr> {
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.expr()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn or_test(&mut self) -> Result<Expr> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            let right = self.and_test()?;
            left = Expr::Bool {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            let right = self.not_test()?;
            left = Expr::Bool {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr> {
        if self.eat_kw("not") {
            let operand = self.not_test()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn cmp_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" && matches!(self.peek_next(), Tok::Name(m) if m == "in") => {
                self.pos += 1;
                CmpOp::NotIn
            }
            Tok::Name(n) if n == "is" => {
                if matches!(self.peek_next(), Tok::Name(m) if m == "not") {
                    self.pos += 1;
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.cmp_op() {
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::Compare {
            left: Box::new(left),
            ops,
        })
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.factor()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        let op = if self.eat_op("-") {
            UnaryOp::Neg
        } else if self.eat_op("+") {
            UnaryOp::Pos
        } else {
            return self.power();
        };
        let operand = self.factor()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.factor()?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                expr = self.call(expr)?;
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let attr = match self.advance() {
                    Tok::Name(n) => n,
                    _ => return Err(self.error("expected attribute name after '.'")),
                };
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call(&mut self, func: Expr) -> Result<Expr> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check_op(")") {
            if self.check_op("*") || self.check_op("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_next(), Tok::Op("="));
            if is_keyword {
                let name = self.identifier()?;
                self.pos += 1;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let arg = self.expr()?;
                // Bare generator argument: sum(x for x in xs)
                if self.check_kw("for") {
                    args.push(self.list_comp(arg)?);
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
        })
    }

    fn subscript(&mut self, value: Expr) -> Result<Expr> {
        let lower = if self.check_op(":") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        if !self.eat_op(":") {
            self.expect_op("]")?;
            let index = lower.ok_or_else(|| self.error("empty subscript"))?;
            return Ok(Expr::Subscript {
                value: Box::new(value),
                index,
            });
        }
        let upper = if self.check_op(":") || self.check_op("]") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let step = if self.eat_op(":") && !self.check_op("]") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_op("]")?;
        Ok(Expr::Slice {
            value: Box::new(value),
            lower,
            upper,
            step,
        })
    }

    /// `for target in iter [if cond]*` after an element
    fn comprehension(&mut self) -> Result<(Target, Expr, Vec<Expr>)> {
        self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.or_test()?;
        let mut conds = Vec::new();
        while self.eat_kw("if") {
            conds.push(self.or_test()?);
        }
        if self.check_kw("for") {
            return Err(self.error("nested comprehensions are not supported; use a for loop"));
        }
        Ok((target, iter, conds))
    }

    fn list_comp(&mut self, element: Expr) -> Result<Expr> {
        let (target, iter, conds) = self.comprehension()?;
        Ok(Expr::ListComp {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            conds,
        })
    }

    fn atom(&mut self) -> Result<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Name(n) => match n.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::Null)),
                kw if KEYWORDS.contains(&kw) => {
                    self.pos -= 1;
                    if UNSUPPORTED_KEYWORDS.contains(&kw) {
                        Err(self.error(format!("'{}' is not supported in this sandbox", kw)))
                    } else {
                        Err(self.error("invalid syntax"))
                    }
                }
                _ => Ok(Expr::Name(n)),
            },
            Tok::Int(i) => Ok(Expr::Literal(Value::Number(Number::from(i)))),
            Tok::Float(f) => Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| {
                    error::overflow("float literal out of range").with_context("line", line.to_string())
                }),
            tok @ (Tok::Str(_) | Tok::FStr(_)) => self.strings(tok, line),
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.check_kw("for") {
                    let comp = self.list_comp(first)?;
                    self.expect_op(")")?;
                    return Ok(comp);
                }
                if !self.check_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op(")") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expr()?;
                if self.check_kw("for") {
                    let comp = self.list_comp(first)?;
                    self.expect_op("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op("]") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => self.dict(),
            Tok::Eof | Tok::Newline => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("unexpected end of line"))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("invalid syntax"))
            }
        }
    }

    fn dict(&mut self) -> Result<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.expr()?;
        if !self.eat_op(":") {
            return Err(self.error("set literals are not supported; use a list"));
        }
        let value = self.expr()?;
        if self.check_kw("for") {
            let (target, iter, conds) = self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                target,
                iter: Box::new(iter),
                conds,
            });
        }
        let mut items = vec![(key, value)];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            let key = self.expr()?;
            self.expect_op(":")?;
            items.push((key, self.expr()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(items))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole
    /// run an f-string
    fn strings(&mut self, first: Tok, line: usize) -> Result<Expr> {
        let mut parts = Vec::new();
        let mut formatted = false;
        let mut tok = first;
        loop {
            match tok {
                Tok::FStr(s) => {
                    formatted = true;
                    parts.extend(parse_fstring(&s, line)?);
                }
                Tok::Str(s) => parts.push(FStringPart::Literal(s)),
                _ => return Err(self.error("expected a string literal")),
            }
            if !matches!(self.peek(), Tok::Str(_) | Tok::FStr(_)) {
                break;
            }
            tok = self.advance();
        }

        if formatted {
            return Ok(Expr::FString(parts));
        }
        let joined: String = parts
            .into_iter()
            .map(|p| match p {
                FStringPart::Literal(s) => s,
                FStringPart::Field { .. } => String::new(),
            })
            .collect();
        Ok(Expr::Literal(Value::String(joined)))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Split an f-string body into literal text and `{expr!r:spec}` fields
fn parse_fstring(body: &str, line: usize) -> Result<Vec<FStringPart>> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            literal.push('{');
            i += 2;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(error::syntax("f-string: single '}' is not allowed", line));
        }
        if c != '{' {
            literal.push(c);
            i += 1;
            continue;
        }

        // Field: scan to the matching close brace
        let start = i + 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut split: Option<usize> = None;
        let mut end = None;
        let mut j = start;
        while j < chars.len() {
            let ch = chars[j];
            if let Some(q) = quote {
                if ch == q {
                    quote = None;
                }
            } else {
                match ch {
                    '\'' | '"' => quote = Some(ch),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    '}' if depth > 0 => depth -= 1,
                    '}' => {
                        end = Some(j);
                        break;
                    }
                    '!' if depth == 0 && chars.get(j + 1) != Some(&'=') && split.is_none() => {
                        split = Some(j)
                    }
                    ':' if depth == 0 && split.is_none() => split = Some(j),
                    _ => {}
                }
            }
            j += 1;
        }
        let end = end.ok_or_else(|| error::syntax("f-string: expecting '}'", line))?;
        let expr_end = split.unwrap_or(end);
        let expr_src: String = chars[start..expr_end].iter().collect();
        if expr_src.trim().is_empty() {
            return Err(error::syntax("f-string: empty expression not allowed", line));
        }

        let mut repr = false;
        let mut spec = None;
        if let Some(s) = split {
            let tail: String = chars[s..end].iter().collect();
            let mut rest = tail.as_str();
            if let Some(conv) = rest.strip_prefix('!') {
                let (flag, after) = conv.split_at(conv.find(':').unwrap_or(conv.len()));
                match flag {
                    "r" => repr = true,
                    "s" => {}
                    _ => return Err(error::syntax("f-string: invalid conversion character", line)),
                }
                rest = after;
            }
            if let Some(fmt) = rest.strip_prefix(':') {
                spec = Some(fmt.to_string());
            }
        }

        if !literal.is_empty() {
            parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(FStringPart::Field {
            expr: parse_expression(&expr_src, line)?,
            repr,
            spec,
        });
        i = end + 1;
    }

    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(src: &str) -> StmtKind {
        let mut stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 1, "{src}");
        stmts.remove(0).kind
    }

    #[test]
    fn test_semicolon_separated_statements() {
        let stmts = parse("result = 2+3; final_answer(result)").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::Expr(Expr::Call { .. })));
    }

    #[test]
    fn test_precedence() {
        let kind = single("x = 1 + 2 * 3 ** 2");
        let StmtKind::Assign { value, .. } = kind else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, right, .. } = value else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_if_elif_else() {
        let kind = single("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        let StmtKind::If { orelse, .. } = kind else {
            panic!("expected if");
        };
        assert_eq!(orelse.len(), 1);
        assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_for_with_tuple_target() {
        let kind = single("for k, v in d.items():\n    print(k, v)\n");
        let StmtKind::For { target, .. } = kind else {
            panic!("expected for");
        };
        assert_eq!(
            target,
            Target::Tuple(vec![Target::Name("k".into()), Target::Name("v".into())])
        );
    }

    #[test]
    fn test_keyword_arguments() {
        let kind = single("search(query='rust', limit=3)");
        let StmtKind::Expr(Expr::Call { args, kwargs, .. }) = kind else {
            panic!("expected call");
        };
        assert!(args.is_empty());
        assert_eq!(kwargs.len(), 2);
        assert_eq!(kwargs[0].0, "query");
    }

    #[test]
    fn test_comprehension_and_slice() {
        assert!(matches!(
            single("xs = [x * 2 for x in range(5) if x > 1]"),
            StmtKind::Assign {
                value: Expr::ListComp { .. },
                ..
            }
        ));
        assert!(matches!(
            single("tail = xs[1:]"),
            StmtKind::Assign {
                value: Expr::Slice { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_fstring_fields() {
        let kind = single("s = f\"{name!r}: {total:.2f} {{ok}}\"");
        let StmtKind::Assign {
            value: Expr::FString(parts),
            ..
        } = kind
        else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[0], FStringPart::Field { repr: true, .. }));
        assert!(
            matches!(&parts[2], FStringPart::Field { spec: Some(s), .. } if s == ".2f")
        );
        assert_eq!(parts[3], FStringPart::Literal(" {ok}".into()));
    }

    #[test]
    fn test_imports() {
        assert_eq!(
            single("import math as m"),
            StmtKind::Import {
                module: "math".into(),
                alias: Some("m".into())
            }
        );
        assert!(matches!(single("from math import sqrt, pi"), StmtKind::ImportFrom { names, .. } if names.len() == 2));
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse("x = 1\ny = (2 +\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Syntax);

        let err = parse("a = 1\ndef f():\n    pass\n").unwrap_err();
        assert!(err.message().contains("'def' is not supported"));
        assert_eq!(err.context_value("line"), Some("2"));

        assert!(parse("1 = x").is_err());
        assert!(parse("  x = 1").is_err());
    }

    #[test]
    fn test_single_line_suite() {
        let kind = single("if x: y = 1; z = 2\n");
        let StmtKind::If { body, .. } = kind else {
            panic!("expected if");
        };
        assert_eq!(body.len(), 2);
    }
}
