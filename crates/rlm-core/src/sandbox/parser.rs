//! Recursive-descent parser producing [`super::ast`] nodes.

use std::sync::Arc;

use super::ast::*;
use super::error::CompileError;
use super::lexer::{is_keyword, tokenize, Tok, Token};

type PResult<T> = Result<T, CompileError>;

/// Deepest expression or block nesting accepted.
pub const MAX_NESTING: usize = 200;

/// Parses a whole program.
pub fn parse_program(source: &str) -> PResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut body = Vec::new();
    loop {
        match parser.peek() {
            Tok::Eof => break,
            Tok::Newline => {
                parser.advance();
            }
            Tok::Indent => return Err(parser.error("unexpected indent")),
            _ => body.extend(parser.parse_statement()?),
        }
    }
    Ok(body)
}

/// Parses a standalone expression (used for f-string fields).
pub fn parse_expression(source: &str, line: usize) -> PResult<Expr> {
    let mut tokens = tokenize(source)?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    if matches!(parser.peek(), Tok::Newline | Tok::Eof) {
        return Err(parser.error("f-string: empty expression not allowed"));
    }
    let expr = parser.parse_testlist_star()?;
    while matches!(parser.peek(), Tok::Newline) {
        parser.advance();
    }
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(parser.error("f-string: invalid syntax"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    blocks: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            blocks: 0,
        }
    }

    fn nested<T>(
        &mut self,
        message: &str,
        parse: impl FnOnce(&mut Self) -> PResult<T>,
    ) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(message));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

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

    fn error(&self, message: impl std::fmt::Display) -> CompileError {
        CompileError::syntax(self.line(), message)
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn at_simple_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) || self.at_op(";")
    }

    fn at_expr_end(&self) -> bool {
        match self.peek() {
            Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Indent => true,
            Tok::Op(op) => {
                matches!(*op, ")" | "]" | "}" | "=" | ":" | ";") || BinOp::from_inplace(op).is_some()
            }
            Tok::Name(n) => n == "in",
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "if" => return Ok(vec![self.parse_if()?]),
            "while" => return Ok(vec![self.parse_while()?]),
            "for" => return Ok(vec![self.parse_for()?]),
            "def" => return Ok(vec![self.parse_def()?]),
            "try" => return Ok(vec![self.parse_try()?]),
            "with" => return Ok(vec![self.parse_with()?]),
            "class" => return Err(self.error("class definitions are not supported")),
            "async" | "await" => return Err(self.error("async code is not supported")),
            _ => {}
        }
        if self.at_op("@") {
            return Err(self.error("decorators are not supported"));
        }
        self.parse_simple_line()
    }

    fn parse_simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut out = vec![self.parse_simple()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            out.push(self.parse_simple()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.advance();
            }
            Tok::Eof | Tok::Dedent => {}
            _ => return Err(self.error("invalid syntax")),
        }
        Ok(out)
    }

    fn parse_simple(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Name(kw) if kw == "pass" => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Name(kw) if kw == "break" => {
                self.advance();
                StmtKind::Break
            }
            Tok::Name(kw) if kw == "continue" => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Name(kw) if kw == "return" => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_testlist_star()?))
                }
            }
            Tok::Name(kw) if kw == "raise" => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.parse_test()?;
                    if self.eat_kw("from") {
                        self.parse_test()?;
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            Tok::Name(kw) if kw == "global" || kw == "nonlocal" => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if kw == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            Tok::Name(kw) if kw == "del" => {
                self.advance();
                let mut targets = Vec::new();
                loop {
                    let expr = self.parse_bitor()?;
                    targets.push(self.to_target(expr)?);
                    if !self.eat_op(",") || self.at_simple_end() {
                        break;
                    }
                }
                StmtKind::Delete(targets)
            }
            Tok::Name(kw) if kw == "assert" => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Tok::Name(kw) if kw == "import" => {
                self.advance();
                let mut names = Vec::new();
                loop {
                    let name = self.parse_dotted_name()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    names.push(ImportAlias { name, alias });
                    if !self.eat_op(",") {
                        break;
                    }
                }
                StmtKind::Import(names)
            }
            Tok::Name(kw) if kw == "from" => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.expect_kw("import")?;
                if self.at_op("*") {
                    return Err(self.error("star imports are not supported"));
                }
                let parenthesized = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    let name = self.expect_name()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    names.push(ImportAlias { name, alias });
                    if !self.eat_op(",") {
                        break;
                    }
                    if parenthesized && self.at_op(")") {
                        break;
                    }
                }
                if parenthesized {
                    self.expect_op(")")?;
                }
                StmtKind::ImportFrom { module, names }
            }
            Tok::Name(kw) if kw == "yield" => {
                return Err(self.error("generators are not supported"));
            }
            _ => self.parse_expr_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        if self.at_op(".") {
            return Err(self.error("relative imports are not supported"));
        }
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_expr_statement(&mut self) -> PResult<StmtKind> {
        let first = self.parse_testlist_star()?;
        if self.at_op("=") {
            let mut targets = vec![self.to_target(first)?];
            let value = loop {
                self.expect_op("=")?;
                let next = self.parse_testlist_star()?;
                if self.at_op("=") {
                    targets.push(self.to_target(next)?);
                } else {
                    break next;
                }
            };
            return Ok(StmtKind::Assign { targets, value });
        }
        if let Tok::Op(op) = self.peek() {
            if let Some(bin) = BinOp::from_inplace(op) {
                let target = match self.to_target(first)? {
                    t @ (Target::Name(_) | Target::Attribute(..) | Target::Subscript(..)) => t,
                    _ => return Err(self.error("illegal expression for augmented assignment")),
                };
                self.advance();
                let value = self.parse_testlist_star()?;
                return Ok(StmtKind::AugAssign {
                    target,
                    op: bin,
                    value,
                });
            }
        }
        if self.at_op(":") {
            let target = self.to_target(first)?;
            self.advance();
            self.parse_test()?;
            let value = if self.eat_op("=") {
                Some(self.parse_testlist_star()?)
            } else {
                None
            };
            return Ok(StmtKind::AnnAssign { target, value });
        }
        Ok(StmtKind::Expr(first))
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        if self.blocks >= MAX_NESTING {
            return Err(self.error("too many statically nested blocks"));
        }
        self.blocks += 1;
        let body = self.parse_block_body();
        self.blocks -= 1;
        body
    }

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.parse_simple_line();
        }
        self.advance();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.at_kw("elif") {
            vec![self.parse_if()?]
        } else if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            line,
            kind: StmtKind::If { test, body, orelse },
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            line,
            kind: StmtKind::While { test, body, orelse },
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let target = self.parse_target_list()?;
        self.expect_kw("in")?;
        let iter = self.parse_testlist_star()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            line,
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
        })
    }

    fn parse_def(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            line,
            kind: StmtKind::FunctionDef(Arc::new(function_def(name, params, body))),
        })
    }

    fn parse_params(&mut self, closing: &str, annotations: bool) -> PResult<Params> {
        let mut params = Params::default();
        let mut keyword_only = false;
        let mut seen_default = false;
        while !self.at_op(closing) {
            if self.eat_op("**") {
                params.kwarg = Some(self.expect_name()?);
                if annotations && self.eat_op(":") {
                    self.parse_test()?;
                }
            } else if self.eat_op("*") {
                keyword_only = true;
                if let Tok::Name(_) = self.peek() {
                    params.vararg = Some(self.expect_name()?);
                    if annotations && self.eat_op(":") {
                        self.parse_test()?;
                    }
                }
            } else if self.eat_op("/") {
                // Positional-only marker; all parameters accept positions here.
            } else {
                let name = self.expect_name()?;
                if annotations && self.eat_op(":") {
                    self.parse_test()?;
                }
                let default = if self.eat_op("=") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                if keyword_only {
                    params.kwonly.push(Param { name, default });
                } else {
                    if default.is_some() {
                        seen_default = true;
                    } else if seen_default {
                        return Err(self.error("non-default argument follows default argument"));
                    }
                    params.args.push(Param { name, default });
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at_kw("except") {
            let handler_line = self.line();
            self.advance();
            let (kind, name) = if self.at_op(":") {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                line: handler_line,
                kind,
                name,
                body,
            });
        }
        let orelse = if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            line,
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
        })
    }

    fn parse_with(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let mut items = Vec::new();
        loop {
            let context = self.parse_test()?;
            let target = if self.eat_kw("as") {
                let expr = self.parse_bitor()?;
                Some(self.to_target(expr)?)
            } else {
                None
            };
            items.push((context, target));
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            line,
            kind: StmtKind::With { items, body },
        })
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Attribute(obj, attr) => Ok(Target::Attribute(obj, attr)),
            Expr::Subscript(obj, index) => Ok(Target::Subscript(obj, index)),
            Expr::Tuple(items) | Expr::List(items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<PResult<Vec<_>>>()?;
                if items
                    .iter()
                    .filter(|t| matches!(t, Target::Starred(_)))
                    .count()
                    > 1
                {
                    return Err(self.error("multiple starred expressions in assignment"));
                }
                Ok(Target::Tuple { items, guard: None })
            }
            Expr::Starred(inner) => Ok(Target::Starred(Box::new(self.to_target(*inner)?))),
            Expr::Call { .. } => Err(self.error("cannot assign to function call")),
            Expr::Const(_) | Expr::FString(_) => Err(self.error("cannot assign to literal")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    /// Target list of a `for` clause: stops before `in`.
    fn parse_target_list(&mut self) -> PResult<Target> {
        let mut items = Vec::new();
        let trailing = loop {
            let item = if self.eat_op("*") {
                Expr::Starred(Box::new(self.parse_bitor()?))
            } else {
                self.parse_bitor()?
            };
            items.push(item);
            if !self.eat_op(",") {
                break false;
            }
            if self.at_kw("in") {
                break true;
            }
        };
        let expr = if items.len() == 1 && !trailing {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        };
        self.to_target(expr)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_testlist_star(&mut self) -> PResult<Expr> {
        let first = self.parse_test_or_star()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_test_or_star(&mut self) -> PResult<Expr> {
        if self.eat_op("*") {
            Ok(Expr::Starred(Box::new(self.parse_bitor()?)))
        } else {
            self.parse_test()
        }
    }

    fn parse_test(&mut self) -> PResult<Expr> {
        self.nested("too many nested parentheses", Self::parse_test_body)
    }

    fn parse_test_body(&mut self) -> PResult<Expr> {
        if self.at_kw("lambda") {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if self.at_kw("if") {
            self.advance();
            let test = self.parse_or()?;
            self.expect_kw("else")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.parse_params(":", false)?;
        self.expect_op(":")?;
        let body = self.parse_test()?;
        let def = function_def(
            "<lambda>".to_string(),
            params,
            vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
        );
        Ok(Expr::Lambda(Arc::new(def)))
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let first = self.parse_and()?;
        if !self.at_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp(BoolOp::Or, values))
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let first = self.parse_not()?;
        if !self.at_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp(BoolOp::And, values))
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let operand = self.nested("too many nested parentheses", Self::parse_not)?;
            return Ok(Expr::UnaryOp(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    /// Comparison operator at the cursor and how many tokens it spans.
    fn peek_cmp_op(&self) -> Option<(CmpOp, usize)> {
        let op = match self.peek() {
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" => {
                return matches!(self.peek_next(), Tok::Name(m) if m == "in")
                    .then_some((CmpOp::NotIn, 2));
            }
            Tok::Name(n) if n == "is" => {
                if matches!(self.peek_next(), Tok::Name(m) if m == "not") {
                    return Some((CmpOp::IsNot, 2));
                }
                CmpOp::Is
            }
            _ => return None,
        };
        Some((op, 1))
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        while let Some((op, width)) = self.peek_cmp_op() {
            for _ in 0..width {
                self.advance();
            }
            ops.push((op, self.parse_bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), ops))
        }
    }

    fn parse_binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        loop {
            let Tok::Op(op) = self.peek() else { break };
            if !ops.contains(op) {
                break;
            }
            let Some(bin) = BinOp::from_symbol(op) else { break };
            self.advance();
            let right = next(self)?;
            left = Expr::BinOp(Box::new(left), bin, Box::new(right));
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["|"], Self::parse_xor)
    }

    fn parse_xor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["^"], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["&"], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["<<", ">>"], Self::parse_arith)
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["+", "-"], Self::parse_term)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["*", "/", "//", "%", "@"], Self::parse_factor)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.nested("too many nested parentheses", Self::parse_factor)?;
        if op == UnaryOp::Neg {
            match operand {
                Expr::Const(Const::Int(n)) => return Ok(Expr::Const(Const::Int(-n))),
                Expr::Const(Const::Float(f)) => return Ok(Expr::Const(Const::Float(-f))),
                _ => {}
            }
        }
        Ok(Expr::UnaryOp(op, Box::new(operand)))
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_atom_expr()?;
        if self.eat_op("**") {
            let exponent = self.nested("too many nested parentheses", Self::parse_factor)?;
            return Ok(Expr::BinOp(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat_op("(") {
                let args = self.parse_call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.parse_subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute(Box::new(expr), attr);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        loop {
            if self.eat_op(")") {
                break;
            }
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.parse_test()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.parse_test()?));
            } else if matches!(self.peek(), Tok::Name(n) if !is_keyword(n))
                && matches!(self.peek_next(), Tok::Op("="))
            {
                let name = self.expect_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.parse_test()?));
            } else {
                let value = self.parse_test()?;
                if self.at_kw("for") {
                    let generators = self.parse_comp_clauses()?;
                    args.push(Arg::Positional(Expr::ListComp(Box::new(value), generators)));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_subscript_list(&mut self) -> PResult<Expr> {
        let first = self.parse_subscript_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.parse_subscript_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_subscript_item(&mut self) -> PResult<Expr> {
        let lower = if self.at_op(":") {
            None
        } else {
            Some(self.parse_test()?)
        };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.error("invalid syntax"));
        }
        let ends = |p: &Self| p.at_op("]") || p.at_op(",") || p.at_op(":");
        let upper = if ends(self) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") {
            if self.at_op("]") || self.at_op(",") {
                None
            } else {
                Some(Box::new(self.parse_test()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice(lower.map(Box::new), upper, step))
    }

    fn parse_comp_clauses(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.parse_target_list()?;
            self.expect_kw("in")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                if self.at_kw("yield") {
                    return Err(self.error("generators are not supported"));
                }
                let first = self.parse_test_or_star()?;
                if self.at_kw("for") {
                    let generators = self.parse_comp_clauses()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp(Box::new(first), generators));
                }
                if !self.at_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.parse_test_or_star()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_test_or_star()?;
                if self.at_kw("for") {
                    let generators = self.parse_comp_clauses()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp(Box::new(first), generators));
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.parse_test_or_star()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => self.parse_brace(),
            Tok::Op("...") => Ok(Expr::Const(Const::Ellipsis)),
            Tok::Int(n) => Ok(Expr::Const(Const::Int(n))),
            Tok::Float(f) => Ok(Expr::Const(Const::Float(f))),
            tok @ (Tok::Str(_) | Tok::FStr(_)) => self.parse_strings(tok, line),
            Tok::Name(name) => match name.as_str() {
                "None" => Ok(Expr::Const(Const::None)),
                "True" => Ok(Expr::Const(Const::Bool(true))),
                "False" => Ok(Expr::Const(Const::Bool(false))),
                "yield" => Err(CompileError::syntax(line, "generators are not supported")),
                "await" | "async" => Err(CompileError::syntax(line, "async code is not supported")),
                n if is_keyword(n) => Err(CompileError::syntax(line, "invalid syntax")),
                _ => Ok(Expr::Name(name)),
            },
            Tok::Indent => Err(CompileError::syntax(line, "unexpected indent")),
            Tok::Newline | Tok::Eof | Tok::Dedent => {
                Err(CompileError::syntax(line, "unexpected end of input"))
            }
            Tok::Op(_) => Err(CompileError::syntax(line, "invalid syntax")),
        }
    }

    fn parse_brace(&mut self) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        if self.eat_op("**") {
            let spread = self.parse_bitor()?;
            return self.parse_dict_rest(vec![(None, spread)]);
        }
        let first = self.parse_test_or_star()?;
        if self.eat_op(":") {
            let value = self.parse_test()?;
            if self.at_kw("for") {
                let generators = self.parse_comp_clauses()?;
                self.expect_op("}")?;
                return Ok(Expr::DictComp(Box::new(first), Box::new(value), generators));
            }
            return self.parse_dict_rest(vec![(Some(first), value)]);
        }
        if self.at_kw("for") {
            let generators = self.parse_comp_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::SetComp(Box::new(first), generators));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        self.expect_op("}")?;
        Ok(Expr::Set(items))
    }

    fn parse_dict_rest(&mut self, mut entries: Vec<(Option<Expr>, Expr)>) -> PResult<Expr> {
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.eat_op("**") {
                entries.push((None, self.parse_bitor()?));
                continue;
            }
            let key = self.parse_test()?;
            self.expect_op(":")?;
            let value = self.parse_test()?;
            entries.push((Some(key), value));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(entries))
    }

    fn parse_strings(&mut self, first: Tok, line: usize) -> PResult<Expr> {
        let mut parts: Vec<FPart> = Vec::new();
        let mut any_fstring = false;
        let mut pending = Some(first);
        loop {
            match pending.take() {
                Some(Tok::Str(s)) => push_literal(&mut parts, &s),
                Some(Tok::FStr(s)) => {
                    any_fstring = true;
                    for part in parse_fstring(&s, line)? {
                        match part {
                            FPart::Literal(text) => push_literal(&mut parts, &text),
                            field => parts.push(field),
                        }
                    }
                }
                _ => break,
            }
            if matches!(self.peek(), Tok::Str(_) | Tok::FStr(_)) {
                pending = Some(self.advance());
            }
        }
        if any_fstring {
            return Ok(Expr::FString(parts));
        }
        let text = match parts.pop() {
            Some(FPart::Literal(text)) => text,
            _ => String::new(),
        };
        Ok(Expr::Const(Const::Str(Arc::from(text))))
    }
}

fn push_literal(parts: &mut Vec<FPart>, text: &str) {
    if let Some(FPart::Literal(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(FPart::Literal(text.to_string()));
    }
}

fn function_def(name: String, params: Params, body: Vec<Stmt>) -> FunctionDef {
    let mut globals = Vec::new();
    let mut nonlocals = Vec::new();
    collect_scope_decls(&body, &mut globals, &mut nonlocals);
    FunctionDef {
        name,
        params,
        body,
        globals,
        nonlocals,
    }
}

fn collect_scope_decls(body: &[Stmt], globals: &mut Vec<String>, nonlocals: &mut Vec<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Global(names) => globals.extend(names.iter().cloned()),
            StmtKind::Nonlocal(names) => nonlocals.extend(names.iter().cloned()),
            StmtKind::If { body, orelse, .. }
            | StmtKind::While { body, orelse, .. }
            | StmtKind::For { body, orelse, .. } => {
                collect_scope_decls(body, globals, nonlocals);
                collect_scope_decls(orelse, globals, nonlocals);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                collect_scope_decls(body, globals, nonlocals);
                for handler in handlers {
                    collect_scope_decls(&handler.body, globals, nonlocals);
                }
                collect_scope_decls(orelse, globals, nonlocals);
                collect_scope_decls(finalbody, globals, nonlocals);
            }
            StmtKind::With { body, .. } => collect_scope_decls(body, globals, nonlocals),
            _ => {}
        }
    }
}

/// Splits f-string text into literal runs and `{expr!c:spec}` fields.
fn parse_fstring(text: &str, line: usize) -> PResult<Vec<FPart>> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                literal.push('{');
                i += 2;
                continue;
            }
            if !literal.is_empty() {
                parts.push(FPart::Literal(std::mem::take(&mut literal)));
            }
            let (part, next) = parse_fstring_field(&chars, i + 1, line)?;
            parts.extend(part);
            i = next;
        } else if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(CompileError::syntax(
                line,
                "f-string: single '}' is not allowed",
            ));
        } else {
            literal.push(c);
            i += 1;
        }
    }
    if !literal.is_empty() {
        parts.push(FPart::Literal(literal));
    }
    Ok(parts)
}

fn parse_fstring_field(chars: &[char], start: usize, line: usize) -> PResult<(Vec<FPart>, usize)> {
    let unterminated = || CompileError::syntax(line, "f-string: expecting '}'");
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '}' => break,
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => break,
            ':' if depth == 0 => break,
            _ => {}
        }
        i += 1;
    }
    if i >= chars.len() {
        return Err(unterminated());
    }
    let mut expr_src: String = chars[start..i].iter().collect();
    let mut parts = Vec::new();
    let mut conversion = None;
    let trimmed = expr_src.trim_end();
    if trimmed.ends_with('=') && !trimmed.ends_with("==") && !trimmed.ends_with("!=") {
        parts.push(FPart::Literal(expr_src.clone()));
        expr_src = trimmed.trim_end_matches('=').to_string();
        conversion = Some('r');
    }
    if chars[i] == '!' {
        conversion = chars.get(i + 1).copied();
        if !matches!(conversion, Some('r') | Some('s') | Some('a')) {
            return Err(CompileError::syntax(
                line,
                "f-string: invalid conversion character",
            ));
        }
        i += 2;
    }
    let mut spec = Vec::new();
    if chars.get(i) == Some(&':') {
        let spec_start = i + 1;
        let mut nested = 0usize;
        i = spec_start;
        while i < chars.len() {
            match chars[i] {
                '{' => nested += 1,
                '}' if nested > 0 => nested -= 1,
                '}' => break,
                _ => {}
            }
            i += 1;
        }
        let spec_src: String = chars[spec_start..i.min(chars.len())].iter().collect();
        spec = parse_fstring(&spec_src, line)?;
    }
    if chars.get(i) != Some(&'}') {
        return Err(unterminated());
    }
    let expr = parse_expression(expr_src.trim(), line)?;
    parts.push(FPart::Field {
        expr,
        conversion,
        spec,
    });
    Ok((parts, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_chain() {
        let program = parse_program("a = b = 1\n").unwrap();
        match &program[0].kind {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_tuple_unpack_in_for() {
        let program = parse_program("for k, v in items:\n    pass\n").unwrap();
        match &program[0].kind {
            StmtKind::For { target, .. } => {
                assert!(matches!(target, Target::Tuple { items, .. } if items.len() == 2))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_function_with_defaults_and_kwargs() {
        let program = parse_program("def f(a, b=2, *rest, **opts):\n    return a\n").unwrap();
        match &program[0].kind {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.params.args.len(), 2);
                assert_eq!(def.params.vararg.as_deref(), Some("rest"));
                assert_eq!(def.params.kwarg.as_deref(), Some("opts"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_fstring_fields() {
        let program = parse_program("f'{x!r:>10} and {{literal}}'\n").unwrap();
        match &program[0].kind {
            StmtKind::Expr(Expr::FString(parts)) => {
                assert!(matches!(
                    &parts[0],
                    FPart::Field {
                        conversion: Some('r'),
                        ..
                    }
                ));
                assert!(matches!(&parts[1], FPart::Literal(t) if t == " and {literal}"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_class_definitions_rejected() {
        let err = parse_program("class A:\n    pass\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Line 1: SyntaxError: class definitions are not supported"
        );
    }

    #[test]
    fn test_nesting_is_bounded() {
        let limits = crate::sandbox::ExecutionLimits::default();
        let (shallow, deep, negations, blocks) = crate::sandbox::run_on_sandbox_stack(&limits, || {
            let nest = |n: usize| format!("x = {}1{}\n", "(".repeat(n), ")".repeat(n));
            let blocks = (0..MAX_NESTING + 1)
                .map(|level| format!("{}if x:\n", "    ".repeat(level)))
                .collect::<String>()
                + &"    ".repeat(MAX_NESTING + 1)
                + "pass\n";
            (
                parse_program(&nest(100)),
                parse_program(&nest(20_000)),
                parse_program(&format!("y = {}1\n", "-".repeat(20_000))),
                parse_program(&blocks),
            )
        })
        .unwrap();
        assert!(shallow.is_ok());
        assert_eq!(
            deep.unwrap_err().to_string(),
            "Line 1: SyntaxError: too many nested parentheses"
        );
        assert!(negations.unwrap_err().to_string().contains("too many nested"));
        assert!(blocks
            .unwrap_err()
            .to_string()
            .contains("too many statically nested blocks"));
    }

    #[test]
    fn test_syntax_error_line_number() {
        let err = parse_program("x = 1\ny = (2 +\n").unwrap_err();
        assert!(err.to_string().starts_with("Line "));
    }

    #[test]
    fn test_comprehension_with_condition() {
        let program = parse_program("[x * 2 for x in range(10) if x % 2]\n").unwrap();
        assert!(matches!(
            &program[0].kind,
            StmtKind::Expr(Expr::ListComp(_, generators)) if generators[0].ifs.len() == 1
        ));
    }

    #[test]
    fn test_slices_and_conditional_expression() {
        let program = parse_program("y = a[1:-1:2] if a else b[::2]\n").unwrap();
        assert!(matches!(
            &program[0].kind,
            StmtKind::Assign {
                value: Expr::IfExp { .. },
                ..
            }
        ));
    }
}
