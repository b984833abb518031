//! Restricted compilation.
//!
//! Parses source and rewrites the tree so that every attribute load,
//! subscript, iteration, destructuring assignment, in-place update, store
//! target and `print` call goes through a guard hook. Names and attributes
//! starting with an underscore are rejected before anything runs.

use std::sync::Arc;

use super::ast::{Arg, Comprehension, Const, ExceptHandler, Expr, FPart, FunctionDef, Param, Stmt, StmtKind, Target};
use super::error::CompileError;
use super::guards::GuardHook;
use super::parser::parse_program;

/// A program that passed restricted compilation.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub body: Vec<Stmt>,
}

impl CompiledProgram {
    /// Whether the last top-level statement is a bare expression.
    pub fn ends_with_expression(&self) -> bool {
        matches!(self.body.last().map(|s| &s.kind), Some(StmtKind::Expr(_)))
    }
}

/// Parses and restricts `source`. Every policy violation is collected, so a
/// single error lists all offending lines.
pub fn compile_restricted(source: &str) -> Result<CompiledProgram, CompileError> {
    let body = parse_program(source)?;
    let mut pass = Restrictor::default();
    let body = pass.block(body);
    if pass.errors.is_empty() {
        Ok(CompiledProgram { body })
    } else {
        Err(CompileError {
            messages: pass.errors,
        })
    }
}

#[derive(Default)]
struct Restrictor {
    line: usize,
    errors: Vec<String>,
}

fn hook(kind: GuardHook, args: Vec<Expr>) -> Expr {
    Expr::Hook(kind, args.into_iter().map(Arg::Positional).collect())
}

fn string(text: &str) -> Expr {
    Expr::Const(Const::Str(Arc::from(text)))
}

impl Restrictor {
    fn reject(&mut self, message: String) {
        let message = format!("Line {}: {message}", self.line);
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    fn check_name(&mut self, name: &str) {
        if name.starts_with('_') && name != "_" {
            self.reject(format!(
                "\"{name}\" is an invalid variable name because it starts with \"_\""
            ));
        }
    }

    fn check_attr(&mut self, attr: &str) {
        if attr.starts_with('_') {
            self.reject(format!(
                "\"{attr}\" is an invalid attribute name because it starts with \"_\"."
            ));
        }
    }

    fn block(&mut self, body: Vec<Stmt>) -> Vec<Stmt> {
        body.into_iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: Stmt) -> Stmt {
        self.line = stmt.line;
        let kind = match stmt.kind {
            StmtKind::Expr(e) => StmtKind::Expr(self.expr(e)),
            StmtKind::Assign { targets, value } => StmtKind::Assign {
                targets: targets
                    .into_iter()
                    .map(|t| self.target(t, GuardHook::UnpackSequence))
                    .collect(),
                value: self.expr(value),
            },
            StmtKind::AugAssign { target, op, value } => {
                let value = self.expr(value);
                match target {
                    Target::Name(name) => {
                        self.check_name(&name);
                        let symbol = format!("{}=", op.symbol());
                        StmtKind::Assign {
                            targets: vec![Target::Name(name.clone())],
                            value: hook(
                                GuardHook::InPlaceVar,
                                vec![string(&symbol), Expr::Name(name), value],
                            ),
                        }
                    }
                    other => StmtKind::AugAssign {
                        target: self.target(other, GuardHook::UnpackSequence),
                        op,
                        value,
                    },
                }
            }
            StmtKind::AnnAssign { target, value } => StmtKind::AnnAssign {
                target: self.target(target, GuardHook::UnpackSequence),
                value: value.map(|v| self.expr(v)),
            },
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: self.expr(test),
                body: self.block(body),
                orelse: self.block(orelse),
            },
            StmtKind::While { test, body, orelse } => StmtKind::While {
                test: self.expr(test),
                body: self.block(body),
                orelse: self.block(orelse),
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => StmtKind::For {
                target: self.target(target, GuardHook::IterUnpackSequence),
                iter: hook(GuardHook::GetIter, vec![self.expr(iter)]),
                body: self.block(body),
                orelse: self.block(orelse),
            },
            StmtKind::Return(value) => StmtKind::Return(value.map(|v| self.expr(v))),
            StmtKind::FunctionDef(def) => StmtKind::FunctionDef(self.function(&def)),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => StmtKind::Try {
                body: self.block(body),
                handlers: handlers.into_iter().map(|h| self.handler(h)).collect(),
                orelse: self.block(orelse),
                finalbody: self.block(finalbody),
            },
            StmtKind::Raise(value) => StmtKind::Raise(value.map(|v| self.expr(v))),
            StmtKind::Assert { test, msg } => StmtKind::Assert {
                test: self.expr(test),
                msg: msg.map(|m| self.expr(m)),
            },
            StmtKind::Delete(targets) => StmtKind::Delete(
                targets
                    .into_iter()
                    .map(|t| self.target(t, GuardHook::UnpackSequence))
                    .collect(),
            ),
            StmtKind::Global(names) => {
                names.iter().for_each(|n| self.check_name(n));
                StmtKind::Global(names)
            }
            StmtKind::Nonlocal(names) => {
                names.iter().for_each(|n| self.check_name(n));
                StmtKind::Nonlocal(names)
            }
            StmtKind::With { items, body } => StmtKind::With {
                items: items
                    .into_iter()
                    .map(|(e, t)| {
                        let e = self.expr(e);
                        (e, t.map(|t| self.target(t, GuardHook::UnpackSequence)))
                    })
                    .collect(),
                body: self.block(body),
            },
            StmtKind::Import(aliases) => {
                for alias in &aliases {
                    alias.name.split('.').for_each(|part| self.check_name(part));
                    if let Some(name) = &alias.alias {
                        self.check_name(name);
                    }
                }
                StmtKind::Import(aliases)
            }
            StmtKind::ImportFrom { module, names } => {
                module.split('.').for_each(|part| self.check_name(part));
                for alias in &names {
                    self.check_name(alias.alias.as_ref().unwrap_or(&alias.name));
                }
                StmtKind::ImportFrom { module, names }
            }
            kind @ (StmtKind::Break | StmtKind::Continue | StmtKind::Pass) => kind,
        };
        Stmt {
            line: stmt.line,
            kind,
        }
    }

    fn handler(&mut self, handler: ExceptHandler) -> ExceptHandler {
        self.line = handler.line;
        if let Some(name) = &handler.name {
            self.check_name(name);
        }
        ExceptHandler {
            line: handler.line,
            kind: handler.kind.map(|k| self.expr(k)),
            name: handler.name,
            body: self.block(handler.body),
        }
    }

    fn function(&mut self, def: &FunctionDef) -> Arc<FunctionDef> {
        let line = self.line;
        self.check_name(&def.name);
        let mut params = def.params.clone();
        let restrict_params = |this: &mut Self, list: &mut Vec<Param>| {
            for param in list.iter_mut() {
                this.check_name(&param.name);
                param.default = param.default.take().map(|d| this.expr(d));
            }
        };
        restrict_params(self, &mut params.args);
        restrict_params(self, &mut params.kwonly);
        for name in params.vararg.iter().chain(params.kwarg.iter()) {
            self.check_name(name);
        }
        let body = self.block(def.body.clone());
        self.line = line;
        Arc::new(FunctionDef {
            name: def.name.clone(),
            params,
            body,
            globals: def.globals.clone(),
            nonlocals: def.nonlocals.clone(),
        })
    }

    fn target(&mut self, target: Target, unpack: GuardHook) -> Target {
        match target {
            Target::Name(name) => {
                self.check_name(&name);
                Target::Name(name)
            }
            Target::Attribute(obj, attr) => {
                self.check_attr(&attr);
                let obj = self.expr(*obj);
                Target::Attribute(Box::new(hook(GuardHook::Write, vec![obj])), attr)
            }
            Target::Subscript(obj, index) => {
                let obj = self.expr(*obj);
                let index = self.expr(*index);
                Target::Subscript(
                    Box::new(hook(GuardHook::Write, vec![obj])),
                    Box::new(index),
                )
            }
            Target::Tuple { items, .. } => Target::Tuple {
                items: items.into_iter().map(|t| self.target(t, unpack)).collect(),
                guard: Some(unpack),
            },
            Target::Starred(inner) => Target::Starred(Box::new(self.target(*inner, unpack))),
        }
    }

    fn boxed(&mut self, expr: Box<Expr>) -> Box<Expr> {
        Box::new(self.expr(*expr))
    }

    fn exprs(&mut self, items: Vec<Expr>) -> Vec<Expr> {
        items.into_iter().map(|e| self.expr(e)).collect()
    }

    fn args(&mut self, args: Vec<Arg>) -> Vec<Arg> {
        args.into_iter()
            .map(|arg| match arg {
                Arg::Positional(e) => Arg::Positional(self.expr(e)),
                Arg::Keyword(name, e) => {
                    self.check_name(&name);
                    Arg::Keyword(name, self.expr(e))
                }
                Arg::Star(e) => Arg::Star(self.expr(e)),
                Arg::DoubleStar(e) => Arg::DoubleStar(self.expr(e)),
            })
            .collect()
    }

    fn fparts(&mut self, parts: Vec<FPart>) -> Vec<FPart> {
        parts
            .into_iter()
            .map(|part| match part {
                FPart::Literal(text) => FPart::Literal(text),
                FPart::Field {
                    expr,
                    conversion,
                    spec,
                } => FPart::Field {
                    expr: self.expr(expr),
                    conversion,
                    spec: self.fparts(spec),
                },
            })
            .collect()
    }

    fn generators(&mut self, generators: Vec<Comprehension>) -> Vec<Comprehension> {
        generators
            .into_iter()
            .map(|g| Comprehension {
                target: self.target(g.target, GuardHook::IterUnpackSequence),
                iter: hook(GuardHook::GetIter, vec![self.expr(g.iter)]),
                ifs: self.exprs(g.ifs),
            })
            .collect()
    }

    fn expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::Const(c) => Expr::Const(c),
            Expr::FString(parts) => Expr::FString(self.fparts(parts)),
            Expr::Name(name) => {
                self.check_name(&name);
                Expr::Name(name)
            }
            Expr::List(items) => Expr::List(self.exprs(items)),
            Expr::Tuple(items) => Expr::Tuple(self.exprs(items)),
            Expr::Set(items) => Expr::Set(self.exprs(items)),
            Expr::Dict(entries) => Expr::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.map(|k| self.expr(k)), self.expr(v)))
                    .collect(),
            ),
            Expr::Starred(inner) => Expr::Starred(self.boxed(inner)),
            Expr::Attribute(obj, attr) => {
                self.check_attr(&attr);
                let obj = self.expr(*obj);
                hook(GuardHook::GetAttr, vec![obj, string(&attr)])
            }
            Expr::Subscript(obj, index) => {
                let obj = self.expr(*obj);
                let index = self.expr(*index);
                hook(GuardHook::GetItem, vec![obj, index])
            }
            Expr::Slice(lower, upper, step) => Expr::Slice(
                lower.map(|e| self.boxed(e)),
                upper.map(|e| self.boxed(e)),
                step.map(|e| self.boxed(e)),
            ),
            Expr::Call { func, args } => {
                let args = self.args(args);
                match *func {
                    Expr::Name(name) if name == "print" => Expr::Hook(GuardHook::Print, args),
                    other => Expr::Call {
                        func: Box::new(self.expr(other)),
                        args,
                    },
                }
            }
            Expr::BinOp(left, op, right) => Expr::BinOp(self.boxed(left), op, self.boxed(right)),
            Expr::UnaryOp(op, operand) => Expr::UnaryOp(op, self.boxed(operand)),
            Expr::BoolOp(op, values) => Expr::BoolOp(op, self.exprs(values)),
            Expr::Compare(left, rest) => Expr::Compare(
                self.boxed(left),
                rest.into_iter().map(|(op, e)| (op, self.expr(e))).collect(),
            ),
            Expr::IfExp { test, body, orelse } => Expr::IfExp {
                test: self.boxed(test),
                body: self.boxed(body),
                orelse: self.boxed(orelse),
            },
            Expr::Lambda(def) => Expr::Lambda(self.function(&def)),
            Expr::ListComp(element, generators) => {
                let generators = self.generators(generators);
                Expr::ListComp(self.boxed(element), generators)
            }
            Expr::SetComp(element, generators) => {
                let generators = self.generators(generators);
                Expr::SetComp(self.boxed(element), generators)
            }
            Expr::DictComp(key, value, generators) => {
                let generators = self.generators(generators);
                Expr::DictComp(self.boxed(key), self.boxed(value), generators)
            }
            Expr::Hook(kind, args) => {
                self.reject(format!(
                    "\"{}\" is a reserved name",
                    kind.reserved_name()
                ));
                Expr::Hook(kind, args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_expr(program: &CompiledProgram) -> &Expr {
        match &program.body[0].kind {
            StmtKind::Expr(e) => e,
            StmtKind::Assign { value, .. } => value,
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_underscore_names_are_rejected() {
        let err = compile_restricted("x = 1\n__import__('os')").unwrap_err();
        assert_eq!(
            err.messages,
            vec!["Line 2: \"__import__\" is an invalid variable name because it starts with \"_\"".to_string()]
        );
    }

    #[test]
    fn test_dunder_attributes_are_rejected() {
        let err = compile_restricted("().__class__.__bases__").unwrap_err();
        assert_eq!(err.messages.len(), 2);
        assert!(err.messages[0].contains("\"__bases__\" is an invalid attribute name"));
    }

    #[test]
    fn test_attribute_and_subscript_become_hooks() {
        let program = compile_restricted("x = a.b[0]").unwrap();
        match first_expr(&program) {
            Expr::Hook(GuardHook::GetItem, args) => match &args[0] {
                Arg::Positional(Expr::Hook(GuardHook::GetAttr, _)) => {}
                other => panic!("unexpected inner {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_print_and_augassign_rewrites() {
        let program = compile_restricted("print(1)").unwrap();
        assert!(matches!(first_expr(&program), Expr::Hook(GuardHook::Print, _)));
        let program = compile_restricted("n += 2").unwrap();
        assert!(matches!(
            first_expr(&program),
            Expr::Hook(GuardHook::InPlaceVar, _)
        ));
    }

    #[test]
    fn test_for_loop_guards_iteration_and_unpacking() {
        let program = compile_restricted("for k, v in items:\n    pass").unwrap();
        match &program.body[0].kind {
            StmtKind::For { target, iter, .. } => {
                assert!(matches!(iter, Expr::Hook(GuardHook::GetIter, _)));
                assert!(matches!(
                    target,
                    Target::Tuple {
                        guard: Some(GuardHook::IterUnpackSequence),
                        ..
                    }
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_single_underscore_is_allowed() {
        assert!(compile_restricted("for _ in range(3):\n    pass").is_ok());
    }

    #[test]
    fn test_syntax_errors_pass_through() {
        let err = compile_restricted("def f(:\n  pass").unwrap_err();
        assert!(err.messages[0].starts_with("Line 1: SyntaxError"));
    }

    #[test]
    fn test_trailing_expression_detection() {
        assert!(compile_restricted("x = 1\nx").unwrap().ends_with_expression());
        assert!(!compile_restricted("x = 1").unwrap().ends_with_expression());
    }
}
