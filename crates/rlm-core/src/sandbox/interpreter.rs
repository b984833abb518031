//! Tree-walking evaluator for compiled sandbox programs.
//!
//! The interpreter owns the [`Namespace`] for the duration of one execution
//! and hands it back through [`Interpreter::finish`]. It is synchronous; the
//! executor runs it on a blocking worker thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::ast::{Arg, BoolOp, Comprehension, Const, Expr, FPart, FunctionDef, Stmt, StmtKind, Target, UnaryOp};
use super::builtins;
use super::error::{ExcType, ExceptionValue, ExecResult, Exception, TraceFrame};
use super::format;
use super::fs::SandboxFs;
use super::guards::{self, GuardHook};
use super::methods;
use super::namespace::Namespace;
use super::ops;
use super::restrict::CompiledProgram;
use super::stdlib;
use super::tooling;
use super::value::{Args, DictData, Function, Scope, SetData, TypeObj, Value};
use crate::tools::ToolHost;

/// Per-execution resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock budget, excluding time spent waiting on tool calls.
    pub timeout: Duration,
    pub max_operations: u64,
    pub max_call_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_operations: 50_000_000,
            max_call_depth: 200,
        }
    }
}

/// Nested evaluations (expressions plus statements) allowed per call level.
const NESTING_PER_CALL: usize = 10;
const STACK_BASE_BYTES: usize = 16 * 1024 * 1024;
const STACK_BYTES_PER_LEVEL: usize = 64 * 1024;

impl ExecutionLimits {
    /// Bound on nested `eval`/`exec_stmt` activations, which is what the
    /// native stack actually pays for.
    pub fn max_nesting(&self) -> usize {
        self.max_call_depth.max(1).saturating_mul(NESTING_PER_CALL)
    }

    /// Stack size of the thread that compiles and runs sandbox code.
    pub fn stack_size(&self) -> usize {
        self.max_nesting()
            .saturating_mul(STACK_BYTES_PER_LEVEL)
            .saturating_add(STACK_BASE_BYTES)
    }
}

/// Runs `f` on a dedicated thread sized by [`ExecutionLimits::stack_size`].
///
/// The caller's tracing span and tokio runtime context are carried over so
/// tool calls behave as they would on the calling thread. A panic in `f` is
/// resumed on the caller. Fails only when the thread cannot be spawned.
pub fn run_on_sandbox_stack<T, F>(limits: &ExecutionLimits, f: F) -> std::io::Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    let span = tracing::Span::current();
    let runtime = tokio::runtime::Handle::try_current().ok();
    std::thread::scope(|scope| {
        let worker = std::thread::Builder::new()
            .name("rlm-sandbox".to_string())
            .stack_size(limits.stack_size())
            .spawn_scoped(scope, move || {
                let _runtime = runtime.as_ref().map(|handle| handle.enter());
                let _span = span.enter();
                f()
            })?;
        match worker.join() {
            Ok(value) => Ok(value),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    })
}

/// Host capabilities available to one execution.
#[derive(Clone, Default)]
pub struct ExecContext {
    pub fs: Arc<SandboxFs>,
    pub host: Option<Arc<dyn ToolHost>>,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    name: String,
    line: usize,
    locals: Scope,
    /// Enclosing function scopes, outermost first.
    closure: Vec<Scope>,
    /// `None` for comprehension frames.
    def: Option<Arc<FunctionDef>>,
}

pub struct Interpreter {
    ns: Namespace,
    ctx: ExecContext,
    limits: ExecutionLimits,
    deadline: Option<Instant>,
    ops: u64,
    frames: Vec<Frame>,
    /// Active `eval`/`exec_stmt` calls.
    nesting: usize,
    module_line: usize,
    stdout: String,
    /// Exceptions currently being handled, for bare `raise`.
    handling: Vec<Exception>,
}

impl Interpreter {
    pub fn new(ns: Namespace, ctx: ExecContext, limits: ExecutionLimits) -> Self {
        Self {
            ns,
            ctx,
            limits,
            deadline: None,
            ops: 0,
            frames: Vec::new(),
            nesting: 0,
            module_line: 0,
            stdout: String::new(),
            handling: Vec::new(),
        }
    }

    /// Executes `program`, returning the value of a trailing expression
    /// statement when there is one.
    pub fn run_program(&mut self, program: &CompiledProgram) -> ExecResult<Option<Value>> {
        self.deadline = Some(Instant::now() + self.limits.timeout);
        let Some((last, init)) = program.body.split_last() else {
            return Ok(None);
        };
        for stmt in init {
            self.exec_stmt(stmt)?;
        }
        if let StmtKind::Expr(expr) = &last.kind {
            self.enter_stmt(last)?;
            let value = self.eval(expr).map_err(|e| self.annotate(e))?;
            return Ok(Some(value));
        }
        self.exec_stmt(last)?;
        Ok(None)
    }

    /// Returns the namespace and the captured output.
    pub fn finish(self) -> (Namespace, String) {
        (self.ns, self.stdout)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn fs(&self) -> &SandboxFs {
        &self.ctx.fs
    }

    pub fn host(&self) -> Option<Arc<dyn ToolHost>> {
        self.ctx.host.clone()
    }

    pub fn write_stdout(&mut self, text: &str) {
        guards::append_capped(&mut self.stdout, text);
    }

    /// Pushes the deadline back by time the sandbox spent blocked on the host.
    pub fn extend_deadline(&mut self, by: Duration) {
        if let Some(deadline) = self.deadline.as_mut() {
            *deadline += by;
        }
    }

    /// Counts one unit of work and enforces the execution limits.
    pub fn tick(&mut self) -> ExecResult<()> {
        self.ops += 1;
        if self.ops > self.limits.max_operations {
            return Err(Exception::new(
                ExcType::Timeout,
                format!(
                    "execution exceeded the limit of {} operations",
                    self.limits.max_operations
                ),
            ));
        }
        if self.ops % 256 == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    return Err(Exception::new(
                        ExcType::Timeout,
                        format!(
                            "execution timed out after {:.1}s",
                            self.limits.timeout.as_secs_f64()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolves a name as sandboxed code would see it.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(frame) = self.frames.last() {
            let declared_global = frame
                .def
                .as_ref()
                .is_some_and(|d| d.globals.iter().any(|g| g == name));
            if !declared_global {
                if let Some(value) = frame.locals.lock().get(name) {
                    return Some(value.clone());
                }
                for scope in frame.closure.iter().rev() {
                    if let Some(value) = scope.lock().get(name) {
                        return Some(value.clone());
                    }
                }
            }
        }
        self.ns.lookup(name)
    }

    fn load(&self, name: &str) -> ExecResult<Value> {
        self.lookup(name).ok_or_else(|| {
            Exception::new(ExcType::NameError, format!("name '{name}' is not defined"))
        })
    }

    fn store(&mut self, name: &str, value: Value) {
        let Some(frame) = self.frames.last() else {
            self.ns.set_local(name, value);
            return;
        };
        if let Some(def) = &frame.def {
            if def.globals.iter().any(|g| g == name) {
                self.ns.set_local(name, value);
                return;
            }
            if def.nonlocals.iter().any(|n| n == name) {
                for scope in frame.closure.iter().rev() {
                    let mut scope = scope.lock();
                    if scope.contains_key(name) {
                        scope.insert(name.to_string(), value);
                        return;
                    }
                }
            }
        }
        frame.locals.lock().insert(name.to_string(), value);
    }

    fn delete_name(&mut self, name: &str) -> ExecResult<()> {
        let removed = match self.frames.last() {
            Some(frame) => frame.locals.lock().shift_remove(name).is_some(),
            None => self.ns.remove_local(name).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(Exception::new(
                ExcType::NameError,
                format!("name '{name}' is not defined"),
            ))
        }
    }

    fn require_hook(&self, hook: GuardHook) -> ExecResult<()> {
        match self.ns.injected(hook.reserved_name()) {
            Some(Value::Hook(bound)) if *bound == hook => Ok(()),
            _ => Err(Exception::new(
                ExcType::NameError,
                format!("name '{}' is not defined", hook.reserved_name()),
            )),
        }
    }

    fn set_line(&mut self, line: usize) {
        match self.frames.last_mut() {
            Some(frame) => frame.line = line,
            None => self.module_line = line,
        }
    }

    /// Snapshots the call stack into a fresh exception.
    fn annotate(&self, mut err: Exception) -> Exception {
        if err.traceback.is_empty() {
            err.traceback.push(TraceFrame {
                function: "<module>".into(),
                line: self.module_line,
            });
            err.traceback.extend(self.frames.iter().map(|f| TraceFrame {
                function: f.name.clone(),
                line: f.line,
            }));
        }
        err
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn enter_stmt(&mut self, stmt: &Stmt) -> ExecResult<()> {
        self.set_line(stmt.line);
        self.tick().map_err(|e| self.annotate(e))
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ExecResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ExecResult<Flow> {
        self.enter_stmt(stmt)?;
        self.descend()?;
        let flow = self.exec_stmt_kind(&stmt.kind);
        self.nesting -= 1;
        flow.map_err(|e| self.annotate(e))
    }

    fn descend(&mut self) -> ExecResult<()> {
        if self.nesting >= self.limits.max_nesting() {
            return Err(Exception::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.nesting += 1;
        Ok(())
    }

    fn exec_stmt_kind(&mut self, kind: &StmtKind) -> ExecResult<Flow> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.eval(&target.to_expr())?;
                let rhs = self.eval(value)?;
                let result = guards::inplace(&format!("{}=", op.symbol()), &current, &rhs)?;
                self.assign(target, result)?;
            }
            StmtKind::AnnAssign { target, value } => {
                if let Some(value) = value {
                    let value = self.eval(value)?;
                    self.assign(target, value)?;
                }
            }
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test)?.truthy() { body } else { orelse };
                return self.exec_block(branch);
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    if !self.eval(test)?.truthy() {
                        return self.exec_block(orelse);
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    self.tick()?;
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                let items = ops::value_iter(&iterable)?;
                let mut broke = false;
                for item in items {
                    self.tick()?;
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => {
                            broke = true;
                            break;
                        }
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                if !broke {
                    return self.exec_block(orelse);
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass | StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def)?;
                self.store(&def.name, function);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody),
            StmtKind::Raise(value) => return Err(self.raise(value.as_ref())?),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let args = match msg {
                        Some(msg) => vec![self.eval(msg)?],
                        None => Vec::new(),
                    };
                    return Err(Exception::from_value(ExceptionValue {
                        kind: ExcType::AssertionError,
                        args,
                    }));
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::With { items, body } => return self.exec_with(items, body),
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let module = stdlib::import(&alias.name)?;
                    match &alias.alias {
                        Some(name) => self.store(name, module),
                        None => {
                            let top = alias.name.split('.').next().unwrap_or(&alias.name);
                            let top_module = stdlib::import(top)?;
                            self.store(top, top_module);
                        }
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let source = stdlib::import(module)?;
                for alias in names {
                    let value = stdlib::import_name(&source, module, &alias.name)?;
                    let bound = alias.alias.as_ref().unwrap_or(&alias.name);
                    self.store(bound, value);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[super::ast::ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> ExecResult<Flow> {
        let outcome = match self.exec_block(body) {
            Ok(Flow::Normal) => self.exec_block(orelse),
            Ok(flow) => Ok(flow),
            Err(err) if err.kind() == ExcType::Timeout => return Err(err),
            Err(err) => self.handle_exception(err, handlers),
        };
        if matches!(&outcome, Err(e) if e.kind() == ExcType::Timeout) || finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(finalbody)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle_exception(
        &mut self,
        err: Exception,
        handlers: &[super::ast::ExceptHandler],
    ) -> ExecResult<Flow> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(expr) => {
                    let class = self.eval(expr)?;
                    exception_matches(&class, err.kind())?
                }
            };
            if !matched {
                continue;
            }
            self.set_line(handler.line);
            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(err.value.clone()));
            }
            self.handling.push(err);
            let result = self.exec_block(&handler.body);
            self.handling.pop();
            if let Some(name) = &handler.name {
                let _ = self.delete_name(name);
            }
            return result;
        }
        Err(err)
    }

    fn raise(&mut self, value: Option<&Expr>) -> ExecResult<Exception> {
        let Some(expr) = value else {
            return self.handling.last().cloned().ok_or_else(|| {
                Exception::new(ExcType::RuntimeError, "No active exception to reraise")
            });
        };
        match self.eval(expr)? {
            Value::Exception(exc) => Ok(Exception {
                value: exc,
                traceback: Vec::new(),
            }),
            Value::Type(TypeObj::Exception(kind)) => Ok(Exception::from_value(ExceptionValue {
                kind,
                args: Vec::new(),
            })),
            _ => Err(Exception::type_error(
                "exceptions must derive from BaseException",
            )),
        }
    }

    fn exec_with(&mut self, items: &[(Expr, Option<Target>)], body: &[Stmt]) -> ExecResult<Flow> {
        let Some(((expr, target), rest)) = items.split_first() else {
            return self.exec_block(body);
        };
        let manager = self.eval(expr)?;
        let entered = stdlib::io::context_enter(&manager)?;
        if let Some(target) = target {
            if let Err(err) = self.assign(target, entered) {
                stdlib::io::context_exit(&manager);
                return Err(err);
            }
        }
        let result = self.exec_with(rest, body);
        stdlib::io::context_exit(&manager);
        result
    }

    fn assign(&mut self, target: &Target, value: Value) -> ExecResult<()> {
        match target {
            Target::Name(name) => {
                self.store(name, value);
                Ok(())
            }
            Target::Attribute(obj, attr) => {
                let obj = self.eval(obj)?;
                methods::set_attribute(&obj, attr, value)
            }
            Target::Subscript(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                ops::set_item(&obj, &index, value)
            }
            Target::Tuple { items, guard } => {
                if let Some(hook) = guard {
                    self.require_hook(*hook)?;
                }
                let star = items.iter().position(|t| matches!(t, Target::Starred(_)));
                let values = guards::unpack(&value, items.len(), star)?;
                for (item, value) in items.iter().zip(values) {
                    let item = match item {
                        Target::Starred(inner) => inner.as_ref(),
                        other => other,
                    };
                    self.assign(item, value)?;
                }
                Ok(())
            }
            Target::Starred(inner) => self.assign(inner, value),
        }
    }

    fn delete(&mut self, target: &Target) -> ExecResult<()> {
        match target {
            Target::Name(name) => self.delete_name(name),
            Target::Subscript(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                ops::del_item(&obj, &index)
            }
            Target::Attribute(obj, attr) => {
                let obj = self.eval(obj)?;
                Err(Exception::attribute_error(obj.type_name(), attr))
            }
            Target::Tuple { items, .. } => {
                for item in items {
                    self.delete(item)?;
                }
                Ok(())
            }
            Target::Starred(_) => Err(Exception::type_error("cannot delete starred")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(crate) fn eval(&mut self, expr: &Expr) -> ExecResult<Value> {
        self.descend()?;
        let value = self.eval_expr(expr);
        self.nesting -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr) -> ExecResult<Value> {
        match expr {
            Expr::Const(c) => Ok(match c {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(n) => Value::Int(*n),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
                Const::Ellipsis => Value::Ellipsis,
            }),
            Expr::FString(parts) => Ok(Value::str(self.eval_fstring(parts)?)),
            Expr::Name(name) => self.load(name),
            Expr::List(items) => Ok(Value::list(self.eval_items(items)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_items(items)?)),
            Expr::Set(items) => {
                let mut data = SetData::default();
                for item in self.eval_items(items)? {
                    data.insert(item)?;
                }
                Ok(Value::set(data))
            }
            Expr::Dict(entries) => {
                let mut data = DictData::default();
                for (key, value) in entries {
                    match key {
                        Some(key) => {
                            let key = self.eval(key)?;
                            let value = self.eval(value)?;
                            data.insert(key, value)?;
                        }
                        None => {
                            let mapping = self.eval(value)?;
                            for (k, v) in ops::mapping_items(&mapping)? {
                                data.insert(k, v)?;
                            }
                        }
                    }
                }
                Ok(Value::dict(data))
            }
            Expr::Starred(_) => Err(Exception::new(
                ExcType::RuntimeError,
                "can't use starred expression here",
            )),
            Expr::Attribute(obj, attr) => {
                let obj = self.eval(obj)?;
                guards::guarded_getattr(&obj, attr)
            }
            Expr::Subscript(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                ops::get_item(self, &obj, &index)
            }
            Expr::Slice(lower, upper, step) => {
                let mut bound = |part: &Option<Box<Expr>>| -> ExecResult<Option<i64>> {
                    match part {
                        None => Ok(None),
                        Some(expr) => match self.eval(expr)? {
                            Value::None => Ok(None),
                            v => v.as_int().map(Some).ok_or_else(|| {
                                Exception::type_error(
                                    "slice indices must be integers or None",
                                )
                            }),
                        },
                    }
                };
                let lower = bound(lower)?;
                let upper = bound(upper)?;
                let step = bound(step)?;
                Ok(Value::Slice(lower, upper, step))
            }
            Expr::Call { func, args } => {
                let func = self.eval(func)?;
                let args = self.eval_args(args)?;
                self.call(&func, args)
            }
            Expr::BinOp(left, op, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary(*op, &left, &right)
            }
            Expr::UnaryOp(UnaryOp::Not, operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::UnaryOp(op, operand) => {
                let operand = self.eval(operand)?;
                ops::unary(*op, &operand)
            }
            Expr::BoolOp(op, values) => {
                let mut last = Value::None;
                for value in values {
                    last = self.eval(value)?;
                    let short = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if short {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Compare(left, comparisons) => {
                let mut left = self.eval(left)?;
                for (op, right) in comparisons {
                    let right = self.eval(right)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Lambda(def) => self.make_function(def),
            Expr::ListComp(element, generators) => {
                let mut out = Vec::new();
                self.comprehension(generators, &mut |interp| {
                    out.push(interp.eval(element)?);
                    ops::check_len(out.len())
                })?;
                Ok(Value::list(out))
            }
            Expr::SetComp(element, generators) => {
                let mut out = SetData::default();
                self.comprehension(generators, &mut |interp| {
                    let value = interp.eval(element)?;
                    out.insert(value)
                })?;
                Ok(Value::set(out))
            }
            Expr::DictComp(key, value, generators) => {
                let mut out = DictData::default();
                self.comprehension(generators, &mut |interp| {
                    let k = interp.eval(key)?;
                    let v = interp.eval(value)?;
                    out.insert(k, v)
                })?;
                Ok(Value::dict(out))
            }
            Expr::Hook(hook, args) => {
                self.require_hook(*hook)?;
                let args = self.eval_args(args)?;
                guards::invoke(self, *hook, args)
            }
        }
    }

    fn eval_items(&mut self, items: &[Expr]) -> ExecResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Starred(inner) => {
                    let value = self.eval(inner)?;
                    out.extend(ops::collect(&value)?);
                }
                other => out.push(self.eval(other)?),
            }
        }
        Ok(out)
    }

    fn eval_args(&mut self, args: &[Arg]) -> ExecResult<Args> {
        let mut out = Args::default();
        for arg in args {
            match arg {
                Arg::Positional(expr) => out.positional.push(self.eval(expr)?),
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr)?;
                    if out.kwargs.insert(name.clone(), value).is_some() {
                        return Err(Exception::type_error(format!(
                            "keyword argument repeated: {name}"
                        )));
                    }
                }
                Arg::Star(expr) => {
                    let value = self.eval(expr)?;
                    out.positional.extend(ops::collect(&value)?);
                }
                Arg::DoubleStar(expr) => {
                    let mapping = self.eval(expr)?;
                    for (key, value) in ops::mapping_items(&mapping)? {
                        let Value::Str(key) = key else {
                            return Err(Exception::type_error("keywords must be strings"));
                        };
                        out.kwargs.insert(key.to_string(), value);
                    }
                }
            }
        }
        Ok(out)
    }

    fn eval_fstring(&mut self, parts: &[FPart]) -> ExecResult<String> {
        let mut out = String::new();
        for part in parts {
            match part {
                FPart::Literal(text) => out.push_str(text),
                FPart::Field {
                    expr,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr)?;
                    let value = match conversion {
                        Some('r') => Value::str(value.repr()),
                        Some('a') => Value::str(builtins::ascii_escape(&value.repr())),
                        Some('s') => Value::str(value.to_str()),
                        _ => value,
                    };
                    let spec = self.eval_fstring(spec)?;
                    out.push_str(&format::format_value(&value, &spec)?);
                }
            }
        }
        Ok(out)
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Interpreter) -> ExecResult<()>,
    ) -> ExecResult<()> {
        let Some(first) = generators.first() else {
            return emit(self);
        };
        let iterable = self.eval(&first.iter)?;
        let mut closure = Vec::new();
        let line = match self.frames.last() {
            Some(frame) => {
                closure.extend(frame.closure.iter().cloned());
                closure.push(frame.locals.clone());
                frame.line
            }
            None => self.module_line,
        };
        self.frames.push(Frame {
            name: "<comprehension>".into(),
            line,
            locals: Arc::new(Mutex::new(IndexMap::new())),
            closure,
            def: None,
        });
        let result = self.comprehension_level(generators, 0, Some(iterable), emit);
        self.frames.pop();
        result
    }

    fn comprehension_level(
        &mut self,
        generators: &[Comprehension],
        level: usize,
        iterable: Option<Value>,
        emit: &mut dyn FnMut(&mut Interpreter) -> ExecResult<()>,
    ) -> ExecResult<()> {
        let Some(generator) = generators.get(level) else {
            return emit(self);
        };
        let iterable = match iterable {
            Some(value) => value,
            None => self.eval(&generator.iter)?,
        };
        'items: for item in ops::value_iter(&iterable)? {
            self.tick()?;
            self.assign(&generator.target, item)?;
            for condition in &generator.ifs {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension_level(generators, level + 1, None, emit)?;
        }
        Ok(())
    }

    fn make_function(&mut self, def: &Arc<FunctionDef>) -> ExecResult<Value> {
        let mut defaults = Vec::new();
        for param in &def.params.args {
            if let Some(default) = &param.default {
                defaults.push(self.eval(default)?);
            }
        }
        let mut kw_defaults = IndexMap::new();
        for param in &def.params.kwonly {
            if let Some(default) = &param.default {
                kw_defaults.insert(param.name.clone(), self.eval(default)?);
            }
        }
        let closure = match self.frames.last() {
            Some(frame) => {
                let mut scopes = frame.closure.clone();
                scopes.push(frame.locals.clone());
                scopes
            }
            None => Vec::new(),
        };
        Ok(Value::Function(Arc::new(Function {
            def: def.clone(),
            defaults,
            kw_defaults,
            closure,
        })))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Calls any callable value.
    pub fn call(&mut self, func: &Value, args: Args) -> ExecResult<Value> {
        match func {
            Value::Function(function) => self.call_function(function, args),
            Value::Builtin(builtin) => (builtin.func)(self, args),
            Value::Method(method) => {
                let receiver = method.receiver.clone();
                methods::call_method(self, &receiver, &method.name, args)
            }
            Value::Type(class) => builtins::construct(self, *class, args),
            Value::Tool(kind) => tooling::call_tool(self, *kind, args),
            Value::Hook(hook) => guards::invoke(self, *hook, args),
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    pub fn call1(&mut self, func: &Value, arg: Value) -> ExecResult<Value> {
        self.call(func, Args::new(vec![arg]))
    }

    fn call_function(&mut self, function: &Arc<Function>, args: Args) -> ExecResult<Value> {
        if self.frames.len() >= self.limits.max_call_depth {
            return Err(Exception::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.tick()?;
        let locals = bind_arguments(function, args)?;
        let line = self.frames.last().map_or(self.module_line, |f| f.line);
        self.frames.push(Frame {
            name: function.def.name.clone(),
            line,
            locals: Arc::new(Mutex::new(locals)),
            closure: function.closure.clone(),
            def: Some(function.def.clone()),
        });
        let result = self.exec_block(&function.def.body);
        self.frames.pop();
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }
}

fn exception_matches(class: &Value, kind: ExcType) -> ExecResult<bool> {
    match class {
        Value::Type(TypeObj::Exception(expected)) => Ok(kind.is_subclass_of(*expected)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(class, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// Binds call arguments to parameter names.
fn bind_arguments(function: &Function, args: Args) -> ExecResult<IndexMap<String, Value>> {
    let def = &function.def;
    let params = &def.params;
    let name = &def.name;
    let mut locals: IndexMap<String, Value> = IndexMap::new();
    let mut positional = args.positional.into_iter();

    for param in &params.args {
        match positional.next() {
            Some(value) => {
                locals.insert(param.name.clone(), value);
            }
            None => break,
        }
    }
    let surplus: Vec<Value> = positional.collect();
    match &params.vararg {
        Some(vararg) => {
            locals.insert(vararg.clone(), Value::tuple(surplus));
        }
        None if !surplus.is_empty() => {
            let given = params.args.len() + surplus.len();
            return Err(Exception::type_error(format!(
                "{name}() takes {} positional argument{} but {given} were given",
                params.args.len(),
                if params.args.len() == 1 { "" } else { "s" }
            )));
        }
        None => {}
    }

    let mut extra = DictData::default();
    for (key, value) in args.kwargs {
        let is_positional = params.args.iter().any(|p| p.name == key);
        let is_kwonly = params.kwonly.iter().any(|p| p.name == key);
        if is_positional || is_kwonly {
            if locals.contains_key(&key) {
                return Err(Exception::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            locals.insert(key, value);
        } else if params.kwarg.is_some() {
            extra.insert_str(&key, value);
        } else {
            return Err(Exception::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
    }

    let first_default = params.args.len() - function.defaults.len();
    let mut missing = Vec::new();
    for (i, param) in params.args.iter().enumerate() {
        if locals.contains_key(&param.name) {
            continue;
        }
        if i >= first_default {
            locals.insert(param.name.clone(), function.defaults[i - first_default].clone());
        } else {
            missing.push(format!("'{}'", param.name));
        }
    }
    if !missing.is_empty() {
        return Err(Exception::type_error(format!(
            "{name}() missing {} required positional argument{}: {}",
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            join_names(&missing)
        )));
    }

    for param in &params.kwonly {
        if locals.contains_key(&param.name) {
            continue;
        }
        match function.kw_defaults.get(&param.name) {
            Some(default) => {
                locals.insert(param.name.clone(), default.clone());
            }
            None => {
                return Err(Exception::type_error(format!(
                    "{name}() missing 1 required keyword-only argument: '{}'",
                    param.name
                )))
            }
        }
    }
    if let Some(kwarg) = &params.kwarg {
        locals.insert(kwarg.clone(), Value::dict(extra));
    }
    Ok(locals)
}

fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::globals::SandboxGlobals;
    use crate::sandbox::restrict::compile_restricted;

    fn run(source: &str) -> (ExecResult<Option<Value>>, Namespace, String) {
        let limits = ExecutionLimits::default();
        run_on_sandbox_stack(&limits, || {
            let ns = SandboxGlobals::builder().build();
            let program = compile_restricted(source).unwrap();
            let mut interp = Interpreter::new(ns, ExecContext::default(), limits);
            let result = interp.run_program(&program);
            let (ns, out) = interp.finish();
            (result, ns, out)
        })
        .unwrap()
    }

    fn local(ns: &Namespace, name: &str) -> String {
        ns.lookup(name).map(|v| v.repr()).unwrap_or_default()
    }

    #[test]
    fn test_arithmetic_and_trailing_expression() {
        let (result, _, _) = run("x = 2 + 3 * 4\nx");
        assert!(matches!(result.unwrap(), Some(Value::Int(14))));
    }

    #[test]
    fn test_functions_defaults_and_kwargs() {
        let source = "def f(a, b=2, *rest, scale=1, **extra):\n    return (a + b) * scale, rest, extra\nr = f(1, scale=3)\ns = f(1, 2, 3, 4, k=5)";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "r"), "(9, (), {})");
        assert_eq!(local(&ns, "s"), "(3, (3, 4), {'k': 5})");
    }

    #[test]
    fn test_missing_argument_message() {
        let (result, _, _) = run("def f(a, b):\n    return a\nf(1)");
        let err = result.unwrap_err();
        assert_eq!(
            err.message(),
            "f() missing 1 required positional argument: 'b'"
        );
    }

    #[test]
    fn test_closures_and_nonlocal() {
        let source = "def counter():\n    n = 0\n    def inc():\n        nonlocal n\n        n += 1\n        return n\n    return inc\nc = counter()\nc()\nc()\nv = c()";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "v"), "3");
    }

    #[test]
    fn test_global_declaration_writes_module_scope() {
        let source = "total = 0\ndef add(n):\n    global total\n    total = total + n\nadd(2)\nadd(5)";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "total"), "7");
    }

    #[test]
    fn test_try_except_finally_flow() {
        let source = "log = []\ntry:\n    1 / 0\nexcept ZeroDivisionError as e:\n    log.append(str(e))\nelse:\n    log.append('else')\nfinally:\n    log.append('finally')";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "log"), "['division by zero', 'finally']");
    }

    #[test]
    fn test_bare_raise_reraises_handled_exception() {
        let source = "try:\n    try:\n        raise ValueError('inner')\n    except ValueError:\n        raise\nexcept Exception as e:\n    msg = str(e)";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "msg"), "'inner'");
    }

    #[test]
    fn test_comprehensions_and_unpacking() {
        let source = "pairs = {k: v * 2 for k, v in [('a', 1), ('b', 2)] if v > 0}\nfirst, *rest = [1, 2, 3]\nsquares = [i * i for i in range(4)]";
        let (result, ns, _) = run(source);
        result.unwrap();
        assert_eq!(local(&ns, "pairs"), "{'a': 2, 'b': 4}");
        assert_eq!(local(&ns, "rest"), "[2, 3]");
        assert_eq!(local(&ns, "squares"), "[0, 1, 4, 9]");
    }

    #[test]
    fn test_traceback_includes_function_frames() {
        let (result, _, _) = run("def boom():\n    return {}['k']\n\nboom()");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ExcType::KeyError);
        let frames: Vec<_> = err.traceback.iter().map(|f| (f.function.as_str(), f.line)).collect();
        assert_eq!(frames, vec![("<module>", 4), ("boom", 2)]);
    }

    #[test]
    fn test_infinite_loop_hits_operation_limit() {
        let ns = SandboxGlobals::builder().build();
        let program = compile_restricted("while True:\n    pass").unwrap();
        let limits = ExecutionLimits {
            max_operations: 10_000,
            ..ExecutionLimits::default()
        };
        let mut interp = Interpreter::new(ns, ExecContext::default(), limits);
        let err = interp.run_program(&program).unwrap_err();
        assert_eq!(err.kind(), ExcType::Timeout);
    }

    #[test]
    fn test_timeout_is_not_catchable() {
        let ns = SandboxGlobals::builder().build();
        let program =
            compile_restricted("try:\n    while True:\n        pass\nexcept Exception:\n    caught = True")
                .unwrap();
        let limits = ExecutionLimits {
            max_operations: 5_000,
            ..ExecutionLimits::default()
        };
        let mut interp = Interpreter::new(ns, ExecContext::default(), limits);
        assert!(interp.run_program(&program).is_err());
        let (ns, _) = interp.finish();
        assert!(ns.lookup("caught").is_none());
    }

    #[test]
    fn test_deep_recursion_is_reported() {
        let (result, _, _) = run("def f(n):\n    return f(n + 1)\nf(0)");
        assert_eq!(result.unwrap_err().kind(), ExcType::RecursionError);
    }

    #[test]
    fn test_deeply_nested_recursion_hits_nesting_limit() {
        let mut source = String::from("def f(n):\n");
        for level in 1..=50 {
            source.push_str(&format!("{}if n >= 0:\n", "    ".repeat(level)));
        }
        source.push_str(&format!("{}return f(n + 1)\nf(0)", "    ".repeat(51)));
        let (result, _, _) = run(&source);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ExcType::RecursionError);
        assert_eq!(err.message(), "maximum recursion depth exceeded");
    }

    #[test]
    fn test_print_is_captured() {
        let (result, _, out) = run("print('a', 1, sep='-')\nprint('b', end='')");
        result.unwrap();
        assert_eq!(out, "a-1\nb");
    }
}
