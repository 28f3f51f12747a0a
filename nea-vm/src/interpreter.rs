//! # Interpreter
//!
//! Tree-walking evaluator for sandbox code. It runs parsed statements
//! against a [`SandboxState`], resolving calls against the builtin
//! allow-list, the `math` module and the shared [`ToolRegistry`].
//!
//! Every statement, loop iteration, comprehension item and call goes
//! through [`Interpreter::tick`], which enforces the operation budget and
//! the wall-clock deadline. A `final_answer(...)` call unwinds the whole
//! block immediately.

use crate::ast::{BoolOp, Expr, FStringPart, Stmt, StmtKind, Target, UnaryOp};
use crate::builtins::{
    call_builtin, call_math, call_method, format_value, is_math_name, is_mutating, math_constant,
    Kwargs, MATH_FUNCTIONS,
};
use crate::error::{self, Error, Result};
use crate::sandbox::{SandboxLimits, SandboxState};
use crate::tool::ToolRegistry;
use crate::value::{
    as_num, binary_op, compare, dict_key, get_item, get_slice, int, is_truthy, iterate,
    list_position, float, repr, to_display, type_name, Num,
};
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::debug;

/// The sanctioned way for code to finish a task
pub const FINAL_ANSWER: &str = "final_answer";

/// Modules code may import
pub const ALLOWED_MODULES: &[&str] = &["math"];

/// Builtin functions available to code
pub const BUILTINS: &[&str] = &[
    "print", "len", "str", "int", "float", "bool", "list", "dict", "range", "min", "max", "sum",
    "abs", "round", "sorted", "reversed", "enumerate", "zip", "repr", "any", "all",
];

const TRUNCATION_MARKER: &str = "\n...[output truncated]\n";

/// How a block finished
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Completion {
    /// Ran to the end; value of the last expression statement
    Value(Option<Value>),
    /// `final_answer` was called
    Final(Value),
}

/// Non-local exits out of expression evaluation
enum Interrupt {
    Raise(Error),
    Final(Value),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Raise(err)
    }
}

impl Interrupt {
    /// Attach the innermost statement line to a raised error
    fn at_line(self, line: usize) -> Self {
        match self {
            Interrupt::Raise(e) if e.context_value("line").is_none() => {
                Interrupt::Raise(e.with_context("line", line.to_string()))
            }
            other => other,
        }
    }
}

type Eval<T> = std::result::Result<T, Interrupt>;

enum Flow {
    Next,
    Break,
    Continue,
}

/// Path to a mutable slot: a variable plus nested subscripts
struct Place {
    root: String,
    keys: Vec<Value>,
}

pub(crate) struct Interpreter<'a> {
    state: &'a mut SandboxState,
    tools: &'a ToolRegistry,
    limits: &'a SandboxLimits,
    deadline: Instant,
    ops: u64,
    stdout: String,
    stdout_chars: usize,
    truncated: bool,
    last: Value,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        state: &'a mut SandboxState,
        tools: &'a ToolRegistry,
        limits: &'a SandboxLimits,
        started: Instant,
    ) -> Self {
        Self {
            state,
            tools,
            limits,
            deadline: started + limits.timeout,
            ops: 0,
            stdout: String::new(),
            stdout_chars: 0,
            truncated: false,
            last: Value::Null,
        }
    }

    /// Execute a block. Bindings made before a failure are kept.
    pub(crate) fn run(&mut self, body: &[Stmt]) -> Result<Completion> {
        match self.exec_block(body) {
            Ok(_) => {
                let last = std::mem::take(&mut self.last);
                Ok(Completion::Value((!last.is_null()).then_some(last)))
            }
            Err(Interrupt::Final(v)) => Ok(Completion::Final(v)),
            Err(Interrupt::Raise(e)) => Err(e),
        }
    }

    pub(crate) fn into_stdout(self) -> String {
        self.stdout
    }

    fn tick(&mut self) -> Result<()> {
        self.ops += 1;
        if self.ops > self.limits.max_operations {
            return Err(error::forbidden(format!(
                "reached the maximum of {} operations",
                self.limits.max_operations
            )));
        }
        if Instant::now() >= self.deadline {
            return Err(Error::execution_timeout(self.limits.timeout.as_millis())
                .with_operation("sandbox::execute"));
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn exec_block(&mut self, body: &[Stmt]) -> Eval<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Eval<Flow> {
        self.tick()
            .map_err(|e| Interrupt::Raise(e).at_line(stmt.line))?;
        self.exec_kind(&stmt.kind).map_err(|i| i.at_line(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Eval<Flow> {
        match kind {
            StmtKind::Expr(expr) => {
                self.last = self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value)?;
                match target {
                    Target::Name(name) => {
                        let current = self.lookup(name)?;
                        let updated = binary_op(*op, &current, &rhs)?;
                        self.bind(name, updated)?;
                    }
                    Target::Subscript { value, index } => {
                        let place = self.place(value)?;
                        let key = self.eval(index)?;
                        let slot = self.resolve_mut(&place)?;
                        let current = get_item(slot, &key)?;
                        let updated = binary_op(*op, &current, &rhs)?;
                        set_item(slot, &key, updated)?;
                    }
                    Target::Tuple(_) => {
                        return Err(Error::new(
                            error::ErrorKind::Syntax,
                            "illegal expression for augmented assignment",
                        )
                        .into())
                    }
                }
            }
            StmtKind::If { test, body, orelse } => {
                let cond = self.eval(test)?;
                let branch = if is_truthy(&cond) { body } else { orelse };
                return self.exec_block(branch);
            }
            StmtKind::For { target, iter, body } => {
                let items = iterate(&self.eval(iter)?)?;
                for item in items {
                    self.tick()?;
                    self.assign(target, item)?;
                    if let Flow::Break = self.exec_block(body)? {
                        break;
                    }
                }
            }
            StmtKind::While { test, body } => {
                let mut iterations: u64 = 0;
                loop {
                    self.tick()?;
                    if !is_truthy(&self.eval(test)?) {
                        break;
                    }
                    iterations += 1;
                    if iterations > self.limits.max_while_iterations {
                        return Err(error::forbidden(format!(
                            "maximum number of while-loop iterations ({}) exceeded",
                            self.limits.max_while_iterations
                        ))
                        .into());
                    }
                    if let Flow::Break = self.exec_block(body)? {
                        break;
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Import { module, alias } => {
                check_module(module)?;
                let bound = alias.as_deref().unwrap_or(module);
                self.check_rebind(bound)?;
                self.state.vars.shift_remove(bound);
                self.state.imported.remove(bound);
                self.state.modules.insert(bound.to_string(), module.clone());
            }
            StmtKind::ImportFrom { module, names } => {
                check_module(module)?;
                for (name, alias) in names {
                    if !is_math_name(name) {
                        return Err(Error::new(
                            error::ErrorKind::Name,
                            format!("cannot import name '{}' from '{}'", name, module),
                        )
                        .into());
                    }
                    let bound = alias.as_deref().unwrap_or(name);
                    self.check_rebind(bound)?;
                    match math_constant(name) {
                        Some(value) => self.bind(bound, value)?,
                        None => {
                            self.state.vars.shift_remove(bound);
                            self.state.modules.remove(bound);
                            self.state
                                .imported
                                .insert(bound.to_string(), name.clone());
                        }
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Tools, builtins and `final_answer` cannot be rebound
    fn check_rebind(&self, name: &str) -> Result<()> {
        if self.tools.contains(name) {
            return Err(error::reserved_assignment(name, "tool"));
        }
        if name == FINAL_ANSWER || BUILTINS.contains(&name) {
            return Err(error::reserved_assignment(name, "builtin function"));
        }
        Ok(())
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<()> {
        self.check_rebind(name)?;
        self.state.modules.remove(name);
        self.state.imported.remove(name);
        self.state.vars.insert(name.to_string(), value);
        Ok(())
    }

    fn assign(&mut self, target: &Target, value: Value) -> Eval<()> {
        match target {
            Target::Name(name) => self.bind(name, value)?,
            Target::Subscript { value: container, index } => {
                let place = self.place(container)?;
                let key = self.eval(index)?;
                let slot = self.resolve_mut(&place)?;
                set_item(slot, &key, value)?;
            }
            Target::Tuple(targets) => {
                let items = iterate(&value)?;
                if items.len() != targets.len() {
                    let msg = if items.len() < targets.len() {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    } else {
                        format!("too many values to unpack (expected {})", targets.len())
                    };
                    return Err(error::value_error(msg).into());
                }
                for (t, item) in targets.iter().zip(items) {
                    self.assign(t, item)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve an expression to a mutable slot path, evaluating indices
    fn place(&mut self, expr: &Expr) -> Eval<Place> {
        match expr {
            Expr::Name(name) => {
                if !self.state.vars.contains_key(name) {
                    let err = self.lookup(name).err();
                    return Err(err.unwrap_or_else(|| error::name_error(name)).into());
                }
                Ok(Place {
                    root: name.clone(),
                    keys: Vec::new(),
                })
            }
            Expr::Subscript { value, index } => {
                let mut place = self.place(value)?;
                place.keys.push(self.eval(index)?);
                Ok(place)
            }
            _ => Err(error::type_error("cannot assign into a temporary value").into()),
        }
    }

    fn resolve_mut(&mut self, place: &Place) -> Result<&mut Value> {
        let mut slot = self
            .state
            .vars
            .get_mut(&place.root)
            .ok_or_else(|| error::name_error(&place.root))?;
        for key in &place.keys {
            slot = match slot {
                Value::Array(items) => {
                    let pos = list_position(items, key)?;
                    &mut items[pos]
                }
                Value::Object(map) => {
                    let k = dict_key(key)?;
                    map.get_mut(&k).ok_or_else(|| error::key_error(repr(key)))?
                }
                other => {
                    return Err(error::type_error(format!(
                        "'{}' object is not subscriptable",
                        type_name(other)
                    )))
                }
            };
        }
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(v) = self.state.vars.get(name) {
            return Ok(v.clone());
        }
        if self.state.modules.contains_key(name) {
            return Err(error::type_error(format!(
                "module '{}' cannot be used as a value; access its members as {}.name",
                name, name
            )));
        }
        if self.is_callable_name(name) {
            return Err(error::type_error(format!(
                "'{}' is a function; call it instead of using it as a value",
                name
            )));
        }
        Err(error::name_error(name))
    }

    fn is_callable_name(&self, name: &str) -> bool {
        name == FINAL_ANSWER
            || BUILTINS.contains(&name)
            || self.tools.contains(name)
            || self.state.imported.contains_key(name)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Name(name) => Ok(self.lookup(name)?),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(s) => out.push_str(s),
                        FStringPart::Field { expr, repr: as_repr, spec } => {
                            let v = self.eval(expr)?;
                            if *as_repr {
                                out.push_str(&repr(&v));
                            } else {
                                out.push_str(&format_value(&v, spec.as_deref())?);
                            }
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Expr::List(items) | Expr::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Dict(pairs) => {
                let mut map = Map::new();
                for (k, v) in pairs {
                    let key = dict_key(&self.eval(k)?)?;
                    let value = self.eval(v)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            Expr::Attribute { value, attr } => self.attribute(value, attr),
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                let key = self.eval(index)?;
                Ok(get_item(&container, &key)?)
            }
            Expr::Slice {
                value,
                lower,
                upper,
                step,
            } => {
                let container = self.eval(value)?;
                let lower = self.eval_opt(lower.as_deref())?;
                let upper = self.eval_opt(upper.as_deref())?;
                let step = self.eval_opt(step.as_deref())?;
                Ok(get_slice(
                    &container,
                    lower.as_ref(),
                    upper.as_ref(),
                    step.as_ref(),
                )?)
            }
            Expr::Call { func, args, kwargs } => self.call(func, args, kwargs),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                Ok(unary(*op, &v)?)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                Ok(binary_op(*op, &l, &r)?)
            }
            Expr::Bool { op, left, right } => {
                let l = self.eval(left)?;
                let short_circuit = match op {
                    BoolOp::And => !is_truthy(&l),
                    BoolOp::Or => is_truthy(&l),
                };
                if short_circuit {
                    Ok(l)
                } else {
                    self.eval(right)
                }
            }
            Expr::Compare { left, ops } => {
                let mut l = self.eval(left)?;
                for (op, right) in ops {
                    let r = self.eval(right)?;
                    if !compare(*op, &l, &r)? {
                        return Ok(Value::Bool(false));
                    }
                    l = r;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if is_truthy(&self.eval(test)?) {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp {
                element,
                target,
                iter,
                conds,
            } => {
                let mut out = Vec::new();
                self.comprehend(target, iter, conds, |this| {
                    out.push(this.eval(element)?);
                    Ok(())
                })?;
                Ok(Value::Array(out))
            }
            Expr::DictComp {
                key,
                value,
                target,
                iter,
                conds,
            } => {
                let mut out = Map::new();
                self.comprehend(target, iter, conds, |this| {
                    let k = dict_key(&this.eval(key)?)?;
                    let v = this.eval(value)?;
                    out.insert(k, v);
                    Ok(())
                })?;
                Ok(Value::Object(out))
            }
        }
    }

    fn eval_opt(&mut self, expr: Option<&Expr>) -> Eval<Option<Value>> {
        match expr {
            Some(e) => Ok(Some(self.eval(e)?)),
            None => Ok(None),
        }
    }

    /// Comprehension variables do not leak into the enclosing scope
    fn comprehend(
        &mut self,
        target: &Target,
        iter: &Expr,
        conds: &[Expr],
        mut emit: impl FnMut(&mut Self) -> Eval<()>,
    ) -> Eval<()> {
        let items = iterate(&self.eval(iter)?)?;
        let mut names = Vec::new();
        target.bound_names(&mut names);
        let saved: Vec<(String, Option<Value>)> = names
            .into_iter()
            .map(|n| {
                let old = self.state.vars.get(&n).cloned();
                (n, old)
            })
            .collect();

        let result = self.comprehend_items(target, items, conds, &mut emit);

        for (name, old) in saved {
            match old {
                Some(v) => {
                    self.state.vars.insert(name, v);
                }
                None => {
                    self.state.vars.shift_remove(&name);
                }
            }
        }
        result
    }

    fn comprehend_items(
        &mut self,
        target: &Target,
        items: Vec<Value>,
        conds: &[Expr],
        emit: &mut impl FnMut(&mut Self) -> Eval<()>,
    ) -> Eval<()> {
        'items: for item in items {
            self.tick()?;
            self.assign(target, item)?;
            for cond in conds {
                if !is_truthy(&self.eval(cond)?) {
                    continue 'items;
                }
            }
            emit(self)?;
        }
        Ok(())
    }

    fn module_of(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Name(name) if !self.state.vars.contains_key(name) => {
                self.state.modules.get(name).cloned()
            }
            _ => None,
        }
    }

    fn attribute(&mut self, value: &Expr, attr: &str) -> Eval<Value> {
        if let Some(module) = self.module_of(value) {
            if let Some(v) = math_constant(attr) {
                return Ok(v);
            }
            if MATH_FUNCTIONS.contains(&attr) {
                return Err(error::type_error(format!(
                    "'{}.{}' is a function; call it instead of using it as a value",
                    module, attr
                ))
                .into());
            }
            return Err(Error::new(
                error::ErrorKind::Attribute,
                format!("module '{}' has no attribute '{}'", module, attr),
            )
            .into());
        }
        let v = self.eval(value)?;
        Err(error::attribute_error(type_name(&v), attr).into())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn eval_args(&mut self, args: &[Expr], kwargs: &[(String, Expr)]) -> Eval<(Vec<Value>, Kwargs)> {
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            positional.push(self.eval(arg)?);
        }
        let mut keywords = Vec::with_capacity(kwargs.len());
        for (name, arg) in kwargs {
            keywords.push((name.clone(), self.eval(arg)?));
        }
        Ok((positional, keywords))
    }

    fn call(&mut self, func: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> Eval<Value> {
        match func {
            Expr::Name(name) if !self.state.vars.contains_key(name) => {
                let (positional, keywords) = self.eval_args(args, kwargs)?;
                self.tick()?;
                self.call_name(name, positional, keywords)
            }
            Expr::Attribute { value, attr } => {
                if let Some(module) = self.module_of(value) {
                    let (positional, keywords) = self.eval_args(args, kwargs)?;
                    self.tick()?;
                    return self.call_module(&module, attr, positional, keywords);
                }
                let (positional, keywords) = self.eval_args(args, kwargs)?;
                self.tick()?;
                if is_mutating(attr) {
                    if let Ok(place) = self.place(value) {
                        let slot = self.resolve_mut(&place)?;
                        return Ok(call_method(slot, attr, positional, keywords)?);
                    }
                }
                let mut receiver = self.eval(value)?;
                Ok(call_method(&mut receiver, attr, positional, keywords)?)
            }
            other => {
                let v = self.eval(other)?;
                Err(error::type_error(format!(
                    "'{}' object is not callable",
                    type_name(&v)
                ))
                .into())
            }
        }
    }

    fn call_name(&mut self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Eval<Value> {
        if name == FINAL_ANSWER {
            return Err(Interrupt::Final(final_answer_arg(args, kwargs)?));
        }
        if self.tools.contains(name) {
            return self.call_tool(name, args, kwargs);
        }
        if name == "print" {
            self.print(args, kwargs)?;
            return Ok(Value::Null);
        }
        if BUILTINS.contains(&name) {
            return Ok(call_builtin(name, args, kwargs)?);
        }
        if let Some(function) = self.state.imported.get(name).cloned() {
            return Ok(call_math(&function, args, kwargs)?);
        }
        Err(error::name_error(name).into())
    }

    fn call_module(&mut self, module: &str, attr: &str, args: Vec<Value>, kwargs: Kwargs) -> Eval<Value> {
        match module {
            "math" => Ok(call_math(attr, args, kwargs)?),
            other => Err(error::forbidden_import(other, ALLOWED_MODULES).into()),
        }
    }

    fn call_tool(&mut self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Eval<Value> {
        let spec = self
            .tools
            .spec(name)
            .ok_or_else(|| Error::unknown_tool(name))?;
        let bound = spec.bind_args(args, kwargs)?;
        debug!(tool = name, "code called tool");
        let result = self.tools.invoke(name, &bound)?;
        Ok(result)
    }

    fn print(&mut self, args: Vec<Value>, kwargs: Kwargs) -> Result<()> {
        let mut sep = " ".to_string();
        let mut end = "\n".to_string();
        for (key, value) in kwargs {
            let text = match &value {
                Value::Null => None,
                v => Some(to_display(v)),
            };
            match key.as_str() {
                "sep" => sep = text.unwrap_or_else(|| " ".to_string()),
                "end" => end = text.unwrap_or_else(|| "\n".to_string()),
                "flush" => {}
                other => {
                    return Err(error::type_error(format!(
                        "print() got an unexpected keyword argument '{}'",
                        other
                    )))
                }
            }
        }
        let mut line = args
            .iter()
            .map(to_display)
            .collect::<Vec<_>>()
            .join(&sep);
        line.push_str(&end);
        self.write_stdout(&line);
        Ok(())
    }

    /// Append to captured stdout, stopping at the configured budget
    fn write_stdout(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = self.limits.max_output_chars.saturating_sub(self.stdout_chars);
        let len = text.chars().count();
        if len <= room {
            self.stdout.push_str(text);
            self.stdout_chars += len;
        } else {
            self.stdout.extend(text.chars().take(room));
            self.stdout.push_str(TRUNCATION_MARKER);
            self.stdout_chars += room;
            self.truncated = true;
        }
    }
}

fn check_module(module: &str) -> Result<()> {
    if ALLOWED_MODULES.contains(&module) {
        Ok(())
    } else {
        Err(error::forbidden_import(module, ALLOWED_MODULES))
    }
}

fn final_answer_arg(mut args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let mut kwargs = kwargs.into_iter();
    match (args.len(), kwargs.next(), kwargs.next()) {
        (1, None, _) => Ok(args.remove(0)),
        (0, Some((key, value)), None) if key == "answer" => Ok(value),
        _ => Err(Error::invalid_argument(
            FINAL_ANSWER,
            "final_answer() takes exactly one argument 'answer'",
        )),
    }
}

fn unary(op: UnaryOp, v: &Value) -> Result<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!is_truthy(v)));
    }
    let symbol = if op == UnaryOp::Neg { "-" } else { "+" };
    match (op, as_num(v)) {
        (UnaryOp::Neg, Some(Num::Int(i))) => i
            .checked_neg()
            .map(int)
            .ok_or_else(|| error::overflow("integer overflow in unary '-'")),
        (UnaryOp::Neg, Some(Num::Float(f))) => float(-f),
        (_, Some(Num::Int(i))) => Ok(int(i)),
        (_, Some(Num::Float(f))) => float(f),
        _ => Err(error::type_error(format!(
            "bad operand type for unary {}: '{}'",
            symbol,
            type_name(v)
        ))),
    }
}

fn set_item(slot: &mut Value, key: &Value, value: Value) -> Result<()> {
    match slot {
        Value::Array(items) => {
            let pos = list_position(items, key)
                .map_err(|_| error::index_error("list assignment index out of range"))?;
            items[pos] = value;
            Ok(())
        }
        Value::Object(map) => {
            map.insert(dict_key(key)?, value);
            Ok(())
        }
        other => Err(error::type_error(format!(
            "'{}' object does not support item assignment",
            type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::parser::parse;
    use crate::tool::{tool_fn, ParamSpec, ParamType, ToolSpec};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with(
                ToolSpec::new("add", "Add two numbers")
                    .param(ParamSpec::required("a", ParamType::Number, "left"))
                    .param(ParamSpec::required("b", ParamType::Number, "right")),
                tool_fn(|args| {
                    let a = args["a"].as_f64().unwrap_or(0.0);
                    let b = args["b"].as_f64().unwrap_or(0.0);
                    Ok(json!(a + b))
                }),
            )
            .unwrap()
    }

    fn run_with(
        code: &str,
        state: &mut SandboxState,
        limits: &SandboxLimits,
    ) -> (Result<Completion>, String) {
        let tools = registry();
        let body = parse(code).unwrap();
        let mut interp = Interpreter::new(state, &tools, limits, Instant::now());
        let result = interp.run(&body);
        (result, interp.into_stdout())
    }

    fn run(code: &str) -> (Result<Completion>, String) {
        run_with(code, &mut SandboxState::new(), &SandboxLimits::default())
    }

    #[test]
    fn test_final_answer_stops_execution() {
        let (result, stdout) = run("result = 2+3; final_answer(result)\nprint('never')");
        assert_eq!(result.unwrap(), Completion::Final(json!(5)));
        assert_eq!(stdout, "");
    }

    #[test]
    fn test_last_expression_value() {
        let (result, stdout) = run("x = [1, 2, 3]\nprint(len(x))\nsum(x) * 2");
        assert_eq!(result.unwrap(), Completion::Value(Some(json!(12))));
        assert_eq!(stdout, "3\n");
    }

    #[test]
    fn test_control_flow() {
        let code = "
total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    if i > 7:
        break
    total += i
n = 0
while n < 3:
    n += 1
print(total, n)
";
        let (result, stdout) = run(code);
        assert!(result.is_ok());
        assert_eq!(stdout, "16 3\n");
    }

    #[test]
    fn test_nested_mutation_through_methods_and_subscripts() {
        let code = "
data = {'items': [], 'count': 0}
for word in 'a b c'.split():
    data['items'].append(word.upper())
    data['count'] += 1
data['items'][0] = 'z'
print(data)
";
        let (result, stdout) = run(code);
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(stdout, "{'items': ['z', 'B', 'C'], 'count': 3}\n");
    }

    #[test]
    fn test_tool_calls_positional_and_keyword() {
        let (result, _) = run("final_answer(add(1, b=2.5))");
        assert_eq!(result.unwrap(), Completion::Final(json!(3.5)));

        let (result, _) = run("add(1)");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rebinding_reserved_names_is_forbidden() {
        for code in ["add = 3", "print = 1", "final_answer = None", "for len in [1]:\n    pass"] {
            let (result, _) = run(code);
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Forbidden, "{code}");
        }
    }

    #[test]
    fn test_errors_keep_earlier_bindings() {
        let mut state = SandboxState::new();
        let (result, _) = run_with("a = 1\nb = a / 0\nc = 3", &mut state, &SandboxLimits::default());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ZeroDivision);
        assert_eq!(err.context_value("line"), Some("2"));
        assert_eq!(state.get("a"), Some(&json!(1)));
        assert_eq!(state.get("c"), None);
    }

    #[test]
    fn test_math_module() {
        let (result, _) = run("import math\nfrom math import sqrt as root, pi\nround(root(16) + math.floor(pi), 1)");
        assert_eq!(result.unwrap(), Completion::Value(Some(json!(7.0))));

        let (result, _) = run("import os");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_fstrings_and_comprehensions() {
        let code = "
squares = {str(n): n * n for n in range(4) if n}
names = [k for k in squares]
f\"{len(names)} keys, last={squares['3']:>3}, repr={names[0]!r}\"
";
        let (result, _) = run(code);
        assert_eq!(
            result.unwrap(),
            Completion::Value(Some(json!("3 keys, last=  9, repr='1'")))
        );
    }

    #[test]
    fn test_comprehension_variable_does_not_leak() {
        let mut state = SandboxState::new();
        let (result, _) = run_with("x = 'kept'\ny = [x for x in range(3)]", &mut state, &SandboxLimits::default());
        assert!(result.is_ok());
        assert_eq!(state.get("x"), Some(&json!("kept")));
    }

    #[test]
    fn test_operation_and_loop_limits() {
        let limits = SandboxLimits::default().with_max_while_iterations(10);
        let (result, _) = run_with("while True:\n    pass", &mut SandboxState::new(), &limits);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Forbidden);

        let limits = SandboxLimits::default().with_max_operations(50);
        let (result, _) = run_with("for i in range(100):\n    x = i", &mut SandboxState::new(), &limits);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_deadline() {
        let limits = SandboxLimits::default()
            .with_timeout(Duration::from_millis(20))
            .with_max_while_iterations(u64::MAX)
            .with_max_operations(u64::MAX);
        let (result, _) = run_with("n = 0\nwhile True:\n    n += 1", &mut SandboxState::new(), &limits);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ExecutionTimeout);
    }

    #[test]
    fn test_stdout_truncation() {
        let limits = SandboxLimits::default().with_max_output_chars(10);
        let (_, stdout) = run_with("for i in range(50):\n    print('abcdef')", &mut SandboxState::new(), &limits);
        assert!(stdout.starts_with("abcdef\nabc"));
        assert!(stdout.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_tuple_unpacking() {
        let (result, _) = run("a, b = 1, 2\na, b = b, a\n[a, b]");
        assert_eq!(result.unwrap(), Completion::Value(Some(json!([2, 1]))));

        let (result, _) = run("a, b = [1]");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Value);
    }
}
