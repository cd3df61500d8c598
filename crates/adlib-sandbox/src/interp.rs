//! Tree-walking interpreter for the allowlisted snippet subset.
//!
//! Runs the statements returned by [`crate::ast_check::validate`] against an
//! environment holding exactly four pre-bound names: `store`, `ctx`, `plan`,
//! and `make_response`. Builtins resolve through a fixed table at call time,
//! never through the environment, so nothing a snippet assigns can shadow its
//! way into extra authority.
//!
//! There are no user-defined functions and no recursion in the executed
//! language, so termination is governed by two counters: a wall-clock
//! deadline checked on every statement and iteration, and a total
//! loop-iteration budget shared by loops, comprehensions, and `range`
//! materialization.

use std::collections::HashMap;
use std::time::Instant;

use adlib_store::{CollectionStore, StoreError};
use rustpython_parser::ast;
use serde_json::Value as Json;

use crate::value::{
    compare_values, contains_value, dict_get, dict_set, range_len, values_equal, Capability,
    TypeTag, Value,
};

/// Replication cap for `"x" * n` and `[0] * n`, keeping a single expression
/// from allocating unboundedly inside one budget tick.
const MAX_REPLICATION: usize = 100_000;

/// The narrow exception kinds snippets may raise and catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    /// `ValueError`
    ValueError,
    /// `TypeError`
    TypeError,
    /// `KeyError`
    KeyError,
    /// `IndexError`
    IndexError,
}

impl ExcKind {
    /// Resolve the Python-side name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ValueError" => Some(Self::ValueError),
            "TypeError" => Some(Self::TypeError),
            "KeyError" => Some(Self::KeyError),
            "IndexError" => Some(Self::IndexError),
            _ => None,
        }
    }

    /// The Python-side name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ValueError => "ValueError",
            Self::TypeError => "TypeError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
        }
    }
}

/// Errors surfacing from snippet execution.
#[derive(Debug)]
pub enum ExecError {
    /// The wall-clock deadline passed.
    Timeout,
    /// The total iteration budget ran out.
    IterationBudget,
    /// A narrow exception was raised; catchable by matching `except` clauses.
    Raised {
        /// The exception kind.
        kind: ExcKind,
        /// The exception message.
        message: String,
    },
    /// An uncatchable runtime fault (unknown name, bad operand types, ...).
    Fault(String),
    /// The durable store failed underneath the snippet. Never catchable.
    Storage(StoreError),
}

impl ExecError {
    fn raised(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::Raised {
            kind,
            message: message.into(),
        }
    }

    fn type_error(message: impl Into<String>) -> Self {
        Self::raised(ExcKind::TypeError, message)
    }

    fn value_error(message: impl Into<String>) -> Self {
        Self::raised(ExcKind::ValueError, message)
    }

    fn key_error(message: impl Into<String>) -> Self {
        Self::raised(ExcKind::KeyError, message)
    }

    fn index_error(message: impl Into<String>) -> Self {
        Self::raised(ExcKind::IndexError, message)
    }

    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRecord | StoreError::DuplicateId { .. } => {
                Self::value_error(err.to_string())
            }
            other => Self::Storage(other),
        }
    }

    /// Render for diagnostics, in the familiar `Kind: message` shape.
    pub fn render(&self) -> String {
        match self {
            Self::Timeout => "execution deadline exceeded".to_string(),
            Self::IterationBudget => "iteration budget exhausted".to_string(),
            Self::Raised { kind, message } => {
                if message.is_empty() {
                    kind.name().to_string()
                } else {
                    format!("{}: {}", kind.name(), message)
                }
            }
            Self::Fault(message) => message.clone(),
            Self::Storage(err) => err.to_string(),
        }
    }
}

/// Loop control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Methods that mutate their receiver in place. These take the
/// resolve-a-slot path so `items.append(x)` updates the bound variable.
const MUTATING_METHODS: &[&str] = &[
    "append",
    "extend",
    "insert",
    "pop",
    "remove",
    "clear",
    "reverse",
    "sort",
    "update",
    "setdefault",
    "add",
    "discard",
];

/// One snippet execution's interpreter state. Allocated fresh per invocation
/// and never shared.
pub struct Interp<'a> {
    env: HashMap<String, Value>,
    store: &'a CollectionStore,
    deadline: Instant,
    iterations_left: u64,
}

impl<'a> Interp<'a> {
    /// Build an interpreter with the four capability bindings.
    pub fn new(
        store: &'a CollectionStore,
        ctx: &Json,
        plan: &Json,
        deadline: Instant,
        max_iterations: u64,
    ) -> Self {
        let mut env = HashMap::new();
        env.insert("store".to_string(), Value::Capability(Capability::Store));
        env.insert(
            "make_response".to_string(),
            Value::Capability(Capability::MakeResponse),
        );
        env.insert("ctx".to_string(), Value::from_json(ctx));
        env.insert("plan".to_string(), Value::from_json(plan));
        Self {
            env,
            store,
            deadline,
            iterations_left: max_iterations,
        }
    }

    /// Execute the module body to completion.
    pub fn run(&mut self, body: &[ast::Stmt]) -> Result<(), ExecError> {
        match self.exec_block(body)? {
            Flow::Normal => Ok(()),
            _ => Err(ExecError::Fault("break or continue outside a loop".into())),
        }
    }

    /// Remove and return the snippet's bound reply variable, if any.
    pub fn take_reply(&mut self) -> Option<Value> {
        self.env.remove("REPLY")
    }

    // --- budgets ---

    fn tick(&self) -> Result<(), ExecError> {
        if Instant::now() >= self.deadline {
            Err(ExecError::Timeout)
        } else {
            Ok(())
        }
    }

    fn spend_iteration(&mut self) -> Result<(), ExecError> {
        self.tick()?;
        if self.iterations_left == 0 {
            return Err(ExecError::IterationBudget);
        }
        self.iterations_left -= 1;
        Ok(())
    }

    // --- statements ---

    fn exec_block(&mut self, stmts: &[ast::Stmt]) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &ast::Stmt) -> Result<Flow, ExecError> {
        self.tick()?;
        match stmt {
            ast::Stmt::Assign(s) => {
                let value = self.eval(&s.value)?;
                for target in &s.targets {
                    self.assign_target(target, value.clone())?;
                }
                Ok(Flow::Normal)
            }
            ast::Stmt::AugAssign(s) => {
                let current = self.eval(&s.target)?;
                let operand = self.eval(&s.value)?;
                let combined = binop(&s.op, current, operand)?;
                self.assign_target(&s.target, combined)?;
                Ok(Flow::Normal)
            }
            ast::Stmt::Expr(s) => {
                self.eval(&s.value)?;
                Ok(Flow::Normal)
            }
            ast::Stmt::If(s) => {
                if self.eval(&s.test)?.truthy() {
                    self.exec_block(&s.body)
                } else {
                    self.exec_block(&s.orelse)
                }
            }
            ast::Stmt::While(s) => {
                loop {
                    self.spend_iteration()?;
                    if !self.eval(&s.test)?.truthy() {
                        break;
                    }
                    match self.exec_block(&s.body)? {
                        Flow::Break => break,
                        _ => continue,
                    }
                }
                Ok(Flow::Normal)
            }
            ast::Stmt::For(s) => {
                let iterable = self.eval(&s.iter)?;
                self.iterate(iterable, &mut |interp, item| {
                    interp.assign_target(&s.target, item)?;
                    interp.exec_block(&s.body)
                })?;
                Ok(Flow::Normal)
            }
            ast::Stmt::Break(_) => Ok(Flow::Break),
            ast::Stmt::Continue(_) => Ok(Flow::Continue),
            ast::Stmt::Pass(_) => Ok(Flow::Normal),
            ast::Stmt::Raise(s) => Err(self.eval_raise(s)),
            ast::Stmt::Try(s) => self.exec_try(s),
            other => Err(ExecError::Fault(format!(
                "unsupported statement reached execution: {other:?}"
            ))),
        }
    }

    fn eval_raise(&mut self, s: &ast::StmtRaise) -> ExecError {
        let Some(exc) = s.exc.as_deref() else {
            return ExecError::Fault("bare raise reached execution".into());
        };
        match exc {
            ast::Expr::Call(call) => {
                let kind = match call.func.as_ref() {
                    ast::Expr::Name(n) => ExcKind::from_name(n.id.as_str()),
                    _ => None,
                };
                let Some(kind) = kind else {
                    return ExecError::Fault("raise of unknown exception".into());
                };
                let message = match call.args.first() {
                    Some(arg) => match self.eval(arg) {
                        Ok(v) => v.py_str(),
                        Err(e) => return e,
                    },
                    None => String::new(),
                };
                ExecError::raised(kind, message)
            }
            ast::Expr::Name(n) => match ExcKind::from_name(n.id.as_str()) {
                Some(kind) => ExecError::Raised {
                    kind,
                    message: String::new(),
                },
                None => ExecError::Fault("raise of unknown exception".into()),
            },
            _ => ExecError::Fault("raise of unknown exception".into()),
        }
    }

    fn exec_try(&mut self, s: &ast::StmtTry) -> Result<Flow, ExecError> {
        let outcome = self.exec_try_body(s);
        let finally = self.exec_block(&s.finalbody);
        match (outcome, finally) {
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
            (Ok(flow), Ok(Flow::Normal)) => Ok(flow),
            (Ok(_), Ok(finally_flow)) => Ok(finally_flow),
        }
    }

    fn exec_try_body(&mut self, s: &ast::StmtTry) -> Result<Flow, ExecError> {
        match self.exec_block(&s.body) {
            Ok(flow) => {
                if matches!(flow, Flow::Normal) && !s.orelse.is_empty() {
                    self.exec_block(&s.orelse)
                } else {
                    Ok(flow)
                }
            }
            Err(ExecError::Raised { kind, message }) => {
                for handler in &s.handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    if handler_matches(handler.type_.as_deref(), kind) {
                        if let Some(name) = &handler.name {
                            self.env
                                .insert(name.to_string(), Value::Str(message.clone()));
                        }
                        return self.exec_block(&handler.body);
                    }
                }
                Err(ExecError::Raised { kind, message })
            }
            Err(other) => Err(other),
        }
    }

    // --- assignment ---

    fn assign_target(&mut self, target: &ast::Expr, value: Value) -> Result<(), ExecError> {
        match target {
            ast::Expr::Name(n) => {
                self.env.insert(n.id.to_string(), value);
                Ok(())
            }
            ast::Expr::Tuple(t) => {
                let items = match value {
                    Value::Tuple(items) | Value::List(items) => items,
                    other => {
                        return Err(ExecError::type_error(format!(
                            "cannot unpack {}",
                            other.type_name()
                        )))
                    }
                };
                if items.len() != t.elts.len() {
                    return Err(ExecError::value_error(format!(
                        "expected {} values to unpack, got {}",
                        t.elts.len(),
                        items.len()
                    )));
                }
                for (element, item) in t.elts.iter().zip(items) {
                    self.assign_target(element, item)?;
                }
                Ok(())
            }
            ast::Expr::Subscript(s) => self.assign_subscript(s, value),
            ast::Expr::Attribute(_) => Err(ExecError::Fault(
                "attribute assignment is not supported".into(),
            )),
            _ => Err(ExecError::Fault("unsupported assignment target".into())),
        }
    }

    fn assign_subscript(
        &mut self,
        sub: &ast::ExprSubscript,
        value: Value,
    ) -> Result<(), ExecError> {
        let Some((root, index_exprs)) = subscript_path(&sub.value) else {
            return Err(ExecError::Fault(
                "subscript assignment requires a named container".into(),
            ));
        };
        let mut keys = Vec::with_capacity(index_exprs.len() + 1);
        for expr in index_exprs {
            keys.push(self.eval(expr)?);
        }
        let last_key = self.eval(&sub.slice)?;
        let root = root.to_string();
        let slot = self.resolve_slot(&root, &keys)?;
        match slot {
            Value::Dict(pairs) => {
                dict_set(pairs, last_key, value);
                Ok(())
            }
            Value::List(items) => {
                let index = list_index(&last_key, items.len())?;
                items[index] = value;
                Ok(())
            }
            other => Err(ExecError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn resolve_slot(&mut self, root: &str, keys: &[Value]) -> Result<&mut Value, ExecError> {
        let mut slot = self
            .env
            .get_mut(root)
            .ok_or_else(|| name_error(root))?;
        for key in keys {
            slot = descend_mut(slot, key)?;
        }
        Ok(slot)
    }

    // --- iteration ---

    fn iterate(
        &mut self,
        iterable: Value,
        f: &mut dyn FnMut(&mut Self, Value) -> Result<Flow, ExecError>,
    ) -> Result<(), ExecError> {
        match iterable {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                for item in items {
                    self.spend_iteration()?;
                    if let Flow::Break = f(self, item)? {
                        return Ok(());
                    }
                }
                Ok(())
            }
            Value::Str(s) => {
                for ch in s.chars() {
                    self.spend_iteration()?;
                    if let Flow::Break = f(self, Value::Str(ch.to_string()))? {
                        return Ok(());
                    }
                }
                Ok(())
            }
            Value::Dict(pairs) => {
                for (key, _) in pairs {
                    self.spend_iteration()?;
                    if let Flow::Break = f(self, key)? {
                        return Ok(());
                    }
                }
                Ok(())
            }
            Value::Range(start, stop, step) => {
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    self.spend_iteration()?;
                    if let Flow::Break = f(self, Value::Int(i))? {
                        return Ok(());
                    }
                    i += step;
                }
                Ok(())
            }
            other => Err(ExecError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    fn collect_iter(&mut self, iterable: Value) -> Result<Vec<Value>, ExecError> {
        let mut out = Vec::new();
        self.iterate(iterable, &mut |_, item| {
            out.push(item);
            Ok(Flow::Normal)
        })?;
        Ok(out)
    }

    // --- expressions ---

    fn eval(&mut self, expr: &ast::Expr) -> Result<Value, ExecError> {
        match expr {
            ast::Expr::Constant(c) => constant_value(&c.value),
            ast::Expr::Name(n) => self.eval_name(n.id.as_str()),
            ast::Expr::BinOp(b) => {
                let left = self.eval(&b.left)?;
                let right = self.eval(&b.right)?;
                binop(&b.op, left, right)
            }
            ast::Expr::UnaryOp(u) => {
                let operand = self.eval(&u.operand)?;
                unaryop(&u.op, operand)
            }
            ast::Expr::BoolOp(b) => {
                let mut last = Value::None;
                for (index, value_expr) in b.values.iter().enumerate() {
                    last = self.eval(value_expr)?;
                    let is_last = index == b.values.len() - 1;
                    if is_last {
                        break;
                    }
                    match b.op {
                        ast::BoolOp::And if !last.truthy() => break,
                        ast::BoolOp::Or if last.truthy() => break,
                        _ => {}
                    }
                }
                Ok(last)
            }
            ast::Expr::Compare(c) => {
                let mut left = self.eval(&c.left)?;
                for (op, comparator) in c.ops.iter().zip(&c.comparators) {
                    let right = self.eval(comparator)?;
                    if !compare_op(op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ast::Expr::IfExp(x) => {
                if self.eval(&x.test)?.truthy() {
                    self.eval(&x.body)
                } else {
                    self.eval(&x.orelse)
                }
            }
            ast::Expr::Dict(d) => {
                let mut pairs = Vec::with_capacity(d.keys.len());
                for (key, value) in d.keys.iter().zip(&d.values) {
                    let Some(key) = key else {
                        return Err(ExecError::Fault("dict unpacking reached execution".into()));
                    };
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict_set(&mut pairs, key, value);
                }
                Ok(Value::Dict(pairs))
            }
            ast::Expr::List(l) => {
                let mut items = Vec::with_capacity(l.elts.len());
                for element in &l.elts {
                    items.push(self.eval(element)?);
                }
                Ok(Value::List(items))
            }
            ast::Expr::Tuple(t) => {
                let mut items = Vec::with_capacity(t.elts.len());
                for element in &t.elts {
                    items.push(self.eval(element)?);
                }
                Ok(Value::Tuple(items))
            }
            ast::Expr::Set(s) => {
                let mut items: Vec<Value> = Vec::with_capacity(s.elts.len());
                for element in &s.elts {
                    let value = self.eval(element)?;
                    if !contains_value(&items, &value) {
                        items.push(value);
                    }
                }
                Ok(Value::Set(items))
            }
            ast::Expr::ListComp(c) => {
                let mut out = Vec::new();
                self.run_comp(&c.generators, 0, &mut |interp| {
                    out.push(interp.eval(&c.elt)?);
                    Ok(())
                })?;
                Ok(Value::List(out))
            }
            ast::Expr::SetComp(c) => {
                let mut out: Vec<Value> = Vec::new();
                self.run_comp(&c.generators, 0, &mut |interp| {
                    let value = interp.eval(&c.elt)?;
                    if !contains_value(&out, &value) {
                        out.push(value);
                    }
                    Ok(())
                })?;
                Ok(Value::Set(out))
            }
            ast::Expr::GeneratorExp(c) => {
                // Evaluated eagerly; the iteration budget bounds it like any loop.
                let mut out = Vec::new();
                self.run_comp(&c.generators, 0, &mut |interp| {
                    out.push(interp.eval(&c.elt)?);
                    Ok(())
                })?;
                Ok(Value::List(out))
            }
            ast::Expr::DictComp(c) => {
                let mut pairs = Vec::new();
                self.run_comp(&c.generators, 0, &mut |interp| {
                    let key = interp.eval(&c.key)?;
                    let value = interp.eval(&c.value)?;
                    dict_set(&mut pairs, key, value);
                    Ok(())
                })?;
                Ok(Value::Dict(pairs))
            }
            ast::Expr::Call(call) => self.eval_call(call),
            ast::Expr::Subscript(s) => {
                let recv = self.eval(&s.value)?;
                match s.slice.as_ref() {
                    ast::Expr::Slice(slice) => self.eval_slice(recv, slice),
                    index_expr => {
                        let index = self.eval(index_expr)?;
                        subscript_get(&recv, &index)
                    }
                }
            }
            ast::Expr::Attribute(a) => Err(ExecError::Fault(format!(
                "attribute `{}` is only supported in call position",
                a.attr.as_str()
            ))),
            ast::Expr::JoinedStr(j) => {
                let mut out = String::new();
                for part in &j.values {
                    match part {
                        ast::Expr::Constant(c) => match &c.value {
                            ast::Constant::Str(s) => out.push_str(s),
                            other => out.push_str(&constant_value(other)?.py_str()),
                        },
                        ast::Expr::FormattedValue(f) => {
                            let value = self.eval(&f.value)?;
                            match f.conversion {
                                ast::ConversionFlag::Repr => out.push_str(&value.py_repr()),
                                _ => out.push_str(&value.py_str()),
                            }
                        }
                        other => out.push_str(&self.eval(other)?.py_str()),
                    }
                }
                Ok(Value::Str(out))
            }
            ast::Expr::FormattedValue(f) => {
                let value = self.eval(&f.value)?;
                Ok(Value::Str(value.py_str()))
            }
            other => Err(ExecError::Fault(format!(
                "unsupported expression reached execution: {other:?}"
            ))),
        }
    }

    fn eval_name(&mut self, name: &str) -> Result<Value, ExecError> {
        if let Some(value) = self.env.get(name) {
            return Ok(value.clone());
        }
        if let Some(tag) = TypeTag::from_name(name) {
            return Ok(Value::Type(tag));
        }
        Err(name_error(name))
    }

    fn run_comp(
        &mut self,
        generators: &[ast::Comprehension],
        depth: usize,
        emit: &mut dyn FnMut(&mut Self) -> Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        if depth == generators.len() {
            return emit(self);
        }
        let generator = &generators[depth];
        let iterable = self.eval(&generator.iter)?;
        self.iterate(iterable, &mut |interp, item| {
            interp.assign_target(&generator.target, item)?;
            for condition in &generator.ifs {
                if !interp.eval(condition)?.truthy() {
                    return Ok(Flow::Normal);
                }
            }
            interp.run_comp(generators, depth + 1, emit)?;
            Ok(Flow::Normal)
        })
    }

    fn eval_slice(&mut self, recv: Value, slice: &ast::ExprSlice) -> Result<Value, ExecError> {
        let lower = match &slice.lower {
            Some(expr) => Some(as_int(&self.eval(expr)?)?),
            None => None,
        };
        let upper = match &slice.upper {
            Some(expr) => Some(as_int(&self.eval(expr)?)?),
            None => None,
        };
        match recv {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = slice_bounds(lower, upper, chars.len());
                Ok(Value::Str(chars[start..end].iter().collect()))
            }
            Value::List(items) => {
                let (start, end) = slice_bounds(lower, upper, items.len());
                Ok(Value::List(items[start..end].to_vec()))
            }
            Value::Tuple(items) => {
                let (start, end) = slice_bounds(lower, upper, items.len());
                Ok(Value::Tuple(items[start..end].to_vec()))
            }
            other => Err(ExecError::type_error(format!(
                "'{}' object is not sliceable",
                other.type_name()
            ))),
        }
    }

    // --- calls ---

    fn eval_args(
        &mut self,
        call: &ast::ExprCall,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), ExecError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval(arg)?);
        }
        let mut kwargs = Vec::with_capacity(call.keywords.len());
        for keyword in &call.keywords {
            let Some(name) = &keyword.arg else {
                return Err(ExecError::Fault("keyword splat reached execution".into()));
            };
            kwargs.push((name.to_string(), self.eval(&keyword.value)?));
        }
        Ok((args, kwargs))
    }

    fn eval_call(&mut self, call: &ast::ExprCall) -> Result<Value, ExecError> {
        match call.func.as_ref() {
            ast::Expr::Name(n) => {
                let name = n.id.as_str();
                let (args, kwargs) = self.eval_args(call)?;
                if name == "make_response" {
                    make_response(args, kwargs)
                } else {
                    self.call_builtin(name, args, kwargs)
                }
            }
            ast::Expr::Attribute(a) => {
                let method = a.attr.as_str();

                // Capability receivers dispatch to the host, never to the
                // value method tables.
                let named_capability = match a.value.as_ref() {
                    ast::Expr::Name(n) => match self.env.get(n.id.as_str()) {
                        Some(Value::Capability(cap)) => Some(*cap),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(cap) = named_capability {
                    let (args, kwargs) = self.eval_args(call)?;
                    return self.capability_call(cap, method, args, kwargs);
                }

                let (args, kwargs) = self.eval_args(call)?;

                if MUTATING_METHODS.contains(&method) {
                    if let Some((root, index_exprs)) = subscript_path(&a.value) {
                        let mut keys = Vec::with_capacity(index_exprs.len());
                        for expr in index_exprs {
                            keys.push(self.eval(expr)?);
                        }
                        let root = root.to_string();
                        let slot_capability = match self.resolve_slot(&root, &keys)? {
                            Value::Capability(cap) => Some(*cap),
                            _ => None,
                        };
                        if let Some(cap) = slot_capability {
                            return self.capability_call(cap, method, args, kwargs);
                        }
                        let slot = self.resolve_slot(&root, &keys)?;
                        return mutating_method(slot, method, args, kwargs);
                    }
                    // Receiver is a temporary; mutate a copy, Python-like in
                    // that the result would be unobservable anyway.
                    let mut recv = self.eval(&a.value)?;
                    return mutating_method(&mut recv, method, args, kwargs);
                }

                let recv = self.eval(&a.value)?;
                match recv {
                    Value::Capability(cap) => self.capability_call(cap, method, args, kwargs),
                    other => value_method(&other, method, args, kwargs),
                }
            }
            _ => Err(ExecError::Fault("call of a computed target".into())),
        }
    }

    fn capability_call(
        &mut self,
        cap: Capability,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ExecError> {
        match cap {
            Capability::Store => self.store_call(method, args, kwargs),
            Capability::MakeResponse => Err(ExecError::type_error(
                "make_response is a function, not an object",
            )),
        }
    }

    // --- the store capability ---

    fn store_call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ExecError> {
        match method {
            "insert" => {
                let record = record_arg(args.into_iter().next())?;
                let inserted = self.store.insert(record).map_err(ExecError::from_store)?;
                Ok(Value::from_json(&Json::Object(inserted)))
            }
            "get" => {
                let id = id_arg(args.into_iter().next())?;
                Ok(match self.store.get(&id) {
                    Some(record) => Value::from_json(&Json::Object(record)),
                    None => Value::None,
                })
            }
            "replace" => {
                let mut args = args.into_iter();
                let id = id_arg(args.next())?;
                let record = record_arg(args.next())?;
                let replaced = self
                    .store
                    .replace(&id, record)
                    .map_err(ExecError::from_store)?;
                Ok(match replaced {
                    Some(record) => Value::from_json(&Json::Object(record)),
                    None => Value::None,
                })
            }
            "update" => {
                let mut args = args.into_iter();
                let id = id_arg(args.next())?;
                let delta = record_arg(args.next())?;
                let updated = self
                    .store
                    .update(&id, delta)
                    .map_err(ExecError::from_store)?;
                Ok(match updated {
                    Some(record) => Value::from_json(&Json::Object(record)),
                    None => Value::None,
                })
            }
            "delete" => {
                let id = id_arg(args.into_iter().next())?;
                let deleted = self.store.delete(&id).map_err(ExecError::from_store)?;
                Ok(Value::Bool(deleted))
            }
            "list" => {
                let mut limit: Option<usize> = None;
                let mut offset: usize = 0;
                let mut sort: Option<String> = None;
                let mut positional = args.into_iter();
                let mut named: Vec<(String, Value)> = kwargs;
                if let Some(v) = positional.next() {
                    named.push(("limit".into(), v));
                }
                if let Some(v) = positional.next() {
                    named.push(("offset".into(), v));
                }
                if let Some(v) = positional.next() {
                    named.push(("sort".into(), v));
                }
                for (name, value) in named {
                    match name.as_str() {
                        "limit" => limit = opt_usize(&value)?,
                        "offset" => offset = opt_usize(&value)?.unwrap_or(0),
                        "sort" => {
                            sort = match value {
                                Value::None => None,
                                Value::Str(s) => Some(s),
                                other => {
                                    return Err(ExecError::type_error(format!(
                                        "sort must be a string, not {}",
                                        other.type_name()
                                    )))
                                }
                            }
                        }
                        other => {
                            return Err(ExecError::type_error(format!(
                                "list() got an unexpected keyword argument '{other}'"
                            )))
                        }
                    }
                }
                let (items, total) = self.store.list(limit, offset, sort.as_deref());
                let items = items
                    .into_iter()
                    .map(|record| Value::from_json(&Json::Object(record)))
                    .collect();
                Ok(Value::Tuple(vec![
                    Value::List(items),
                    Value::Int(total as i64),
                ]))
            }
            "search" => {
                let criteria = record_arg(args.into_iter().next())?;
                let hits = self.store.search(&criteria);
                Ok(Value::List(
                    hits.into_iter()
                        .map(|record| Value::from_json(&Json::Object(record)))
                        .collect(),
                ))
            }
            other => Err(ExecError::Fault(format!(
                "store has no method `{other}`"
            ))),
        }
    }

    // --- builtins ---

    fn call_builtin(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ExecError> {
        // Only sorted() takes a keyword in this subset.
        if !kwargs.is_empty() && name != "sorted" && name != "enumerate" {
            return Err(ExecError::type_error(format!(
                "{name}() takes no keyword arguments"
            )));
        }
        match name {
            "len" => {
                let value = one_arg("len", args)?;
                let length = match &value {
                    Value::Str(s) => s.chars().count() as i64,
                    Value::List(v) | Value::Tuple(v) | Value::Set(v) => v.len() as i64,
                    Value::Dict(pairs) => pairs.len() as i64,
                    Value::Range(start, stop, step) => range_len(*start, *stop, *step) as i64,
                    other => {
                        return Err(ExecError::type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(length))
            }
            "str" => Ok(match args.len() {
                0 => Value::Str(String::new()),
                _ => Value::Str(one_arg("str", args)?.py_str()),
            }),
            "int" => {
                if args.is_empty() {
                    return Ok(Value::Int(0));
                }
                match one_arg("int", args)? {
                    Value::Int(i) => Ok(Value::Int(i)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                    Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        ExecError::value_error(format!(
                            "invalid literal for int() with base 10: '{s}'"
                        ))
                    }),
                    other => Err(ExecError::type_error(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "float" => {
                if args.is_empty() {
                    return Ok(Value::Float(0.0));
                }
                match one_arg("float", args)? {
                    Value::Int(i) => Ok(Value::Float(i as f64)),
                    Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
                    Value::Float(f) => Ok(Value::Float(f)),
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        ExecError::value_error(format!("could not convert string to float: '{s}'"))
                    }),
                    other => Err(ExecError::type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "bool" => Ok(Value::Bool(match args.len() {
                0 => false,
                _ => one_arg("bool", args)?.truthy(),
            })),
            "list" => Ok(match args.len() {
                0 => Value::List(Vec::new()),
                _ => Value::List(self.collect_iter(one_arg("list", args)?)?),
            }),
            "tuple" => Ok(match args.len() {
                0 => Value::Tuple(Vec::new()),
                _ => Value::Tuple(self.collect_iter(one_arg("tuple", args)?)?),
            }),
            "set" => {
                if args.is_empty() {
                    return Ok(Value::Set(Vec::new()));
                }
                let items = self.collect_iter(one_arg("set", args)?)?;
                let mut out: Vec<Value> = Vec::new();
                for item in items {
                    if !contains_value(&out, &item) {
                        out.push(item);
                    }
                }
                Ok(Value::Set(out))
            }
            "dict" => match args.len() {
                0 => Ok(Value::Dict(Vec::new())),
                _ => match one_arg("dict", args)? {
                    Value::Dict(pairs) => Ok(Value::Dict(pairs)),
                    Value::List(items) | Value::Tuple(items) => {
                        let mut pairs = Vec::with_capacity(items.len());
                        for item in items {
                            match item {
                                Value::Tuple(kv) | Value::List(kv) if kv.len() == 2 => {
                                    let mut kv = kv.into_iter();
                                    let key = kv.next().unwrap_or(Value::None);
                                    let value = kv.next().unwrap_or(Value::None);
                                    dict_set(&mut pairs, key, value);
                                }
                                _ => {
                                    return Err(ExecError::type_error(
                                        "dict() requires key/value pairs",
                                    ))
                                }
                            }
                        }
                        Ok(Value::Dict(pairs))
                    }
                    other => Err(ExecError::type_error(format!(
                        "dict() argument must be a mapping, not '{}'",
                        other.type_name()
                    ))),
                },
            },
            "min" | "max" => {
                let items = if args.len() == 1 {
                    self.collect_iter(args.remove(0))?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(ExecError::value_error(format!("{name}() arg is empty")));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ordering = compare_values(item, &best).ok_or_else(|| {
                        ExecError::type_error(format!(
                            "'{name}' not supported between '{}' and '{}'",
                            item.type_name(),
                            best.type_name()
                        ))
                    })?;
                    let better = if name == "min" {
                        ordering == std::cmp::Ordering::Less
                    } else {
                        ordering == std::cmp::Ordering::Greater
                    };
                    if better {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "sum" => {
                let mut args = args.into_iter();
                let iterable = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("sum() expects an iterable"))?;
                let mut total = args.next().unwrap_or(Value::Int(0));
                for item in self.collect_iter(iterable)? {
                    total = binop(&ast::Operator::Add, total, item)?;
                }
                Ok(total)
            }
            "abs" => match one_arg("abs", args)? {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(ExecError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            },
            "round" => {
                let mut args = args.into_iter();
                let value = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("round() expects a number"))?;
                let digits = match args.next() {
                    Some(v) => as_int(&v)?,
                    None => 0,
                };
                match value {
                    Value::Int(i) => Ok(Value::Int(i)),
                    Value::Float(f) => {
                        let scale = 10f64.powi(digits as i32);
                        let rounded = (f * scale).round() / scale;
                        if digits <= 0 {
                            Ok(Value::Int(rounded as i64))
                        } else {
                            Ok(Value::Float(rounded))
                        }
                    }
                    other => Err(ExecError::type_error(format!(
                        "type {} doesn't define __round__",
                        other.type_name()
                    ))),
                }
            }
            "sorted" => {
                let mut reverse = false;
                for (key, value) in kwargs {
                    match key.as_str() {
                        "reverse" => reverse = value.truthy(),
                        other => {
                            return Err(ExecError::type_error(format!(
                                "sorted() got an unexpected keyword argument '{other}'"
                            )))
                        }
                    }
                }
                let mut items = self.collect_iter(one_arg("sorted", args)?)?;
                sort_values(&mut items, reverse)?;
                Ok(Value::List(items))
            }
            "range" => {
                let ints: Vec<i64> = args.iter().map(as_int).collect::<Result<_, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => {
                        return Err(ExecError::type_error(
                            "range expected 1 to 3 integer arguments",
                        ))
                    }
                };
                if step == 0 {
                    return Err(ExecError::value_error("range() arg 3 must not be zero"));
                }
                Ok(Value::Range(start, stop, step))
            }
            "enumerate" => {
                let mut start = 0i64;
                for (key, value) in kwargs {
                    match key.as_str() {
                        "start" => start = as_int(&value)?,
                        other => {
                            return Err(ExecError::type_error(format!(
                                "enumerate() got an unexpected keyword argument '{other}'"
                            )))
                        }
                    }
                }
                let mut args = args.into_iter();
                let iterable = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("enumerate() expects an iterable"))?;
                if let Some(v) = args.next() {
                    start = as_int(&v)?;
                }
                let items = self.collect_iter(iterable)?;
                Ok(Value::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| Value::Tuple(vec![Value::Int(start + i as i64), item]))
                        .collect(),
                ))
            }
            "zip" => {
                let mut columns = Vec::with_capacity(args.len());
                for arg in args {
                    columns.push(self.collect_iter(arg)?);
                }
                let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut rows = Vec::with_capacity(shortest);
                for i in 0..shortest {
                    rows.push(Value::Tuple(
                        columns.iter().map(|c| c[i].clone()).collect(),
                    ));
                }
                Ok(Value::List(rows))
            }
            "isinstance" => {
                let mut args = args.into_iter();
                let value = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("isinstance expected 2 arguments"))?;
                let types = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("isinstance expected 2 arguments"))?;
                let matched = match types {
                    Value::Type(tag) => value.is_instance(tag),
                    Value::Tuple(tags) => {
                        let mut matched = false;
                        for tag in tags {
                            match tag {
                                Value::Type(tag) => {
                                    if value.is_instance(tag) {
                                        matched = true;
                                        break;
                                    }
                                }
                                other => {
                                    return Err(ExecError::type_error(format!(
                                        "isinstance() arg 2 must be a type, not '{}'",
                                        other.type_name()
                                    )))
                                }
                            }
                        }
                        matched
                    }
                    other => {
                        return Err(ExecError::type_error(format!(
                            "isinstance() arg 2 must be a type, not '{}'",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Bool(matched))
            }
            other => Err(ExecError::Fault(format!(
                "call to unapproved name `{other}` reached execution"
            ))),
        }
    }
}

// --- free helpers ---

fn name_error(name: &str) -> ExecError {
    ExecError::Fault(format!("NameError: name '{name}' is not defined"))
}

fn handler_matches(type_: Option<&ast::Expr>, kind: ExcKind) -> bool {
    match type_ {
        Some(ast::Expr::Name(n)) => ExcKind::from_name(n.id.as_str()) == Some(kind),
        Some(ast::Expr::Tuple(t)) => t.elts.iter().any(|e| match e {
            ast::Expr::Name(n) => ExcKind::from_name(n.id.as_str()) == Some(kind),
            _ => false,
        }),
        _ => false,
    }
}

fn constant_value(constant: &ast::Constant) -> Result<Value, ExecError> {
    match constant {
        ast::Constant::None => Ok(Value::None),
        ast::Constant::Bool(b) => Ok(Value::Bool(*b)),
        ast::Constant::Str(s) => Ok(Value::Str(s.clone())),
        ast::Constant::Int(i) => i
            .to_string()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ExecError::Fault("integer literal out of range".into())),
        ast::Constant::Float(f) => Ok(Value::Float(*f)),
        ast::Constant::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(constant_value(item)?);
            }
            Ok(Value::Tuple(out))
        }
        _ => Err(ExecError::Fault("unsupported literal".into())),
    }
}

fn subscript_path(expr: &ast::Expr) -> Option<(&str, Vec<&ast::Expr>)> {
    let mut indices = Vec::new();
    let mut current = expr;
    loop {
        match current {
            ast::Expr::Name(n) => {
                indices.reverse();
                return Some((n.id.as_str(), indices));
            }
            ast::Expr::Subscript(s) => {
                indices.push(s.slice.as_ref());
                current = s.value.as_ref();
            }
            _ => return None,
        }
    }
}

fn descend_mut<'v>(value: &'v mut Value, key: &Value) -> Result<&'v mut Value, ExecError> {
    match value {
        Value::List(items) => {
            let index = list_index(key, items.len())?;
            Ok(&mut items[index])
        }
        Value::Dict(pairs) => {
            let position = pairs
                .iter()
                .position(|(k, _)| values_equal(k, key))
                .ok_or_else(|| ExecError::key_error(key.py_repr()))?;
            Ok(&mut pairs[position].1)
        }
        other => Err(ExecError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn list_index(key: &Value, len: usize) -> Result<usize, ExecError> {
    let raw = as_int(key)?;
    let index = if raw < 0 { raw + len as i64 } else { raw };
    if index < 0 || index as usize >= len {
        return Err(ExecError::index_error("list index out of range"));
    }
    Ok(index as usize)
}

fn as_int(value: &Value) -> Result<i64, ExecError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(ExecError::type_error(format!(
            "an integer is required, not '{}'",
            other.type_name()
        ))),
    }
}

fn slice_bounds(lower: Option<i64>, upper: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { i + len as i64 } else { i };
        i.clamp(0, len as i64) as usize
    };
    let start = lower.map(clamp).unwrap_or(0);
    let end = upper.map(clamp).unwrap_or(len);
    (start, end.max(start))
}

fn subscript_get(recv: &Value, index: &Value) -> Result<Value, ExecError> {
    match recv {
        Value::List(items) | Value::Tuple(items) => {
            Ok(items[list_index(index, items.len())?].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = list_index(index, chars.len())
                .map_err(|_| ExecError::index_error("string index out of range"))?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Dict(pairs) => dict_get(pairs, index)
            .cloned()
            .ok_or_else(|| ExecError::key_error(index.py_repr())),
        other => Err(ExecError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn binop(op: &ast::Operator, left: Value, right: Value) -> Result<Value, ExecError> {
    use ast::Operator;
    match op {
        Operator::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(b)
                .map(Value::Int)
                .ok_or_else(|| ExecError::Fault("integer overflow".into())),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (Value::Tuple(mut a), Value::Tuple(b)) => {
                a.extend(b);
                Ok(Value::Tuple(a))
            }
            (a, b) => numeric_binop("+", &a, &b, |x, y| x + y),
        },
        Operator::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(b)
                .map(Value::Int)
                .ok_or_else(|| ExecError::Fault("integer overflow".into())),
            (a, b) => numeric_binop("-", &a, &b, |x, y| x - y),
        },
        Operator::Mult => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_mul(b)
                .map(Value::Int)
                .ok_or_else(|| ExecError::Fault("integer overflow".into())),
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                replicate_str(&s, n)
            }
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                replicate_list(&items, n)
            }
            (a, b) => numeric_binop("*", &a, &b, |x, y| x * y),
        },
        Operator::Div => {
            let (a, b) = float_pair("/", &left, &right)?;
            if b == 0.0 {
                return Err(ExecError::Fault("division by zero".into()));
            }
            Ok(Value::Float(a / b))
        }
        Operator::FloorDiv => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    Err(ExecError::Fault("division by zero".into()))
                } else {
                    Ok(Value::Int(a.div_euclid(b)))
                }
            }
            (a, b) => {
                let (x, y) = float_pair("//", &a, &b)?;
                if y == 0.0 {
                    return Err(ExecError::Fault("division by zero".into()));
                }
                Ok(Value::Float((x / y).floor()))
            }
        },
        Operator::Mod => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    Err(ExecError::Fault("division by zero".into()))
                } else {
                    Ok(Value::Int(a.rem_euclid(b)))
                }
            }
            (a, b) => {
                let (x, y) = float_pair("%", &a, &b)?;
                if y == 0.0 {
                    return Err(ExecError::Fault("division by zero".into()));
                }
                Ok(Value::Float(x.rem_euclid(y)))
            }
        },
        Operator::Pow => match (left, right) {
            (Value::Int(a), Value::Int(b)) if b >= 0 => u32::try_from(b)
                .ok()
                .and_then(|exp| a.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(|| ExecError::Fault("integer overflow".into())),
            (a, b) => {
                let (x, y) = float_pair("**", &a, &b)?;
                Ok(Value::Float(x.powf(y)))
            }
        },
        other => Err(ExecError::Fault(format!(
            "unsupported operator: {other:?}"
        ))),
    }
}

fn numeric_binop(
    op: &str,
    a: &Value,
    b: &Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExecError> {
    let (x, y) = float_pair(op, a, b)?;
    Ok(Value::Float(f(x, y)))
}

fn float_pair(op: &str, a: &Value, b: &Value) -> Result<(f64, f64), ExecError> {
    let coerce = |v: &Value| -> Option<f64> {
        match v {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    };
    match (coerce(a), coerce(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ExecError::type_error(format!(
            "unsupported operand type(s) for {op}: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn replicate_str(s: &str, n: i64) -> Result<Value, ExecError> {
    let count = n.max(0) as usize;
    if s.len().saturating_mul(count) > MAX_REPLICATION {
        return Err(ExecError::Fault("string replication too large".into()));
    }
    Ok(Value::Str(s.repeat(count)))
}

fn replicate_list(items: &[Value], n: i64) -> Result<Value, ExecError> {
    let count = n.max(0) as usize;
    if items.len().saturating_mul(count) > MAX_REPLICATION {
        return Err(ExecError::Fault("list replication too large".into()));
    }
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend_from_slice(items);
    }
    Ok(Value::List(out))
}

fn unaryop(op: &ast::UnaryOp, operand: Value) -> Result<Value, ExecError> {
    match op {
        ast::UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        ast::UnaryOp::USub => match operand {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| ExecError::Fault("integer overflow".into())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ExecError::type_error(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        },
        ast::UnaryOp::UAdd => match operand {
            v @ (Value::Int(_) | Value::Float(_)) => Ok(v),
            other => Err(ExecError::type_error(format!(
                "bad operand type for unary +: '{}'",
                other.type_name()
            ))),
        },
        ast::UnaryOp::Invert => Err(ExecError::type_error("bitwise invert is not supported")),
    }
}

fn compare_op(op: &ast::CmpOp, left: &Value, right: &Value) -> Result<bool, ExecError> {
    use ast::CmpOp;
    let ordered = |op: &CmpOp| -> Result<bool, ExecError> {
        let ordering = compare_values(left, right).ok_or_else(|| {
            ExecError::type_error(format!(
                "comparison not supported between '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ))
        })?;
        Ok(match op {
            CmpOp::Lt => ordering == std::cmp::Ordering::Less,
            CmpOp::LtE => ordering != std::cmp::Ordering::Greater,
            CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
            CmpOp::GtE => ordering != std::cmp::Ordering::Less,
            _ => unreachable!(),
        })
    };
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::NotEq => Ok(!values_equal(left, right)),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => ordered(op),
        CmpOp::In => membership(left, right),
        CmpOp::NotIn => membership(left, right).map(|b| !b),
        // Identity only has a meaningful reading for None and bools here.
        CmpOp::Is => Ok(match (left, right) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }),
        CmpOp::IsNot => Ok(match (left, right) {
            (Value::None, Value::None) => false,
            (Value::Bool(a), Value::Bool(b)) => a != b,
            _ => true,
        }),
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExecError> {
    match haystack {
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            Ok(contains_value(items, needle))
        }
        Value::Dict(pairs) => Ok(pairs.iter().any(|(k, _)| values_equal(k, needle))),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExecError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Range(start, stop, step) => match needle {
            Value::Int(i) => {
                let in_bounds = if *step > 0 {
                    i >= start && i < stop
                } else {
                    i <= start && i > stop
                };
                Ok(in_bounds && (i - start) % step == 0)
            }
            _ => Ok(false),
        },
        other => Err(ExecError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), ExecError> {
    let mut incomparable = false;
    items.sort_by(|a, b| match compare_values(a, b) {
        Some(ordering) => {
            if reverse {
                ordering.reverse()
            } else {
                ordering
            }
        }
        None => {
            incomparable = true;
            std::cmp::Ordering::Equal
        }
    });
    if incomparable {
        return Err(ExecError::type_error(
            "comparison not supported between mixed types",
        ));
    }
    Ok(())
}

fn one_arg(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let mut args = args.into_iter();
    let first = args
        .next()
        .ok_or_else(|| ExecError::type_error(format!("{name}() expects one argument")))?;
    if args.next().is_some() {
        return Err(ExecError::type_error(format!(
            "{name}() expects one argument"
        )));
    }
    Ok(first)
}

fn record_arg(arg: Option<Value>) -> Result<serde_json::Map<String, Json>, ExecError> {
    let Some(value) = arg else {
        return Err(ExecError::type_error("store call expects a mapping"));
    };
    if !matches!(value, Value::Dict(_)) {
        return Err(ExecError::from_store(StoreError::InvalidRecord));
    }
    match value.to_json().map_err(ExecError::type_error)? {
        Json::Object(map) => Ok(map),
        _ => Err(ExecError::from_store(StoreError::InvalidRecord)),
    }
}

fn id_arg(arg: Option<Value>) -> Result<Json, ExecError> {
    let Some(value) = arg else {
        return Err(ExecError::type_error("store call expects an identifier"));
    };
    match value {
        Value::None => Ok(Json::Null),
        Value::Int(i) => Ok(Json::from(i)),
        Value::Str(s) => Ok(Json::String(s)),
        Value::Float(f) => Ok(serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null)),
        other => Err(ExecError::type_error(format!(
            "identifier must be a scalar, not '{}'",
            other.type_name()
        ))),
    }
}

fn opt_usize(value: &Value) -> Result<Option<usize>, ExecError> {
    match value {
        Value::None => Ok(None),
        other => {
            let i = as_int(other)?;
            if i < 0 {
                Ok(None)
            } else {
                Ok(Some(i as usize))
            }
        }
    }
}

/// `make_response(status, body=None, headers=None, is_json=True)`.
fn make_response(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, ExecError> {
    let mut args = args.into_iter();
    let mut status = args.next();
    let mut body = args.next();
    let mut headers = args.next();
    let mut is_json = None;
    for (name, value) in kwargs {
        match name.as_str() {
            "status" => status = Some(value),
            "body" => body = Some(value),
            "headers" => headers = Some(value),
            "is_json" => is_json = Some(value),
            other => {
                return Err(ExecError::type_error(format!(
                    "make_response() got an unexpected keyword argument '{other}'"
                )))
            }
        }
    }

    let status = match status {
        Some(Value::Int(i)) => i,
        Some(other) => {
            return Err(ExecError::type_error(format!(
                "status must be an integer, not '{}'",
                other.type_name()
            )))
        }
        None => return Err(ExecError::type_error("make_response() requires a status")),
    };
    let headers = match headers {
        None | Some(Value::None) => Value::Dict(Vec::new()),
        Some(d @ Value::Dict(_)) => d,
        Some(other) => {
            return Err(ExecError::type_error(format!(
                "headers must be a dict, not '{}'",
                other.type_name()
            )))
        }
    };
    let is_json = match is_json {
        None => Value::Bool(true),
        Some(v) => Value::Bool(v.truthy()),
    };

    Ok(Value::Dict(vec![
        (Value::Str("status".into()), Value::Int(status)),
        (Value::Str("body".into()), body.unwrap_or(Value::None)),
        (Value::Str("headers".into()), headers),
        (Value::Str("is_json".into()), is_json),
    ]))
}

// --- non-mutating value methods ---

fn value_method(
    recv: &Value,
    method: &str,
    args: Vec<Value>,
    _kwargs: Vec<(String, Value)>,
) -> Result<Value, ExecError> {
    match recv {
        Value::Dict(pairs) => dict_method(pairs, method, args),
        Value::Str(s) => str_method(s, method, args),
        Value::List(items) | Value::Tuple(items) => seq_method(items, method, args),
        other => Err(ExecError::Fault(format!(
            "'{}' object has no method `{method}`",
            other.type_name()
        ))),
    }
}

fn dict_method(
    pairs: &[(Value, Value)],
    method: &str,
    args: Vec<Value>,
) -> Result<Value, ExecError> {
    match method {
        "get" => {
            let mut args = args.into_iter();
            let key = args
                .next()
                .ok_or_else(|| ExecError::type_error("get expected at least 1 argument"))?;
            let default = args.next().unwrap_or(Value::None);
            Ok(dict_get(pairs, &key).cloned().unwrap_or(default))
        }
        "keys" => Ok(Value::List(pairs.iter().map(|(k, _)| k.clone()).collect())),
        "values" => Ok(Value::List(pairs.iter().map(|(_, v)| v.clone()).collect())),
        "items" => Ok(Value::List(
            pairs
                .iter()
                .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        other => Err(ExecError::Fault(format!(
            "'dict' object has no method `{other}`"
        ))),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let str_arg = |args: &[Value], index: usize, method: &str| -> Result<String, ExecError> {
        match args.get(index) {
            Some(Value::Str(v)) => Ok(v.clone()),
            Some(other) => Err(ExecError::type_error(format!(
                "{method}() argument must be str, not '{}'",
                other.type_name()
            ))),
            None => Err(ExecError::type_error(format!(
                "{method}() missing a required argument"
            ))),
        }
    };
    match method {
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "strip" => Ok(Value::Str(s.trim().to_string())),
        "lstrip" => Ok(Value::Str(s.trim_start().to_string())),
        "rstrip" => Ok(Value::Str(s.trim_end().to_string())),
        "startswith" => Ok(Value::Bool(s.starts_with(&str_arg(&args, 0, method)?))),
        "endswith" => Ok(Value::Bool(s.ends_with(&str_arg(&args, 0, method)?))),
        "replace" => {
            let old = str_arg(&args, 0, method)?;
            let new = str_arg(&args, 1, method)?;
            Ok(Value::Str(s.replace(&old, &new)))
        }
        "split" => {
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s
                    .split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
                Some(Value::Str(sep)) if !sep.is_empty() => s
                    .split(sep.as_str())
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
                Some(Value::Str(_)) => return Err(ExecError::value_error("empty separator")),
                Some(other) => {
                    return Err(ExecError::type_error(format!(
                        "split() argument must be str or None, not '{}'",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::List(parts))
        }
        "join" => {
            let items = match args.into_iter().next() {
                Some(Value::List(items)) | Some(Value::Tuple(items)) | Some(Value::Set(items)) => {
                    items
                }
                _ => return Err(ExecError::type_error("join() expects an iterable")),
            };
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(part) => parts.push(part),
                    other => {
                        return Err(ExecError::type_error(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Value::Str(parts.join(s)))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        other => Err(ExecError::Fault(format!(
            "'str' object has no method `{other}`"
        ))),
    }
}

fn seq_method(items: &[Value], method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match method {
        "index" => {
            let needle = args
                .into_iter()
                .next()
                .ok_or_else(|| ExecError::type_error("index expected an argument"))?;
            items
                .iter()
                .position(|v| values_equal(v, &needle))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| ExecError::value_error("value is not in list"))
        }
        "count" => {
            let needle = args
                .into_iter()
                .next()
                .ok_or_else(|| ExecError::type_error("count expected an argument"))?;
            Ok(Value::Int(
                items.iter().filter(|v| values_equal(v, &needle)).count() as i64,
            ))
        }
        other => Err(ExecError::Fault(format!(
            "'list' object has no method `{other}`"
        ))),
    }
}

// --- mutating value methods ---

fn mutating_method(
    recv: &mut Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, ExecError> {
    match recv {
        Value::List(items) => match method {
            "append" => {
                let value = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExecError::type_error("append expected an argument"))?;
                items.push(value);
                Ok(Value::None)
            }
            "extend" => {
                match args.into_iter().next() {
                    Some(Value::List(more)) | Some(Value::Tuple(more)) | Some(Value::Set(more)) => {
                        items.extend(more)
                    }
                    _ => return Err(ExecError::type_error("extend() expects an iterable")),
                }
                Ok(Value::None)
            }
            "insert" => {
                let mut args = args.into_iter();
                let index = as_int(
                    &args
                        .next()
                        .ok_or_else(|| ExecError::type_error("insert expected 2 arguments"))?,
                )?;
                let value = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("insert expected 2 arguments"))?;
                let index = index.clamp(0, items.len() as i64) as usize;
                items.insert(index, value);
                Ok(Value::None)
            }
            "pop" => {
                if items.is_empty() {
                    return Err(ExecError::index_error("pop from empty list"));
                }
                let index = match args.first() {
                    Some(v) => list_index(v, items.len())?,
                    None => items.len() - 1,
                };
                Ok(items.remove(index))
            }
            "remove" => {
                let needle = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExecError::type_error("remove expected an argument"))?;
                let position = items
                    .iter()
                    .position(|v| values_equal(v, &needle))
                    .ok_or_else(|| ExecError::value_error("list.remove(x): x not in list"))?;
                items.remove(position);
                Ok(Value::None)
            }
            "clear" => {
                items.clear();
                Ok(Value::None)
            }
            "reverse" => {
                items.reverse();
                Ok(Value::None)
            }
            "sort" => {
                let mut reverse = false;
                for (key, value) in kwargs {
                    match key.as_str() {
                        "reverse" => reverse = value.truthy(),
                        other => {
                            return Err(ExecError::type_error(format!(
                                "sort() got an unexpected keyword argument '{other}'"
                            )))
                        }
                    }
                }
                sort_values(items, reverse)?;
                Ok(Value::None)
            }
            other => Err(ExecError::Fault(format!(
                "'list' object has no method `{other}`"
            ))),
        },
        Value::Dict(pairs) => match method {
            "update" => {
                match args.into_iter().next() {
                    Some(Value::Dict(other)) => {
                        for (key, value) in other {
                            dict_set(pairs, key, value);
                        }
                    }
                    _ => return Err(ExecError::type_error("update() expects a dict")),
                }
                Ok(Value::None)
            }
            "pop" => {
                let mut args = args.into_iter();
                let key = args
                    .next()
                    .ok_or_else(|| ExecError::type_error("pop expected at least 1 argument"))?;
                let position = pairs.iter().position(|(k, _)| values_equal(k, &key));
                match position {
                    Some(position) => Ok(pairs.remove(position).1),
                    None => args
                        .next()
                        .ok_or_else(|| ExecError::key_error(key.py_repr())),
                }
            }
            "setdefault" => {
                let mut args = args.into_iter();
                let key = args.next().ok_or_else(|| {
                    ExecError::type_error("setdefault expected at least 1 argument")
                })?;
                let default = args.next().unwrap_or(Value::None);
                if let Some(existing) = dict_get(pairs, &key) {
                    Ok(existing.clone())
                } else {
                    dict_set(pairs, key, default.clone());
                    Ok(default)
                }
            }
            "clear" => {
                pairs.clear();
                Ok(Value::None)
            }
            other => Err(ExecError::Fault(format!(
                "'dict' object has no method `{other}`"
            ))),
        },
        Value::Set(items) => match method {
            "add" => {
                let value = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExecError::type_error("add expected an argument"))?;
                if !contains_value(items, &value) {
                    items.push(value);
                }
                Ok(Value::None)
            }
            "discard" => {
                let value = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExecError::type_error("discard expected an argument"))?;
                items.retain(|v| !values_equal(v, &value));
                Ok(Value::None)
            }
            "clear" => {
                items.clear();
                Ok(Value::None)
            }
            other => Err(ExecError::Fault(format!(
                "'set' object has no method `{other}`"
            ))),
        },
        other => Err(ExecError::Fault(format!(
            "'{}' object has no method `{method}`",
            other.type_name()
        ))),
    }
}
