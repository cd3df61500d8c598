//! Allowlist-based code validator.
//!
//! Parses the snippet into a Python AST and walks it node by node against an
//! allowlist: any construct not explicitly recognized is rejected by default.
//! This is the opposite polarity of a banned-pattern scan: new language
//! features are unsafe until someone decides otherwise.
//!
//! All capability is delivered as pre-bound names (`store`, `ctx`, `plan`,
//! `make_response`); nothing is importable, so the set of importable modules
//! is empty by construction. Direct calls may only target the fixed builtin
//! whitelist; method calls pass here syntactically and are gated again by the
//! interpreter's method tables at runtime.
//!
//! Rejection is total: one disallowed node anywhere fails the whole snippet.

use rustpython_parser::{ast, parse, Mode};

use crate::error::SandboxError;

/// Builtins a snippet may call by name.
pub const SAFE_BUILTINS: &[&str] = &[
    "len", "str", "int", "float", "bool", "list", "dict", "set", "tuple", "min", "max", "sum",
    "abs", "round", "sorted", "range", "enumerate", "zip", "isinstance",
];

/// Capability names that are callable.
const CAPABILITY_CALLS: &[&str] = &["make_response"];

/// Exception types a snippet may raise and catch. Narrow by design: catching
/// anything broader would let a snippet swallow harness faults.
pub const NARROW_EXCEPTIONS: &[&str] = &["ValueError", "TypeError", "KeyError", "IndexError"];

const BROAD_EXCEPTIONS: &[&str] = &["Exception", "BaseException"];

/// Parse and validate a snippet, returning the statement list for execution.
///
/// Errors are [`SandboxError::SyntaxError`] for unparseable text and
/// [`SandboxError::UnsafeCode`] naming the offending construct otherwise.
pub fn validate(code: &str) -> Result<Vec<ast::Stmt>, SandboxError> {
    let module = parse(code, Mode::Module, "<plan>").map_err(|e| SandboxError::SyntaxError {
        message: e.to_string(),
    })?;
    let ast::Mod::Module(module) = module else {
        return Err(SandboxError::SyntaxError {
            message: "expected a module body".into(),
        });
    };

    let mut walker = Walker { violation: None };
    walker.block(&module.body);
    match walker.violation {
        Some(construct) => Err(SandboxError::UnsafeCode { construct }),
        None => Ok(module.body),
    }
}

/// Recursive walker; records the first violation and short-circuits.
struct Walker {
    violation: Option<String>,
}

impl Walker {
    fn reject(&mut self, construct: impl Into<String>) {
        if self.violation.is_none() {
            self.violation = Some(construct.into());
        }
    }

    fn done(&self) -> bool {
        self.violation.is_some()
    }

    fn ident(&mut self, id: &ast::Identifier) {
        if id.as_str().starts_with("__") {
            self.reject(format!("dunder identifier `{}`", id.as_str()));
        }
    }

    fn block(&mut self, stmts: &[ast::Stmt]) {
        for stmt in stmts {
            if self.done() {
                return;
            }
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &ast::Stmt) {
        if self.done() {
            return;
        }
        match stmt {
            ast::Stmt::Assign(s) => {
                for target in &s.targets {
                    self.target(target);
                }
                self.expr(&s.value);
            }
            ast::Stmt::AugAssign(s) => {
                self.target(&s.target);
                self.expr(&s.value);
            }
            ast::Stmt::Expr(s) => self.expr(&s.value),
            ast::Stmt::If(s) => {
                self.expr(&s.test);
                self.block(&s.body);
                self.block(&s.orelse);
            }
            ast::Stmt::While(s) => {
                if !s.orelse.is_empty() {
                    self.reject("while-else clause");
                    return;
                }
                self.expr(&s.test);
                self.block(&s.body);
            }
            ast::Stmt::For(s) => {
                if !s.orelse.is_empty() {
                    self.reject("for-else clause");
                    return;
                }
                self.target(&s.target);
                self.expr(&s.iter);
                self.block(&s.body);
            }
            ast::Stmt::Break(_) | ast::Stmt::Continue(_) | ast::Stmt::Pass(_) => {}
            ast::Stmt::Raise(s) => self.raise_stmt(s),
            ast::Stmt::Try(s) => self.try_stmt(s),
            ast::Stmt::Import(_) | ast::Stmt::ImportFrom(_) => self.reject("import statement"),
            ast::Stmt::Global(_) => self.reject("global declaration"),
            ast::Stmt::Nonlocal(_) => self.reject("nonlocal declaration"),
            ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_) => {
                self.reject("function definition")
            }
            ast::Stmt::ClassDef(_) => self.reject("class definition"),
            ast::Stmt::With(_) | ast::Stmt::AsyncWith(_) => self.reject("with statement"),
            ast::Stmt::AsyncFor(_) => self.reject("async for statement"),
            ast::Stmt::Delete(_) => self.reject("del statement"),
            ast::Stmt::Assert(_) => self.reject("assert statement"),
            ast::Stmt::Return(_) => self.reject("return outside function"),
            ast::Stmt::Match(_) => self.reject("match statement"),
            ast::Stmt::TryStar(_) => self.reject("except* handler"),
            ast::Stmt::AnnAssign(_) => self.reject("annotated assignment"),
            _ => self.reject("unsupported statement"),
        }
    }

    /// Assignment targets: plain names, name tuples, subscripts of allowed
    /// expressions, attributes of allowed expressions.
    fn target(&mut self, target: &ast::Expr) {
        if self.done() {
            return;
        }
        match target {
            ast::Expr::Name(n) => self.ident(&n.id),
            ast::Expr::Tuple(t) => {
                for element in &t.elts {
                    match element {
                        ast::Expr::Name(n) => self.ident(&n.id),
                        _ => {
                            self.reject("unsupported assignment target");
                            return;
                        }
                    }
                }
            }
            ast::Expr::Subscript(s) => {
                self.expr(&s.value);
                self.expr(&s.slice);
            }
            ast::Expr::Attribute(a) => {
                self.ident(&a.attr);
                self.expr(&a.value);
            }
            ast::Expr::Starred(_) => self.reject("starred assignment target"),
            _ => self.reject("unsupported assignment target"),
        }
    }

    /// `raise` may only construct one of the narrow whitelisted exceptions.
    fn raise_stmt(&mut self, s: &ast::StmtRaise) {
        if s.cause.is_some() {
            self.reject("raise-from clause");
            return;
        }
        match s.exc.as_deref() {
            Some(ast::Expr::Call(call)) => {
                match call.func.as_ref() {
                    ast::Expr::Name(n) if NARROW_EXCEPTIONS.contains(&n.id.as_str()) => {}
                    _ => {
                        self.reject("raise of a non-whitelisted exception");
                        return;
                    }
                }
                if !call.keywords.is_empty() {
                    self.reject("keyword arguments in raise");
                    return;
                }
                for arg in &call.args {
                    self.expr(arg);
                }
            }
            Some(ast::Expr::Name(n)) if NARROW_EXCEPTIONS.contains(&n.id.as_str()) => {}
            Some(_) => self.reject("raise of a non-whitelisted exception"),
            None => self.reject("bare raise"),
        }
    }

    /// Handlers must name narrow exception types; never a catch-all.
    fn try_stmt(&mut self, s: &ast::StmtTry) {
        self.block(&s.body);
        for handler in &s.handlers {
            if self.done() {
                return;
            }
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            match handler.type_.as_deref() {
                None => {
                    self.reject("bare except handler");
                    return;
                }
                Some(type_) => self.exception_name(type_),
            }
            if let Some(name) = &handler.name {
                self.ident(name);
            }
            self.block(&handler.body);
        }
        self.block(&s.orelse);
        self.block(&s.finalbody);
    }

    fn exception_name(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(n) => {
                let name = n.id.as_str();
                if BROAD_EXCEPTIONS.contains(&name) {
                    self.reject(format!("broad exception handler `{name}`"));
                } else if !NARROW_EXCEPTIONS.contains(&name) {
                    self.reject(format!("unknown exception type `{name}`"));
                }
            }
            ast::Expr::Tuple(t) => {
                for element in &t.elts {
                    self.exception_name(element);
                    if self.done() {
                        return;
                    }
                }
            }
            _ => self.reject("computed exception type"),
        }
    }

    fn expr(&mut self, expr: &ast::Expr) {
        if self.done() {
            return;
        }
        match expr {
            ast::Expr::Constant(c) => match &c.value {
                ast::Constant::Bytes(_) => self.reject("bytes literal"),
                ast::Constant::Complex { .. } => self.reject("complex literal"),
                ast::Constant::Ellipsis => self.reject("ellipsis literal"),
                _ => {}
            },
            ast::Expr::Name(n) => self.ident(&n.id),
            ast::Expr::BinOp(b) => {
                self.expr(&b.left);
                self.expr(&b.right);
            }
            ast::Expr::UnaryOp(u) => self.expr(&u.operand),
            ast::Expr::BoolOp(b) => {
                for value in &b.values {
                    self.expr(value);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::Compare(c) => {
                self.expr(&c.left);
                for comparator in &c.comparators {
                    self.expr(comparator);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::IfExp(x) => {
                self.expr(&x.test);
                self.expr(&x.body);
                self.expr(&x.orelse);
            }
            ast::Expr::Dict(d) => {
                for key in &d.keys {
                    match key {
                        Some(key) => self.expr(key),
                        None => {
                            self.reject("dict unpacking");
                            return;
                        }
                    }
                }
                for value in &d.values {
                    self.expr(value);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::List(l) => {
                for element in &l.elts {
                    self.expr(element);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::Tuple(t) => {
                for element in &t.elts {
                    self.expr(element);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::Set(s) => {
                for element in &s.elts {
                    self.expr(element);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::ListComp(c) => {
                self.expr(&c.elt);
                self.generators(&c.generators);
            }
            ast::Expr::SetComp(c) => {
                self.expr(&c.elt);
                self.generators(&c.generators);
            }
            ast::Expr::GeneratorExp(c) => {
                self.expr(&c.elt);
                self.generators(&c.generators);
            }
            ast::Expr::DictComp(c) => {
                self.expr(&c.key);
                self.expr(&c.value);
                self.generators(&c.generators);
            }
            ast::Expr::Call(c) => self.call(c),
            ast::Expr::Subscript(s) => {
                self.expr(&s.value);
                self.expr(&s.slice);
            }
            ast::Expr::Slice(s) => {
                if s.step.is_some() {
                    self.reject("slice step");
                    return;
                }
                if let Some(lower) = &s.lower {
                    self.expr(lower);
                }
                if let Some(upper) = &s.upper {
                    self.expr(upper);
                }
            }
            ast::Expr::Attribute(a) => {
                self.ident(&a.attr);
                self.expr(&a.value);
            }
            ast::Expr::JoinedStr(j) => {
                for value in &j.values {
                    self.expr(value);
                    if self.done() {
                        return;
                    }
                }
            }
            ast::Expr::FormattedValue(f) => {
                if f.format_spec.is_some() {
                    self.reject("format specifier in f-string");
                    return;
                }
                self.expr(&f.value);
            }
            ast::Expr::Lambda(_) => self.reject("lambda expression"),
            ast::Expr::Await(_) => self.reject("await expression"),
            ast::Expr::Yield(_) | ast::Expr::YieldFrom(_) => self.reject("yield expression"),
            ast::Expr::NamedExpr(_) => self.reject("walrus assignment"),
            ast::Expr::Starred(_) => self.reject("starred expression"),
            _ => self.reject("unsupported expression"),
        }
    }

    /// Direct calls may only target whitelisted names. Method calls are
    /// allowed syntactically; the interpreter's method tables decide at
    /// runtime. Aliasing a builtin and calling the alias is rejected here.
    fn call(&mut self, call: &ast::ExprCall) {
        match call.func.as_ref() {
            ast::Expr::Name(n) => {
                let name = n.id.as_str();
                if !SAFE_BUILTINS.contains(&name) && !CAPABILITY_CALLS.contains(&name) {
                    self.reject(format!("call to unapproved name `{name}`"));
                    return;
                }
            }
            ast::Expr::Attribute(a) => {
                self.ident(&a.attr);
                self.expr(&a.value);
            }
            _ => {
                self.reject("call of a computed target");
                return;
            }
        }
        for arg in &call.args {
            if matches!(arg, ast::Expr::Starred(_)) {
                self.reject("starred call argument");
                return;
            }
            self.expr(arg);
            if self.done() {
                return;
            }
        }
        for keyword in &call.keywords {
            match &keyword.arg {
                Some(id) => self.ident(id),
                None => {
                    self.reject("keyword splat argument");
                    return;
                }
            }
            self.expr(&keyword.value);
            if self.done() {
                return;
            }
        }
    }

    fn generators(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            if self.done() {
                return;
            }
            if generator.is_async {
                self.reject("async comprehension");
                return;
            }
            self.target(&generator.target);
            self.expr(&generator.iter);
            for condition in &generator.ifs {
                self.expr(condition);
                if self.done() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejects(code: &str, needle: &str) {
        match validate(code) {
            Err(SandboxError::UnsafeCode { construct }) => {
                assert!(
                    construct.contains(needle),
                    "expected `{needle}` in violation, got `{construct}`"
                );
            }
            Err(other) => panic!("expected UnsafeCode for {code:?}, got {other}"),
            Ok(_) => panic!("expected rejection for {code:?}"),
        }
    }

    // --- rejection cases ---

    #[test]
    fn rejects_import() {
        rejects("import os\nREPLY = make_response(200)", "import");
        rejects("from os import path", "import");
    }

    #[test]
    fn rejects_lambda() {
        rejects("f = lambda x: x", "lambda");
    }

    #[test]
    fn rejects_bare_except() {
        rejects(
            "try:\n    x = 1\nexcept:\n    x = 2",
            "bare except",
        );
    }

    #[test]
    fn rejects_broad_except() {
        rejects(
            "try:\n    x = 1\nexcept Exception:\n    x = 2",
            "broad exception handler",
        );
        rejects(
            "try:\n    x = 1\nexcept BaseException:\n    x = 2",
            "broad exception handler",
        );
    }

    #[test]
    fn rejects_def_and_class() {
        rejects("def f():\n    pass", "function definition");
        rejects("class C:\n    pass", "class definition");
    }

    #[test]
    fn rejects_with_global_nonlocal_del() {
        rejects("with open('x') as f:\n    pass", "with statement");
        rejects("global x", "global");
        rejects("del x", "del");
    }

    #[test]
    fn rejects_dynamic_evaluation_by_name() {
        rejects("eval('1+1')", "call to unapproved name `eval`");
        rejects("exec('x = 1')", "call to unapproved name `exec`");
        rejects("compile('x', 'f', 'exec')", "call to unapproved name `compile`");
        rejects("__import__('os')", "dunder");
    }

    #[test]
    fn rejects_filesystem_and_introspection_names() {
        rejects("f = open('/etc/passwd')", "call to unapproved name `open`");
        rejects("g = globals()", "call to unapproved name `globals`");
        rejects("a = getattr(store, 'insert')", "call to unapproved name `getattr`");
    }

    #[test]
    fn rejects_dunder_attributes_anywhere() {
        rejects("x = ().__class__", "dunder");
        rejects("x = store.__dict__", "dunder");
        rejects("x = __builtins__", "dunder");
    }

    #[test]
    fn rejects_aliased_builtin_call() {
        rejects("f = sorted\nx = f([3, 1, 2])", "call to unapproved name `f`");
    }

    #[test]
    fn rejects_raise_of_unknown_exception() {
        rejects("raise RuntimeError('x')", "non-whitelisted exception");
        rejects("raise", "bare raise");
    }

    #[test]
    fn rejects_one_bad_node_in_otherwise_safe_code() {
        let code = "x = 1\ny = x + 2\nimport os\nREPLY = make_response(200, {\"y\": y})";
        rejects(code, "import");
    }

    #[test]
    fn rejects_walrus_starred_and_splats() {
        rejects("if (n := 10):\n    pass", "walrus");
        rejects("x = [*a]", "starred");
        rejects("x = len(*args)", "starred call argument");
        rejects("x = dict(**kwargs)", "keyword splat");
    }

    #[test]
    fn rejects_unparseable_code_as_syntax_error() {
        assert!(matches!(
            validate("this is not python ==="),
            Err(SandboxError::SyntaxError { .. })
        ));
    }

    // --- accepted cases ---

    #[test]
    fn accepts_the_create_idiom() {
        let code = r#"
body = ctx.get("body_json")
if not isinstance(body, dict):
    raise ValueError("Expected JSON object body")
record = store.insert(dict(body))
location = "/members/" + str(record["id"])
headers = {"Content-Type": "application/json", "Location": location}
REPLY = make_response(201, record, headers=headers)
"#;
        assert!(validate(code).is_ok());
    }

    #[test]
    fn accepts_loops_comprehensions_and_narrow_except() {
        let code = r#"
total = 0
names = []
for item in store.search({"kind": "x"}):
    total = total + 1
    names.append(item.get("name"))
evens = [n for n in range(10) if n % 2 == 0]
try:
    count = int(ctx.get("query").get("limit")[-1])
except ValueError:
    count = 10
REPLY = make_response(200, {"total": total, "names": names, "evens": evens, "count": count})
"#;
        assert!(validate(code).is_ok());
    }

    #[test]
    fn accepts_fstrings_and_slices() {
        let code = r#"
name = "world"
greeting = f"hello {name}"
tail = greeting[1:]
REPLY = make_response(200, {"greeting": greeting, "tail": tail})
"#;
        assert!(validate(code).is_ok());
    }

    #[test]
    fn accepts_tuple_unpacking_from_store_list() {
        let code = r#"
items, total = store.list(limit=10, offset=0, sort="name")
REPLY = make_response(200, {"items": items, "page": {"total": total}})
"#;
        assert!(validate(code).is_ok());
    }

    #[test]
    fn method_calls_pass_the_syntactic_gate() {
        // Unknown methods are a runtime error, not a validation error; the
        // validator only guarantees no ambient name can be called.
        assert!(validate("x = ctx.get('q')\nREPLY = make_response(200, x)").is_ok());
    }
}
