//! Tree-walking evaluator for the policy language
//!
//! Two entry points: [`exec_module`] runs a script's top level and yields
//! the module globals (frozen by the engine afterwards), and [`call`]
//! invokes a compiled function against those globals. Each evaluation
//! carries a step budget and a call-depth limit so a misbehaving policy
//! terminates instead of wedging a worker.

use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::ast::*;
use super::value::{values_compare, values_equal, FuncDef, Value};
use crate::tree;

const MAX_STEPS: u64 = 2_000_000;
const MAX_DEPTH: usize = 64;
const MAX_RANGE: i64 = 1_000_000;

/// Runtime failure with a script backtrace
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    pub frames: Vec<FrameInfo>,
}

/// One backtrace frame: the function and the line of the active call
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function: String,
    pub line: u32,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in self.frames.iter().rev() {
            write!(f, "\n  in {} (line {})", frame.function, frame.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

/// Execute a script's top level with a pre-declared `input` binding
pub fn exec_module(script: &Script, input: &Value) -> Result<HashMap<String, Value>, EvalError> {
    let mut machine = Machine::new(input.clone());
    let empty = HashMap::new();
    let mut module = HashMap::new();
    let mut scope = Scope {
        globals: &empty,
        locals: &mut module,
        is_module: true,
    };
    for stmt in &script.stmts {
        match machine.exec_stmt(stmt, &mut scope)? {
            Flow::Normal => {}
            Flow::Return(_) => {
                return Err(machine.error("return outside a function", 0));
            }
            Flow::Break | Flow::Continue => {
                return Err(machine.error("break/continue outside a loop", 0));
            }
        }
    }
    Ok(module)
}

/// Call a compiled function against frozen module globals
pub fn call(
    globals: &HashMap<String, Value>,
    func: &Arc<FuncDef>,
    args: Vec<Value>,
    input: &Value,
) -> Result<Value, EvalError> {
    let mut machine = Machine::new(input.clone());
    machine.call_func(globals, func, args, func.line)
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Name-resolution context: the innermost assignment scope plus the
/// read-only globals behind it
struct Scope<'a> {
    globals: &'a HashMap<String, Value>,
    locals: &'a mut HashMap<String, Value>,
    /// When true, `locals` is the module map under construction
    is_module: bool,
}

struct Machine {
    input: Value,
    steps: u64,
    depth: usize,
    stack: Vec<FrameInfo>,
}

impl Machine {
    fn new(input: Value) -> Self {
        Self {
            input,
            steps: 0,
            depth: 0,
            stack: Vec::new(),
        }
    }

    fn error(&self, message: impl Into<String>, line: u32) -> EvalError {
        let message = if line > 0 {
            format!("line {line}: {}", message.into())
        } else {
            message.into()
        };
        EvalError {
            message,
            frames: self.stack.clone(),
        }
    }

    fn tick(&mut self, line: u32) -> Result<(), EvalError> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(self.error("step budget exhausted", line));
        }
        Ok(())
    }

    fn call_func(
        &mut self,
        globals: &HashMap<String, Value>,
        func: &Arc<FuncDef>,
        args: Vec<Value>,
        call_line: u32,
    ) -> Result<Value, EvalError> {
        if args.len() != func.params.len() {
            return Err(self.error(
                format!(
                    "{}() takes {} argument(s), got {}",
                    func.name,
                    func.params.len(),
                    args.len()
                ),
                call_line,
            ));
        }
        if self.depth >= MAX_DEPTH {
            return Err(self.error("maximum call depth exceeded", call_line));
        }

        self.depth += 1;
        self.stack.push(FrameInfo {
            function: func.name.clone(),
            line: call_line,
        });

        let mut locals: HashMap<String, Value> =
            func.params.iter().cloned().zip(args).collect();
        let mut scope = Scope {
            globals,
            locals: &mut locals,
            is_module: false,
        };

        let mut result = Value::None;
        let mut outcome = Ok(());
        for stmt in &func.body {
            match self.exec_stmt(stmt, &mut scope) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Return(v)) => {
                    result = v;
                    break;
                }
                Ok(Flow::Break | Flow::Continue) => {
                    outcome = Err(self.error("break/continue outside a loop", func.line));
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.stack.pop();
        self.depth -= 1;
        outcome.map(|()| result)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope<'_>) -> Result<Flow, EvalError> {
        match stmt {
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::Break { line } => {
                self.tick(*line)?;
                Ok(Flow::Break)
            }
            Stmt::Continue { line } => {
                self.tick(*line)?;
                Ok(Flow::Continue)
            }
            Stmt::Expr { expr, line } => {
                self.tick(*line)?;
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign { name, value, line } => {
                self.tick(*line)?;
                let value = self.eval(value, scope)?;
                scope.locals.insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Return { value, line } => {
                self.tick(*line)?;
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Def {
                name,
                params,
                body,
                line,
            } => {
                if !scope.is_module {
                    return Err(self.error("def is only allowed at the top level", *line));
                }
                let func = FuncDef {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                    line: *line,
                };
                scope.locals.insert(name.clone(), Value::Func(Arc::new(func)));
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches,
                orelse,
                line,
            } => {
                self.tick(*line)?;
                for (cond, block) in branches {
                    if self.eval(cond, scope)?.truth() {
                        return self.exec_block(block, scope);
                    }
                }
                self.exec_block(orelse, scope)
            }
            Stmt::For {
                var,
                iter,
                body,
                line,
            } => {
                self.tick(*line)?;
                let iterable = self.eval(iter, scope)?;
                let items = self.iter_values(&iterable, *line)?;
                for item in items {
                    scope.locals.insert(var.clone(), item);
                    match self.exec_block(body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &mut Scope<'_>) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
        self.tick(expr.line)?;
        let line = expr.line;
        match &expr.kind {
            ExprKind::NoneLit => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(x) => Ok(Value::Float(*x)),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::Name(name) => self.resolve(name, scope, line),
            ExprKind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::list(out))
            }
            ExprKind::Dict(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key, scope)? {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(self.error(
                                format!("dict keys must be strings, got {}", other.type_name()),
                                line,
                            ));
                        }
                    };
                    map.insert(key, self.eval(value, scope)?);
                }
                Ok(Value::Dict(Arc::new(map)))
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truth())),
                    UnaryOp::Neg => match v {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(x) => Ok(Value::Float(-x)),
                        other => Err(self.error(
                            format!("cannot negate {}", other.type_name()),
                            line,
                        )),
                    },
                }
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left, scope)?;
                match op {
                    BoolOp::And if !left.truth() => Ok(left),
                    BoolOp::Or if left.truth() => Ok(left),
                    _ => self.eval(right, scope),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, left, right, line)
            }
            ExprKind::Compare { left, ops } => {
                let mut prev = self.eval(left, scope)?;
                for (op, right_expr) in ops {
                    let right = self.eval(right_expr, scope)?;
                    if !self.compare(*op, &prev, &right, line)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Cond { test, body, orelse } => {
                if self.eval(test, scope)?.truth() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::Attr { object, name } => {
                let object = self.eval(object, scope)?;
                self.attr(object, name, line)
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let index = self.eval(index, scope)?;
                self.index(object, index, line)
            }
            ExprKind::Call { func, args } => {
                let callee = self.eval(func, scope)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(arg, scope)?);
                }
                self.call_value(callee, evaluated, scope, line)
            }
            ExprKind::ListComp {
                expr: elem,
                var,
                iter,
                cond,
            } => {
                let iterable = self.eval(iter, scope)?;
                let items = self.iter_values(&iterable, line)?;
                let shadowed = scope.locals.get(var).cloned();
                let mut out = Vec::new();
                for item in items {
                    scope.locals.insert(var.clone(), item);
                    if let Some(cond) = cond {
                        if !self.eval(cond, scope)?.truth() {
                            continue;
                        }
                    }
                    out.push(self.eval(elem, scope)?);
                }
                match shadowed {
                    Some(v) => {
                        scope.locals.insert(var.clone(), v);
                    }
                    None => {
                        scope.locals.remove(var);
                    }
                }
                Ok(Value::list(out))
            }
        }
    }

    fn resolve(&mut self, name: &str, scope: &Scope<'_>, line: u32) -> Result<Value, EvalError> {
        if let Some(v) = scope.locals.get(name) {
            return Ok(v.clone());
        }
        if !scope.is_module {
            if let Some(v) = scope.globals.get(name) {
                return Ok(v.clone());
            }
        }
        if name == "input" {
            return Ok(self.input.clone());
        }
        match name {
            "len" | "str" | "int" | "float" | "bool" | "type" | "range" | "any" | "all" => {
                Ok(Value::Builtin(match name {
                    "len" => "len",
                    "str" => "str",
                    "int" => "int",
                    "float" => "float",
                    "bool" => "bool",
                    "type" => "type",
                    "range" => "range",
                    "any" => "any",
                    _ => "all",
                }))
            }
            "json" | "time" | "math" | "star" => Ok(Value::Module(match name {
                "json" => "json",
                "time" => "time",
                "math" => "math",
                _ => "star",
            })),
            _ => Err(self.error(format!("name {name:?} is not defined"), line)),
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn binary(
        &self,
        op: BinOp,
        left: Value,
        right: Value,
        line: u32,
    ) -> Result<Value, EvalError> {
        use Value::*;
        match (op, &left, &right) {
            (BinOp::Add, Str(a), Str(b)) => Ok(Value::str(format!("{a}{b}"))),
            (BinOp::Add, _, _) if is_listish(&left) && is_listish(&right) => {
                let mut items = list_items(&left);
                items.extend(list_items(&right));
                Ok(Value::list(items))
            }
            (_, Int(a), Int(b)) => self.int_binary(op, *a, *b, line),
            (_, Float(_) | Int(_), Float(_) | Int(_)) => {
                let a = as_f64(&left);
                let b = as_f64(&right);
                self.float_binary(op, a, b, line)
            }
            _ => Err(self.error(
                format!(
                    "unsupported operands for {op}: {} and {}",
                    left.type_name(),
                    right.type_name()
                ),
                line,
            )),
        }
    }

    fn int_binary(&self, op: BinOp, a: i64, b: i64, line: u32) -> Result<Value, EvalError> {
        match op {
            BinOp::Add => Ok(Value::Int(a.wrapping_add(b))),
            BinOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
            BinOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
            BinOp::Div => {
                if b == 0 {
                    Err(self.error("division by zero", line))
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    Err(self.error("division by zero", line))
                } else {
                    Ok(Value::Int(a.div_euclid(b)))
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    Err(self.error("modulo by zero", line))
                } else {
                    Ok(Value::Int(a.rem_euclid(b)))
                }
            }
        }
    }

    fn float_binary(&self, op: BinOp, a: f64, b: f64, line: u32) -> Result<Value, EvalError> {
        match op {
            BinOp::Add => Ok(Value::Float(a + b)),
            BinOp::Sub => Ok(Value::Float(a - b)),
            BinOp::Mul => Ok(Value::Float(a * b)),
            BinOp::Div => {
                if b == 0.0 {
                    Err(self.error("division by zero", line))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    Err(self.error("division by zero", line))
                } else {
                    Ok(Value::Float((a / b).floor()))
                }
            }
            BinOp::Mod => {
                if b == 0.0 {
                    Err(self.error("modulo by zero", line))
                } else {
                    Ok(Value::Float(a.rem_euclid(b)))
                }
            }
        }
    }

    fn compare(
        &self,
        op: CmpOp,
        left: &Value,
        right: &Value,
        line: u32,
    ) -> Result<bool, EvalError> {
        match op {
            CmpOp::Eq => Ok(values_equal(left, right)),
            CmpOp::Ne => Ok(!values_equal(left, right)),
            CmpOp::In => self.contains(right, left, line),
            CmpOp::NotIn => Ok(!self.contains(right, left, line)?),
            ordered => {
                let ordering = values_compare(left, right).ok_or_else(|| {
                    self.error(
                        format!(
                            "cannot order {} and {}",
                            left.type_name(),
                            right.type_name()
                        ),
                        line,
                    )
                })?;
                Ok(match ordered {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                })
            }
        }
    }

    fn contains(
        &self,
        container: &Value,
        needle: &Value,
        line: u32,
    ) -> Result<bool, EvalError> {
        match container {
            Value::Str(s) => match needle {
                Value::Str(sub) => Ok(s.contains(sub.as_ref())),
                other => Err(self.error(
                    format!("cannot search for {} in a string", other.type_name()),
                    line,
                )),
            },
            Value::List(items) => Ok(items.iter().any(|v| values_equal(v, needle))),
            Value::Dict(map) => match needle {
                Value::Str(k) => Ok(map.contains_key(k.as_ref())),
                _ => Ok(false),
            },
            Value::Json(j) => match j.as_ref() {
                Json::Array(items) => Ok(items
                    .iter()
                    .any(|v| values_equal(&Value::from_json(v), needle))),
                Json::Object(map) => match needle {
                    Value::Str(k) => Ok(map.contains_key(k.as_ref())),
                    _ => Ok(false),
                },
                _ => Err(self.error("value is not a container", line)),
            },
            other => Err(self.error(
                format!("{} is not a container", other.type_name()),
                line,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Attribute and index access
    // ------------------------------------------------------------------

    fn attr(&self, object: Value, name: &str, line: u32) -> Result<Value, EvalError> {
        match &object {
            Value::Module(module) => self.module_attr(module, name, line),
            Value::Str(_) => match name {
                "startswith" | "endswith" | "lower" | "upper" | "strip" | "split"
                | "replace" => Ok(Value::Method(
                    Box::new(object.clone()),
                    string_method_name(name),
                )),
                _ => Err(self.error(format!("string has no attribute {name:?}"), line)),
            },
            Value::Dict(map) => {
                if let Some(v) = map.get(name) {
                    return Ok(v.clone());
                }
                self.mapping_method(object.clone(), name, line)
            }
            Value::Json(j) => match j.as_ref() {
                Json::Object(map) => {
                    if let Some(v) = map.get(name) {
                        return Ok(Value::from_json(v));
                    }
                    self.mapping_method(object.clone(), name, line)
                }
                _ => Err(self.error(
                    format!("{} has no attribute {name:?}", object.type_name()),
                    line,
                )),
            },
            other => Err(self.error(
                format!("{} has no attribute {name:?}", other.type_name()),
                line,
            )),
        }
    }

    fn mapping_method(&self, object: Value, name: &str, line: u32) -> Result<Value, EvalError> {
        match name {
            "get" | "keys" | "values" | "items" => Ok(Value::Method(
                Box::new(object),
                mapping_method_name(name),
            )),
            _ => Err(self.error(format!("mapping has no attribute {name:?}"), line)),
        }
    }

    fn module_attr(&self, module: &str, name: &str, line: u32) -> Result<Value, EvalError> {
        let qualified = match (module, name) {
            ("json", "encode") => "json.encode",
            ("json", "decode") => "json.decode",
            ("time", "now") => "time.now",
            ("math", "floor") => "math.floor",
            ("math", "ceil") => "math.ceil",
            ("math", "sqrt") => "math.sqrt",
            ("math", "pow") => "math.pow",
            ("star", "getinput") => "star.getinput",
            ("star", "getbody") => "star.getbody",
            _ => {
                return Err(self.error(
                    format!("module {module} has no attribute {name:?}"),
                    line,
                ));
            }
        };
        Ok(Value::Builtin(qualified))
    }

    fn index(&self, object: Value, index: Value, line: u32) -> Result<Value, EvalError> {
        match (&object, &index) {
            (Value::List(items), Value::Int(i)) => {
                let idx = normalize_index(*i, items.len()).ok_or_else(|| {
                    self.error(format!("list index {i} out of range"), line)
                })?;
                Ok(items[idx].clone())
            }
            (Value::Json(j), Value::Int(i)) => match j.as_ref() {
                Json::Array(items) => {
                    let idx = normalize_index(*i, items.len()).ok_or_else(|| {
                        self.error(format!("list index {i} out of range"), line)
                    })?;
                    Ok(Value::from_json(&items[idx]))
                }
                _ => Err(self.error("value is not indexable by int", line)),
            },
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(*i, chars.len()).ok_or_else(|| {
                    self.error(format!("string index {i} out of range"), line)
                })?;
                Ok(Value::str(chars[idx].to_string()))
            }
            (Value::Dict(map), Value::Str(k)) => map.get(k.as_ref()).cloned().ok_or_else(|| {
                self.error(format!("key {k:?} not found"), line)
            }),
            (Value::Json(j), Value::Str(k)) => match j.as_ref() {
                Json::Object(map) => map
                    .get(k.as_ref())
                    .map(Value::from_json)
                    .ok_or_else(|| self.error(format!("key {k:?} not found"), line)),
                _ => Err(self.error("value is not indexable by key", line)),
            },
            _ => Err(self.error(
                format!(
                    "cannot index {} with {}",
                    object.type_name(),
                    index.type_name()
                ),
                line,
            )),
        }
    }

    fn iter_values(&self, value: &Value, line: u32) -> Result<Vec<Value>, EvalError> {
        match value {
            Value::List(items) => Ok(items.as_ref().clone()),
            Value::Dict(map) => Ok(map.keys().map(Value::str).collect()),
            Value::Json(j) => match j.as_ref() {
                Json::Array(items) => Ok(items.iter().map(Value::from_json).collect()),
                Json::Object(map) => Ok(map.keys().map(Value::str).collect()),
                _ => Err(self.error("value is not iterable", line)),
            },
            other => Err(self.error(
                format!("{} is not iterable", other.type_name()),
                line,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        scope: &mut Scope<'_>,
        line: u32,
    ) -> Result<Value, EvalError> {
        match callee {
            Value::Func(func) => {
                let globals: &HashMap<String, Value> = if scope.is_module {
                    scope.locals
                } else {
                    scope.globals
                };
                self.call_func(globals, &func, args, line)
            }
            Value::Builtin(name) => self.builtin(name, args, line),
            Value::Method(receiver, name) => self.method(*receiver, name, args, line),
            other => Err(self.error(
                format!("{} is not callable", other.type_name()),
                line,
            )),
        }
    }

    fn builtin(&self, name: &str, args: Vec<Value>, line: u32) -> Result<Value, EvalError> {
        let arity = |n: usize| -> Result<(), EvalError> {
            if args.len() != n {
                Err(self.error(
                    format!("{name}() takes {n} argument(s), got {}", args.len()),
                    line,
                ))
            } else {
                Ok(())
            }
        };

        match name {
            "len" => {
                arity(1)?;
                args[0].len().map(|n| Value::Int(n as i64)).ok_or_else(|| {
                    self.error(format!("{} has no length", args[0].type_name()), line)
                })
            }
            "str" => {
                arity(1)?;
                Ok(Value::str(args[0].to_string()))
            }
            "int" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(n) => Ok(Value::Int(*n)),
                    Value::Float(x) => Ok(Value::Int(*x as i64)),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        self.error(format!("cannot convert {s:?} to int"), line)
                    }),
                    other => Err(self.error(
                        format!("cannot convert {} to int", other.type_name()),
                        line,
                    )),
                }
            }
            "float" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(n) => Ok(Value::Float(*n as f64)),
                    Value::Float(x) => Ok(Value::Float(*x)),
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        self.error(format!("cannot convert {s:?} to float"), line)
                    }),
                    other => Err(self.error(
                        format!("cannot convert {} to float", other.type_name()),
                        line,
                    )),
                }
            }
            "bool" => {
                arity(1)?;
                Ok(Value::Bool(args[0].truth()))
            }
            "type" => {
                arity(1)?;
                Ok(Value::str(args[0].type_name()))
            }
            "range" => self.builtin_range(args, line),
            "any" => {
                arity(1)?;
                let items = self.iter_values(&args[0], line)?;
                Ok(Value::Bool(items.iter().any(Value::truth)))
            }
            "all" => {
                arity(1)?;
                let items = self.iter_values(&args[0], line)?;
                Ok(Value::Bool(items.iter().all(Value::truth)))
            }
            "json.encode" => {
                arity(1)?;
                let json = args[0].to_json().ok_or_else(|| {
                    self.error(
                        format!("{} cannot be encoded as JSON", args[0].type_name()),
                        line,
                    )
                })?;
                Ok(Value::str(json.to_string()))
            }
            "json.decode" => {
                arity(1)?;
                let Value::Str(s) = &args[0] else {
                    return Err(self.error("json.decode() takes a string", line));
                };
                let parsed: Json = serde_json::from_str(s)
                    .map_err(|e| self.error(format!("invalid JSON: {e}"), line))?;
                Ok(Value::from_json_owned(parsed))
            }
            "time.now" => {
                arity(0)?;
                Ok(Value::Int(chrono::Utc::now().timestamp()))
            }
            "math.floor" => {
                arity(1)?;
                Ok(Value::Int(self.number(&args[0], line)?.floor() as i64))
            }
            "math.ceil" => {
                arity(1)?;
                Ok(Value::Int(self.number(&args[0], line)?.ceil() as i64))
            }
            "math.sqrt" => {
                arity(1)?;
                Ok(Value::Float(self.number(&args[0], line)?.sqrt()))
            }
            "math.pow" => {
                arity(2)?;
                let base = self.number(&args[0], line)?;
                let exp = self.number(&args[1], line)?;
                Ok(Value::Float(base.powf(exp)))
            }
            "star.getinput" => {
                arity(1)?;
                let Value::Str(path) = &args[0] else {
                    return Err(self.error("star.getinput() takes a string path", line));
                };
                self.input_path(path, line)
            }
            "star.getbody" => {
                arity(0)?;
                self.input_path("tmf", line)
            }
            other => Err(self.error(format!("unknown builtin {other:?}"), line)),
        }
    }

    fn builtin_range(&self, args: Vec<Value>, line: u32) -> Result<Value, EvalError> {
        let as_int = |v: &Value| -> Result<i64, EvalError> {
            match v {
                Value::Int(n) => Ok(*n),
                other => Err(self.error(
                    format!("range() takes ints, got {}", other.type_name()),
                    line,
                )),
            }
        };
        let (start, stop, step) = match args.len() {
            1 => (0, as_int(&args[0])?, 1),
            2 => (as_int(&args[0])?, as_int(&args[1])?, 1),
            3 => (as_int(&args[0])?, as_int(&args[1])?, as_int(&args[2])?),
            n => {
                return Err(self.error(format!("range() takes 1 to 3 arguments, got {n}"), line));
            }
        };
        if step == 0 {
            return Err(self.error("range() step cannot be zero", line));
        }
        let span = if step > 0 {
            (stop - start).max(0) / step + i64::from((stop - start).max(0) % step != 0)
        } else {
            (start - stop).max(0) / -step + i64::from((start - stop).max(0) % -step != 0)
        };
        if span > MAX_RANGE {
            return Err(self.error("range() is too large", line));
        }
        let mut items = Vec::with_capacity(span as usize);
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            items.push(Value::Int(i));
            i += step;
        }
        Ok(Value::list(items))
    }

    fn method(
        &self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<Value, EvalError> {
        match name {
            "str.startswith" | "str.endswith" | "str.lower" | "str.upper" | "str.strip"
            | "str.split" | "str.replace" => self.string_method(receiver, name, args, line),
            "dict.get" | "dict.keys" | "dict.values" | "dict.items" => {
                self.dict_method(receiver, name, args, line)
            }
            other => Err(self.error(format!("unknown method {other:?}"), line)),
        }
    }

    fn string_method(
        &self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<Value, EvalError> {
        let Value::Str(s) = receiver else {
            return Err(self.error("string method on a non-string", line));
        };
        let str_arg = |i: usize| -> Result<&str, EvalError> {
            match args.get(i) {
                Some(Value::Str(v)) => Ok(v.as_ref()),
                _ => Err(self.error(format!("{name}() takes string arguments"), line)),
            }
        };
        match name {
            "str.startswith" => Ok(Value::Bool(s.starts_with(str_arg(0)?))),
            "str.endswith" => Ok(Value::Bool(s.ends_with(str_arg(0)?))),
            "str.lower" => Ok(Value::str(s.to_lowercase())),
            "str.upper" => Ok(Value::str(s.to_uppercase())),
            "str.strip" => Ok(Value::str(s.trim())),
            "str.split" => {
                let parts: Vec<Value> = if args.is_empty() {
                    s.split_whitespace().map(Value::str).collect()
                } else {
                    s.split(str_arg(0)?).map(Value::str).collect()
                };
                Ok(Value::list(parts))
            }
            "str.replace" => Ok(Value::str(s.replace(str_arg(0)?, str_arg(1)?))),
            _ => unreachable!(),
        }
    }

    fn dict_method(
        &self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<Value, EvalError> {
        // Normalize both native dicts and wrapped objects to (key, value) pairs.
        let pairs: Vec<(String, Value)> = match &receiver {
            Value::Dict(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Json(j) => match j.as_ref() {
                Json::Object(map) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
                _ => return Err(self.error("mapping method on a non-mapping", line)),
            },
            _ => return Err(self.error("mapping method on a non-mapping", line)),
        };

        match name {
            "dict.get" => {
                let key = match args.first() {
                    Some(Value::Str(k)) => k.to_string(),
                    _ => return Err(self.error("get() takes a string key", line)),
                };
                let default = args.get(1).cloned().unwrap_or(Value::None);
                Ok(pairs
                    .into_iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v)
                    .unwrap_or(default))
            }
            "dict.keys" => Ok(Value::list(
                pairs.into_iter().map(|(k, _)| Value::str(k)).collect(),
            )),
            "dict.values" => Ok(Value::list(pairs.into_iter().map(|(_, v)| v).collect())),
            "dict.items" => Ok(Value::list(
                pairs
                    .into_iter()
                    .map(|(k, v)| Value::list(vec![Value::str(k), v]))
                    .collect(),
            )),
            _ => unreachable!(),
        }
    }

    fn number(&self, v: &Value, line: u32) -> Result<f64, EvalError> {
        match v {
            Value::Int(n) => Ok(*n as f64),
            Value::Float(x) => Ok(*x),
            other => Err(self.error(
                format!("expected a number, got {}", other.type_name()),
                line,
            )),
        }
    }

    /// Dotted-path lookup into the active input tree
    fn input_path(&self, path: &str, line: u32) -> Result<Value, EvalError> {
        let Value::Json(root) = &self.input else {
            return Ok(Value::None);
        };
        match tree::lookup(root, path) {
            Ok(Some(node)) => Ok(Value::from_json(node)),
            Ok(None) => Ok(Value::None),
            Err(e) => Err(self.error(e.to_string(), line)),
        }
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::Float(x) => *x,
        _ => f64::NAN,
    }
}

fn is_listish(v: &Value) -> bool {
    matches!(v, Value::List(_)) || matches!(v, Value::Json(j) if j.is_array())
}

fn list_items(v: &Value) -> Vec<Value> {
    match v {
        Value::List(items) => items.as_ref().clone(),
        Value::Json(j) => match j.as_ref() {
            Json::Array(items) => items.iter().map(Value::from_json).collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if (0..len).contains(&idx) {
        Some(idx as usize)
    } else {
        None
    }
}

fn string_method_name(name: &str) -> &'static str {
    match name {
        "startswith" => "str.startswith",
        "endswith" => "str.endswith",
        "lower" => "str.lower",
        "upper" => "str.upper",
        "strip" => "str.strip",
        "split" => "str.split",
        _ => "str.replace",
    }
}

fn mapping_method_name(name: &str) -> &'static str {
    match name {
        "get" => "dict.get",
        "keys" => "dict.keys",
        "values" => "dict.values",
        _ => "dict.items",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::parser::parse;
    use serde_json::json;

    fn run_bool(source: &str, input: Json) -> Result<bool, EvalError> {
        let script = parse(source).expect("script parses");
        let input = Value::from_json_owned(input);
        let globals = exec_module(&script, &Value::from_json(&json!({})))?;
        let Some(Value::Func(func)) = globals.get("authorize").cloned() else {
            panic!("no authorize function");
        };
        match call(&globals, &func, Vec::new(), &input)? {
            Value::Bool(b) => Ok(b),
            other => panic!("authorize returned {}", other.type_name()),
        }
    }

    fn sample_input() -> Json {
        json!({
            "request": {"action": "READ", "path": ["productCatalogManagement", "productOffering"]},
            "token": {},
            "tmf": {
                "id": "urn:ngsi-ld:product-offering:A",
                "lifecycleStatus": "Launched",
                "permittedCountries": ["ES", "DE"],
                "relatedParty": [
                    {"role": "Seller", "name": "did:elsi:A"},
                    {"role": "Buyer", "name": "did:elsi:B"}
                ]
            },
            "user": {"isOwner": true, "isLEAR": false, "country": "ES"}
        })
    }

    #[test]
    fn test_attribute_chain_on_input() {
        let verdict =
            run_bool("def authorize():\n    return input.user.isOwner\n", sample_input());
        assert_eq!(verdict.unwrap(), true);
    }

    #[test]
    fn test_membership_and_comparison() {
        let src = "\
def authorize():
    return input.user.country in input.tmf.permittedCountries and len(input.tmf.relatedParty) >= 2
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_for_loop_over_wrapped_array() {
        let src = "\
def authorize():
    for party in input.tmf.relatedParty:
        if party.role == 'Seller' and party.name.startswith('did:elsi:'):
            return True
    return False
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_list_comprehension_and_any() {
        let src = "\
def authorize():
    sellers = [p.name for p in input.tmf.relatedParty if p.role == 'Seller']
    return any([s == 'did:elsi:A' for s in sellers])
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_helper_functions_and_globals() {
        let src = "\
ALLOWED = ['Launched', 'Active']

def status_ok(status):
    return status in ALLOWED

def authorize():
    return status_ok(input.tmf.lifecycleStatus)
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_star_module() {
        let src = "\
def authorize():
    body = star.getbody()
    return star.getinput('user.country') == 'ES' and body.lifecycleStatus == 'Launched'
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_getinput_missing_path_is_none() {
        let src = "def authorize():\n    return star.getinput('no.such.path') == None\n";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_json_module_round_trip() {
        let src = "\
def authorize():
    blob = json.encode({'a': [1, 2]})
    back = json.decode(blob)
    return back.a[1] == 2
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_arithmetic_semantics() {
        let src = "\
def authorize():
    return 7 // 2 == 3 and -7 // 2 == -4 and 7 % 3 == 1 and 7 / 2 == 3.5
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_dict_methods() {
        let src = "\
def authorize():
    user = input.user
    return user.get('missing', 'x') == 'x' and 'country' in user.keys()
";
        assert!(run_bool(src, sample_input()).unwrap());
    }

    #[test]
    fn test_undefined_name_has_backtrace() {
        let err = run_bool(
            "def authorize():\n    return does_not_exist\n",
            sample_input(),
        )
        .unwrap_err();
        assert!(err.message.contains("does_not_exist"));
        assert_eq!(err.frames.len(), 1);
        assert_eq!(err.frames[0].function, "authorize");
    }

    #[test]
    fn test_nested_call_backtrace() {
        let src = "\
def inner():
    return missing_name

def authorize():
    return inner()
";
        let err = run_bool(src, sample_input()).unwrap_err();
        let names: Vec<_> = err.frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["authorize", "inner"]);
    }

    #[test]
    fn test_recursion_is_bounded() {
        let src = "\
def loop_forever():
    return loop_forever()

def authorize():
    return loop_forever()
";
        let err = run_bool(src, sample_input()).unwrap_err();
        assert!(err.message.contains("call depth"));
    }

    #[test]
    fn test_infinite_loop_is_bounded() {
        let src = "\
def authorize():
    n = 0
    for i in range(1000000):
        for j in range(1000000):
            n = n + 1
    return True
";
        let err = run_bool(src, sample_input()).unwrap_err();
        assert!(err.message.contains("step budget"));
    }

    #[test]
    fn test_def_inside_function_rejected() {
        let src = "\
def authorize():
    def helper():
        return True
    return helper()
";
        assert!(run_bool(src, sample_input()).is_err());
    }

    #[test]
    fn test_short_circuit_avoids_errors() {
        let src = "def authorize():\n    return False and missing_name\n";
        assert_eq!(run_bool(src, sample_input()).unwrap(), false);
    }

    #[test]
    fn test_objects_compare_by_id() {
        let src = "\
def authorize():
    offering = star.getbody()
    return offering == {'id': 'urn:ngsi-ld:product-offering:A'}
";
        // Mixed wrapped/native comparison is structural, so this one is false...
        assert_eq!(run_bool(src, sample_input()).unwrap(), false);
        // ...but two wrapped objects with the same id are equal.
        let src = "\
def authorize():
    a = json.decode('{\"id\": \"x\", \"n\": 1}')
    b = json.decode('{\"id\": \"x\", \"n\": 2}')
    return a == b
";
        assert!(run_bool(src, sample_input()).unwrap());
    }
}
