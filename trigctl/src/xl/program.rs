//! Compiled condition programs: schema checking, trial evaluation, and
//! cost-budgeted execution.

use std::collections::{BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;

use super::parser::{BinOp, Expr, UnOp, parse};
use super::value::{Value, ValueKind};
use super::{CANCEL_POLL_INTERVAL, Error, Result, TRIAL_COST_LIMIT};

/// WGS-84 mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// The frozen variable set a program may reference, with types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    vars: BTreeMap<String, ValueKind>,
}

impl Schema {
    pub fn new<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, ValueKind)>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(name, kind)| (name.to_string(), kind))
                .collect(),
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.vars.get(name).copied()
    }

    /// Bindings where every variable holds its zero value. Used for the
    /// compile-time trial run and for `previous*` before the first fire.
    pub fn zero_bindings(&self) -> Bindings {
        let values = self
            .vars
            .iter()
            .map(|(name, kind)| (name.clone(), Value::zero(*kind)))
            .collect();
        Bindings { values }
    }
}

/// Variables available to signal conditions. `value` and `previousValue`
/// take the metric's declared type; the typed accessors are always present.
pub fn signal_schema(value_kind: ValueKind) -> Schema {
    Schema::new([
        ("value", value_kind),
        ("valueNumber", ValueKind::Number),
        ("valueString", ValueKind::Text),
        ("source", ValueKind::Text),
        ("previousValue", value_kind),
        ("previousValueNumber", ValueKind::Number),
        ("previousValueString", ValueKind::Text),
        ("previousSource", ValueKind::Text),
    ])
}

/// Variables available to event conditions.
pub fn event_schema() -> Schema {
    Schema::new([
        ("name", ValueKind::Text),
        ("source", ValueKind::Text),
        ("durationNs", ValueKind::Number),
        ("metadata", ValueKind::Text),
        ("previousName", ValueKind::Text),
        ("previousSource", ValueKind::Text),
        ("previousDurationNs", ValueKind::Number),
        ("previousMetadata", ValueKind::Text),
    ])
}

/// Concrete values for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: HashMap<String, Value>,
}

impl Bindings {
    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// A compiled, schema-checked condition. Guaranteed to evaluate to a
/// boolean for any bindings that satisfy its schema.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: Expr,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the given bindings under a cost budget. The token,
    /// when provided, is polled every [`CANCEL_POLL_INTERVAL`] ops.
    pub fn execute(
        &self,
        bindings: &Bindings,
        cost_limit: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let mut ctx = EvalCtx {
            ops: 0,
            limit: cost_limit,
            cancel,
        };
        eval(&self.expr, bindings, &mut ctx)
    }

    /// Evaluate and report whether the condition is literally true.
    pub fn matches(
        &self,
        bindings: &Bindings,
        cost_limit: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        match self.execute(bindings, cost_limit, cancel)? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::Eval(format!(
                "condition produced {} instead of a boolean",
                other.kind()
            ))),
        }
    }
}

/// Compile a condition against a variable schema.
///
/// Parsing, type checking, and a trial evaluation against zero-valued
/// bindings all happen here; a program that survives compilation cannot
/// produce a non-boolean at runtime.
pub fn compile(source: &str, schema: &Schema) -> Result<Program> {
    let expr = parse(source)?;
    let kind = check(&expr, schema)?;
    if kind != ValueKind::Bool {
        return Err(Error::Compile(format!(
            "condition must evaluate to a boolean, got {kind}"
        )));
    }

    let program = Program {
        source: source.to_string(),
        expr,
    };
    // Trial run against zero values proves the program executes inside a
    // sane budget before it ever reaches the hot path.
    program.execute(&schema.zero_bindings(), TRIAL_COST_LIMIT, None)?;
    Ok(program)
}

fn check(expr: &Expr, schema: &Schema) -> Result<ValueKind> {
    match expr {
        Expr::Literal(v) => Ok(v.kind()),
        Expr::Var(name) => schema
            .kind_of(name)
            .ok_or_else(|| Error::Compile(format!("unknown variable `{name}`"))),
        Expr::Member(base, field) => {
            let base_kind = check(base, schema)?;
            if base_kind != ValueKind::Location {
                return Err(Error::Compile(format!(
                    "cannot access field `{field}` on a {base_kind}"
                )));
            }
            match field.as_str() {
                "Latitude" | "Longitude" | "HDOP" => Ok(ValueKind::Number),
                other => Err(Error::Compile(format!(
                    "location has no field `{other}` (expected Latitude, Longitude, or HDOP)"
                ))),
            }
        }
        Expr::Call(name, args) => match name.as_str() {
            "geoDistance" => {
                if args.len() != 4 {
                    return Err(Error::Compile(format!(
                        "geoDistance takes 4 arguments, got {}",
                        args.len()
                    )));
                }
                for arg in args {
                    let kind = check(arg, schema)?;
                    if kind != ValueKind::Number {
                        return Err(Error::Compile(format!(
                            "geoDistance arguments must be numbers, got {kind}"
                        )));
                    }
                }
                Ok(ValueKind::Number)
            }
            other => Err(Error::Compile(format!("unknown function `{other}`"))),
        },
        Expr::Unary(op, inner) => {
            let kind = check(inner, schema)?;
            match op {
                UnOp::Not if kind == ValueKind::Bool => Ok(ValueKind::Bool),
                UnOp::Not => Err(Error::Compile(format!("`!` requires a boolean, got {kind}"))),
                UnOp::Neg if kind == ValueKind::Number => Ok(ValueKind::Number),
                UnOp::Neg => Err(Error::Compile(format!("`-` requires a number, got {kind}"))),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lk = check(lhs, schema)?;
            let rk = check(rhs, schema)?;
            match op {
                BinOp::Or | BinOp::And => {
                    if lk == ValueKind::Bool && rk == ValueKind::Bool {
                        Ok(ValueKind::Bool)
                    } else {
                        Err(Error::Compile(format!(
                            "logical operators require booleans, got {lk} and {rk}"
                        )))
                    }
                }
                BinOp::Eq | BinOp::Ne => {
                    if lk == rk {
                        Ok(ValueKind::Bool)
                    } else {
                        Err(Error::Compile(format!(
                            "cannot compare {lk} with {rk}"
                        )))
                    }
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    if lk == ValueKind::Number && rk == ValueKind::Number {
                        Ok(ValueKind::Bool)
                    } else {
                        Err(Error::Compile(format!(
                            "ordering comparisons require numbers, got {lk} and {rk}"
                        )))
                    }
                }
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                    if lk == ValueKind::Number && rk == ValueKind::Number {
                        Ok(ValueKind::Number)
                    } else {
                        Err(Error::Compile(format!(
                            "arithmetic requires numbers, got {lk} and {rk}"
                        )))
                    }
                }
            }
        }
    }
}

struct EvalCtx<'a> {
    ops: u64,
    limit: u64,
    cancel: Option<&'a CancellationToken>,
}

impl EvalCtx<'_> {
    fn tick(&mut self) -> Result<()> {
        self.ops += 1;
        if self.ops > self.limit {
            return Err(Error::CostExceeded { limit: self.limit });
        }
        if self.ops % CANCEL_POLL_INTERVAL == 0
            && self.cancel.is_some_and(|token| token.is_cancelled())
        {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

fn eval(expr: &Expr, bindings: &Bindings, ctx: &mut EvalCtx<'_>) -> Result<Value> {
    ctx.tick()?;
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("unbound variable `{name}`"))),
        Expr::Member(base, field) => {
            let base = eval(base, bindings, ctx)?;
            match base {
                Value::Location(loc) => match field.as_str() {
                    "Latitude" => Ok(Value::Number(loc.latitude)),
                    "Longitude" => Ok(Value::Number(loc.longitude)),
                    "HDOP" => Ok(Value::Number(loc.hdop)),
                    other => Err(Error::Eval(format!("location has no field `{other}`"))),
                },
                other => Err(Error::Eval(format!(
                    "cannot access field `{field}` on a {}",
                    other.kind()
                ))),
            }
        }
        Expr::Call(name, args) => match name.as_str() {
            "geoDistance" => {
                let mut nums = [0.0f64; 4];
                for (slot, arg) in nums.iter_mut().zip(args) {
                    let value = eval(arg, bindings, ctx)?;
                    *slot = value
                        .as_number()
                        .ok_or_else(|| Error::Eval("geoDistance argument is not a number".into()))?;
                }
                Ok(Value::Number(geo_distance(nums[0], nums[1], nums[2], nums[3])))
            }
            other => Err(Error::Eval(format!("unknown function `{other}`"))),
        },
        Expr::Unary(op, inner) => {
            let value = eval(inner, bindings, ctx)?;
            match (op, value) {
                (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                (op, value) => Err(Error::Eval(format!(
                    "{op:?} is not applicable to {}",
                    value.kind()
                ))),
            }
        }
        Expr::Binary(op, lhs, rhs) => match op {
            BinOp::And => {
                let l = eval_bool(lhs, bindings, ctx)?;
                if !l {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(eval_bool(rhs, bindings, ctx)?))
            }
            BinOp::Or => {
                let l = eval_bool(lhs, bindings, ctx)?;
                if l {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(eval_bool(rhs, bindings, ctx)?))
            }
            BinOp::Eq => {
                let l = eval(lhs, bindings, ctx)?;
                let r = eval(rhs, bindings, ctx)?;
                Ok(Value::Bool(l == r))
            }
            BinOp::Ne => {
                let l = eval(lhs, bindings, ctx)?;
                let r = eval(rhs, bindings, ctx)?;
                Ok(Value::Bool(l != r))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let l = eval_number(lhs, bindings, ctx)?;
                let r = eval_number(rhs, bindings, ctx)?;
                let result = match op {
                    BinOp::Lt => l < r,
                    BinOp::Le => l <= r,
                    BinOp::Gt => l > r,
                    _ => l >= r,
                };
                Ok(Value::Bool(result))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let l = eval_number(lhs, bindings, ctx)?;
                let r = eval_number(rhs, bindings, ctx)?;
                let result = match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    _ => l % r,
                };
                Ok(Value::Number(result))
            }
        },
    }
}

fn eval_bool(expr: &Expr, bindings: &Bindings, ctx: &mut EvalCtx<'_>) -> Result<bool> {
    match eval(expr, bindings, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Eval(format!("expected a boolean, got {}", other.kind()))),
    }
}

fn eval_number(expr: &Expr, bindings: &Bindings, ctx: &mut EvalCtx<'_>) -> Result<f64> {
    match eval(expr, bindings, ctx)? {
        Value::Number(n) => Ok(n),
        other => Err(Error::Eval(format!("expected a number, got {}", other.kind()))),
    }
}

/// Great-circle distance in kilometres (Haversine).
fn geo_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
