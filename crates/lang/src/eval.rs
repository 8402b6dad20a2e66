use std::collections::BTreeMap;

use crate::value::{
    Lambda,
    Value,
};

/// Evaluation and decoding errors. This is the closed set the daemon maps to
/// its `InvalidInput` boundary error.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum LangError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("`{0}` is not callable")]
    NotCallable(String),
    #[error("wrong number of arguments to `{form}`: expected {expected}, got {got}")]
    WrongArity {
        form: String,
        expected: usize,
        got: usize,
    },
    #[error("type mismatch in `{op}`: {detail}")]
    TypeMismatch { op: String, detail: String },
    #[error("malformed `{0}` form")]
    MalformedForm(String),
    #[error("unsupported JSON value: {0}")]
    UnsupportedJson(String),
}

/// The binding that accumulates the machine's applied inputs, so expressions
/// can inspect the log itself, eg `(count history)`.
const HISTORY: &str = "history";

/// The folded evaluator state of one machine: its global environment.
///
/// `State` is a pure value. `apply` is the transition function the
/// replication core folds over the input log; it returns the successor state
/// and never mutates in place, so a failed evaluation leaves the caller's
/// state untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    env: BTreeMap<String, Value>,
}

impl State {
    pub fn new() -> Self {
        let mut env = BTreeMap::new();
        env.insert(HISTORY.to_string(), Value::nil());
        Self { env }
    }

    /// The pure transition: evaluate one input against this state, producing
    /// the successor state and the input's result. The input is recorded in
    /// the successor's `history` binding after evaluation, so an input sees
    /// only the log before itself.
    pub fn apply(&self, input: &Value) -> Result<(State, Value), LangError> {
        let mut next = self.clone();
        let result = eval(&mut next.env, input)?;
        let history = next.env.entry(HISTORY.to_string()).or_insert_with(Value::nil);
        match history {
            Value::List(items) => items.push(input.clone()),
            // An input rebound `history` to a non-list; start recording over.
            other => *other = Value::List(vec![input.clone()]),
        }
        Ok((next, result))
    }

    /// Evaluate an expression against a scratch copy of the state. Bindings
    /// introduced by the expression are discarded; the state is never
    /// committed from a query.
    pub fn query(&self, expr: &Value) -> Result<Value, LangError> {
        let mut scratch = self.env.clone();
        eval(&mut scratch, expr)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

fn eval(env: &mut BTreeMap<String, Value>, expr: &Value) -> Result<Value, LangError> {
    match expr {
        Value::Int(_) | Value::Bool(_) | Value::Str(_) | Value::Lambda(_) => Ok(expr.clone()),
        Value::Atom(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| LangError::UnknownSymbol(name.clone())),
        Value::List(items) => {
            let Some((head, args)) = items.split_first() else {
                // The empty list is a datum.
                return Ok(Value::nil());
            };
            if let Value::Atom(name) = head {
                match name.as_str() {
                    "quote" => return eval_quote(args),
                    "def" => return eval_def(env, args),
                    "fn" => return eval_fn(env, args),
                    "if" => return eval_if(env, args),
                    "do" => return eval_do(env, args),
                    _ => {},
                }
                if !env.contains_key(name) {
                    return apply_primop(env, name, args);
                }
            }
            let callee = eval(env, head)?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(env, arg)?);
            }
            apply_lambda(env, &callee, evaluated)
        },
    }
}

fn eval_quote(args: &[Value]) -> Result<Value, LangError> {
    match args {
        [quoted] => Ok(quoted.clone()),
        _ => Err(LangError::MalformedForm("quote".to_string())),
    }
}

fn eval_def(env: &mut BTreeMap<String, Value>, args: &[Value]) -> Result<Value, LangError> {
    let [Value::Atom(name), expr] = args else {
        return Err(LangError::MalformedForm("def".to_string()));
    };
    let value = eval(env, expr)?;
    env.insert(name.clone(), value.clone());
    Ok(value)
}

fn eval_fn(env: &mut BTreeMap<String, Value>, args: &[Value]) -> Result<Value, LangError> {
    let Some((Value::List(params), body)) = args.split_first() else {
        return Err(LangError::MalformedForm("fn".to_string()));
    };
    let params = params
        .iter()
        .map(|p| match p {
            Value::Atom(name) => Ok(name.clone()),
            _ => Err(LangError::MalformedForm("fn".to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Lambda(Lambda {
        params,
        body: body.to_vec(),
        env: env.clone(),
    }))
}

fn eval_if(env: &mut BTreeMap<String, Value>, args: &[Value]) -> Result<Value, LangError> {
    let [cond, then_branch, else_branch] = args else {
        return Err(LangError::MalformedForm("if".to_string()));
    };
    match eval(env, cond)? {
        Value::Bool(false) => eval(env, else_branch),
        _ => eval(env, then_branch),
    }
}

fn eval_do(env: &mut BTreeMap<String, Value>, args: &[Value]) -> Result<Value, LangError> {
    let mut last = Value::nil();
    for expr in args {
        last = eval(env, expr)?;
    }
    Ok(last)
}

fn apply_lambda(
    env: &BTreeMap<String, Value>,
    callee: &Value,
    args: Vec<Value>,
) -> Result<Value, LangError> {
    let Value::Lambda(lambda) = callee else {
        return Err(LangError::NotCallable(callee.to_string()));
    };
    if lambda.params.len() != args.len() {
        return Err(LangError::WrongArity {
            form: callee.to_string(),
            expected: lambda.params.len(),
            got: args.len(),
        });
    }
    // Captured bindings shadow the caller's; the caller's environment stays
    // visible underneath so definitions made after capture still resolve.
    let mut call_env = env.clone();
    call_env.extend(lambda.env.clone());
    for (param, arg) in lambda.params.iter().zip(args) {
        call_env.insert(param.clone(), arg);
    }
    eval_do(&mut call_env, &lambda.body)
}

fn apply_primop(
    env: &mut BTreeMap<String, Value>,
    name: &str,
    args: &[Value],
) -> Result<Value, LangError> {
    let mut evaluated = Vec::with_capacity(args.len());
    for arg in args {
        evaluated.push(eval(env, arg)?);
    }
    let args = evaluated;
    match name {
        "+" => fold_ints(name, &args, 0, |acc, i| acc + i),
        "*" => fold_ints(name, &args, 1, |acc, i| acc * i),
        "-" => {
            let ints = as_ints(name, &args)?;
            match ints.split_first() {
                None => Err(LangError::WrongArity {
                    form: name.to_string(),
                    expected: 1,
                    got: 0,
                }),
                Some((first, [])) => Ok(Value::Int(-first)),
                Some((first, rest)) => Ok(Value::Int(rest.iter().fold(*first, |acc, i| acc - i))),
            }
        },
        "=" => match &args[..] {
            [a, b] => Ok(Value::Bool(a == b)),
            _ => wrong_arity(name, 2, args.len()),
        },
        "<" => match as_ints(name, &args)?[..] {
            [a, b] => Ok(Value::Bool(a < b)),
            _ => wrong_arity(name, 2, args.len()),
        },
        "list" => Ok(Value::List(args)),
        "cons" => match &args[..] {
            [head, Value::List(tail)] => {
                let mut items = vec![head.clone()];
                items.extend(tail.iter().cloned());
                Ok(Value::List(items))
            },
            [_, other] => type_mismatch(name, format!("expected a list, got {other}")),
            _ => wrong_arity(name, 2, args.len()),
        },
        "first" => match &args[..] {
            [Value::List(items)] => items
                .first()
                .cloned()
                .ok_or_else(|| LangError::TypeMismatch {
                    op: name.to_string(),
                    detail: "the list is empty".to_string(),
                }),
            [other] => type_mismatch(name, format!("expected a list, got {other}")),
            _ => wrong_arity(name, 1, args.len()),
        },
        "rest" => match &args[..] {
            [Value::List(items)] if !items.is_empty() => Ok(Value::List(items[1..].to_vec())),
            [other] => type_mismatch(name, format!("expected a non-empty list, got {other}")),
            _ => wrong_arity(name, 1, args.len()),
        },
        "count" => match &args[..] {
            [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
            [other] => type_mismatch(name, format!("expected a list, got {other}")),
            _ => wrong_arity(name, 1, args.len()),
        },
        "nth" => match &args[..] {
            [Value::Int(n), Value::List(items)] => {
                let idx = usize::try_from(*n).ok().filter(|&i| i < items.len());
                match idx {
                    Some(i) => Ok(items[i].clone()),
                    None => type_mismatch(name, format!("index {n} out of bounds")),
                }
            },
            [_, _] => type_mismatch(name, "expected an index and a list".to_string()),
            _ => wrong_arity(name, 2, args.len()),
        },
        _ => Err(LangError::UnknownSymbol(name.to_string())),
    }
}

fn as_ints(op: &str, args: &[Value]) -> Result<Vec<i64>, LangError> {
    args.iter()
        .map(|v| match v {
            Value::Int(i) => Ok(*i),
            other => Err(LangError::TypeMismatch {
                op: op.to_string(),
                detail: format!("expected an integer, got {other}"),
            }),
        })
        .collect()
}

fn fold_ints(
    op: &str,
    args: &[Value],
    init: i64,
    f: impl Fn(i64, i64) -> i64,
) -> Result<Value, LangError> {
    let ints = as_ints(op, args)?;
    Ok(Value::Int(ints.into_iter().fold(init, f)))
}

fn wrong_arity(form: &str, expected: usize, got: usize) -> Result<Value, LangError> {
    Err(LangError::WrongArity {
        form: form.to_string(),
        expected,
        got,
    })
}

fn type_mismatch(op: &str, detail: String) -> Result<Value, LangError> {
    Err(LangError::TypeMismatch {
        op: op.to_string(),
        detail,
    })
}
