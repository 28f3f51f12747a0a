//! # Sandbox values
//!
//! Model code operates on plain JSON values, the same representation tools
//! receive and return. This module gives those values Python-flavoured
//! semantics: truthiness, `str()`/`repr()`, arithmetic, comparison,
//! membership, indexing and iteration.
//!
//! Tuples are represented as lists and dict keys are always strings.

use crate::ast::{BinOp, CmpOp};
use crate::error::{self, Result};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Largest string or list a single operation may build
pub const MAX_SEQUENCE_LEN: usize = 10_000_000;

/// Numeric view of a value; booleans count as integers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Python type name of a value
pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Num::Int(i))
            } else {
                n.as_f64().map(Num::Float)
            }
        }
        _ => None,
    }
}

pub fn int(i: i64) -> Value {
    Value::Number(Number::from(i))
}

/// Build a float value; JSON has no NaN or infinity
pub fn float(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| error::value_error(format!("float result {} is not representable", f)))
}

pub fn num_value(n: Num) -> Result<Value> {
    match n {
        Num::Int(i) => Ok(int(i)),
        Num::Float(f) => float(f),
    }
}

pub fn as_index(v: &Value, what: &str) -> Result<i64> {
    match v {
        Value::Bool(b) => Ok(*b as i64),
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            error::type_error(format!("{} must be an integer, not {}", what, type_name(v)))
        }),
        _ => Err(error::type_error(format!(
            "{} must be an integer, not {}",
            what,
            type_name(v)
        ))),
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{:?}", f)
    }
}

/// Python `str()`
pub fn to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => repr(other),
    }
}

/// Python `repr()`
pub fn repr(v: &Value) -> String {
    match v {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => match n.as_u64() {
                Some(u) => u.to_string(),
                None => format_float(n.as_f64().unwrap_or(0.0)),
            },
        },
        Value::String(s) => repr_str(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", repr_str(k), repr(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

// =============================================================================
// Arithmetic
// =============================================================================

fn unsupported(op: BinOp, l: &Value, r: &Value) -> nea_error::Error {
    error::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        type_name(l),
        type_name(r)
    ))
}

fn overflow(op: BinOp) -> nea_error::Error {
    error::overflow(format!("integer overflow in '{}'", op.symbol()))
}

fn repeat_len(len: usize, count: i64) -> Result<usize> {
    if count <= 0 {
        return Ok(0);
    }
    let total = len.saturating_mul(count as usize);
    if total > MAX_SEQUENCE_LEN {
        return Err(error::forbidden(format!(
            "sequence of {} items exceeds the sandbox limit of {}",
            total, MAX_SEQUENCE_LEN
        )));
    }
    Ok(total)
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn py_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn py_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

/// Apply a binary operator with Python semantics
pub fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    // Sequence operators first
    match (op, l, r) {
        (BinOp::Add, Value::String(a), Value::String(b)) => {
            return Ok(Value::String(format!("{}{}", a, b)));
        }
        (BinOp::Add, Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::Array(out));
        }
        (BinOp::Mul, Value::String(s), n) | (BinOp::Mul, n, Value::String(s))
            if matches!(n, Value::Number(_) | Value::Bool(_)) =>
        {
            let count = as_index(n, "repeat count")?;
            repeat_len(s.len(), count)?;
            return Ok(Value::String(s.repeat(count.max(0) as usize)));
        }
        (BinOp::Mul, Value::Array(items), n) | (BinOp::Mul, n, Value::Array(items))
            if matches!(n, Value::Number(_) | Value::Bool(_)) =>
        {
            let count = as_index(n, "repeat count")?;
            let total = repeat_len(items.len(), count)?;
            let mut out = Vec::with_capacity(total);
            for _ in 0..count.max(0) {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::Array(out));
        }
        _ => {}
    }

    let (a, b) = match (as_num(l), as_num(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported(op, l, r)),
    };

    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_op(op, x, y),
        _ => float_op(op, a.as_f64(), b.as_f64()),
    }
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value> {
    let zero = || error::zero_division("integer division or modulo by zero");
    let v = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(|| overflow(op))?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(|| overflow(op))?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(|| overflow(op))?,
        BinOp::Div => {
            if y == 0 {
                return Err(error::zero_division("division by zero"));
            }
            return float(x as f64 / y as f64);
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero());
            }
            floor_div(x, y).ok_or_else(|| overflow(op))?
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero());
            }
            py_mod(x, y).ok_or_else(|| overflow(op))?
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(error::zero_division(
                        "0 cannot be raised to a negative power",
                    ));
                }
                return float((x as f64).powf(y as f64));
            }
            let exp = u32::try_from(y).map_err(|_| overflow(op))?;
            x.checked_pow(exp).ok_or_else(|| overflow(op))?
        }
    };
    Ok(int(v))
}

fn float_op(op: BinOp, x: f64, y: f64) -> Result<Value> {
    let v = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(error::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(error::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(error::zero_division("float modulo"));
            }
            py_fmod(x, y)
        }
        BinOp::Pow => x.powf(y),
    };
    float(v)
}

// =============================================================================
// Comparison
// =============================================================================

/// Python `==`: numbers compare by value across int/float
pub fn values_equal(l: &Value, r: &Value) -> bool {
    match (as_num(l), as_num(r)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => match (l, r) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
            }
            _ => l == r,
        },
    }
}

/// Ordering for `<`, `<=`, `>`, `>=`, `sorted`, `min`, `max`
pub fn order(l: &Value, r: &Value) -> Result<Ordering> {
    if let (Some(a), Some(b)) = (as_num(l), as_num(r)) {
        return match (a, b) {
            (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
            _ => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .ok_or_else(|| error::value_error("cannot order NaN")),
        };
    }
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match order(x, y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(error::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            type_name(l),
            type_name(r)
        ))),
    }
}

pub fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => values_equal(l, r),
        CmpOp::NotEq => !values_equal(l, r),
        CmpOp::Lt => order(l, r)? == Ordering::Less,
        CmpOp::LtE => order(l, r)? != Ordering::Greater,
        CmpOp::Gt => order(l, r)? == Ordering::Greater,
        CmpOp::GtE => order(l, r)? != Ordering::Less,
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
        CmpOp::Is => is_same(l, r),
        CmpOp::IsNot => !is_same(l, r),
    })
}

/// `is` only has stable meaning for singletons
fn is_same(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

/// Python `item in container`
pub fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::String(s) => match item {
            Value::String(needle) => Ok(s.contains(needle.as_str())),
            other => Err(error::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                type_name(other)
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|x| values_equal(x, item))),
        Value::Object(map) => match item {
            Value::String(k) => Ok(map.contains_key(k)),
            _ => Ok(false),
        },
        other => Err(error::type_error(format!(
            "argument of type '{}' is not iterable",
            type_name(other)
        ))),
    }
}

// =============================================================================
// Indexing and iteration
// =============================================================================

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

/// Resolve a list position for reads and writes
pub fn list_position(items: &[Value], index: &Value) -> Result<usize> {
    let i = as_index(index, "list indices")?;
    normalize_index(i, items.len())
        .ok_or_else(|| error::index_error("list index out of range"))
}

/// Dict keys must be strings
pub fn dict_key(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        other => Err(error::type_error(format!(
            "dict keys must be str, not {}",
            type_name(other)
        ))),
    }
}

/// Python `container[index]`
pub fn get_item(container: &Value, index: &Value) -> Result<Value> {
    match container {
        Value::Array(items) => Ok(items[list_position(items, index)?].clone()),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = as_index(index, "string indices")?;
            let pos = normalize_index(i, chars.len())
                .ok_or_else(|| error::index_error("string index out of range"))?;
            Ok(Value::String(chars[pos].to_string()))
        }
        Value::Object(map) => {
            let key = dict_key(index)?;
            map.get(&key)
                .cloned()
                .ok_or_else(|| error::key_error(repr(index)))
        }
        other => Err(error::type_error(format!(
            "'{}' object is not subscriptable",
            type_name(other)
        ))),
    }
}

fn slice_bounds(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
    let resolve = |v: i64| if v < 0 { v + len } else { v };
    let mut out = Vec::new();
    if step > 0 {
        let start = clamp(lower.map(resolve).unwrap_or(0), 0, len);
        let stop = clamp(upper.map(resolve).unwrap_or(len), 0, len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let start = clamp(lower.map(resolve).unwrap_or(len - 1), -1, len - 1);
        let stop = clamp(upper.map(resolve).unwrap_or(-1), -1, len - 1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    out
}

/// Python `container[lower:upper:step]`
pub fn get_slice(
    container: &Value,
    lower: Option<&Value>,
    upper: Option<&Value>,
    step: Option<&Value>,
) -> Result<Value> {
    let bound = |v: Option<&Value>| -> Result<Option<i64>> {
        match v {
            None | Some(Value::Null) => Ok(None),
            Some(v) => as_index(v, "slice indices").map(Some),
        }
    };
    let (lower, upper) = (bound(lower)?, bound(upper)?);
    let step = bound(step)?.unwrap_or(1);
    if step == 0 {
        return Err(error::value_error("slice step cannot be zero"));
    }
    match container {
        Value::Array(items) => Ok(Value::Array(
            slice_bounds(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::String(
                slice_bounds(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(error::type_error(format!(
            "'{}' object is not subscriptable",
            type_name(other)
        ))),
    }
}

/// Materialize an iterable into its items
pub fn iterate(v: &Value) -> Result<Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        other => Err(error::type_error(format!(
            "'{}' object is not iterable",
            type_name(other)
        ))),
    }
}

/// Build a dict from `[key, value]` pairs
pub fn dict_from_pairs(pairs: Vec<Value>) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        match pair {
            Value::Array(kv) if kv.len() == 2 => {
                let key = dict_key(&kv[0])?;
                map.insert(key, kv[1].clone());
            }
            other => {
                return Err(error::type_error(format!(
                    "cannot convert {} element to a key/value pair",
                    type_name(&other)
                )))
            }
        }
    }
    Ok(map)
}
