//! Builtin functions, value methods and the `math` module
//!
//! Everything here is pure: it takes evaluated arguments and returns a
//! value. `print` and `final_answer` need interpreter state and live in
//! [`crate::interpreter`].

use crate::ast::BinOp;
use crate::error::{self, Result};
use crate::value::{
    as_index, as_num, binary_op, dict_from_pairs, dict_key, float, int, is_truthy, iterate,
    list_position, order, repr, to_display, type_name, values_equal, Num, MAX_SEQUENCE_LEN,
};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub(crate) type Kwargs = Vec<(String, Value)>;

// =============================================================================
// Argument helpers
// =============================================================================

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else if args.len() < min {
            format!("at least {}", min)
        } else {
            format!("at most {}", max)
        };
        return Err(error::type_error(format!(
            "{}() takes {} argument(s) ({} given)",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> Result<()> {
    match kwargs.first() {
        Some((key, _)) => Err(error::type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            name, key
        ))),
        None => Ok(()),
    }
}

/// Collect keyword arguments, rejecting names not in `allowed`
fn take_kwarg(name: &str, kwargs: Kwargs, allowed: &[&str]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in kwargs {
        if !allowed.contains(&key.as_str()) {
            return Err(error::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, key
            )));
        }
        out.insert(key, value);
    }
    Ok(out)
}

fn expect_str<'a>(v: &'a Value, what: &str) -> Result<&'a str> {
    v.as_str().ok_or_else(|| {
        error::type_error(format!("{} must be str, not {}", what, type_name(v)))
    })
}

fn expect_num(v: &Value, what: &str) -> Result<Num> {
    as_num(v).ok_or_else(|| {
        error::type_error(format!(
            "{} must be a real number, not {}",
            what,
            type_name(v)
        ))
    })
}

// =============================================================================
// Builtin functions
// =============================================================================

pub(crate) fn call_builtin(name: &str, mut args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    match name {
        "len" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(error::type_error(format!(
                        "object of type '{}' has no len()",
                        type_name(other)
                    )))
                }
            };
            Ok(int(n as i64))
        }
        "str" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::String(args.first().map(to_display).unwrap_or_default()))
        }
        "repr" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::String(repr(&args[0])))
        }
        "int" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 2)?;
            to_int(&args)
        }
        "float" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            to_float(args.first())
        }
        "bool" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().map(is_truthy).unwrap_or(false)))
        }
        "list" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::Array(iterate(v)?)),
                None => Ok(Value::Array(Vec::new())),
            }
        }
        "dict" => {
            arity(name, &args, 0, 1)?;
            let mut map = match args.pop() {
                None => Map::new(),
                Some(Value::Object(m)) => m,
                Some(other) => dict_from_pairs(iterate(&other)?)?,
            };
            for (k, v) in kwargs {
                map.insert(k, v);
            }
            Ok(Value::Object(map))
        }
        "range" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 3)?;
            range(&args)
        }
        "min" | "max" => min_max(name, args, kwargs),
        "sum" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or_else(|| int(0));
            for item in iterate(&args[0])? {
                total = binary_op(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "abs" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            match expect_num(&args[0], "abs() argument")? {
                Num::Int(i) => i
                    .checked_abs()
                    .map(int)
                    .ok_or_else(|| error::overflow("integer overflow in abs()")),
                Num::Float(f) => float(f.abs()),
            }
        }
        "round" => {
            let mut kw = take_kwarg(name, kwargs, &["ndigits"])?;
            arity(name, &args, 1, 2)?;
            let ndigits = args.get(1).cloned().or_else(|| kw.remove("ndigits"));
            round(&args[0], ndigits.as_ref())
        }
        "sorted" => {
            let kw = take_kwarg(name, kwargs, &["reverse"])?;
            arity(name, &args, 1, 1)?;
            let mut items = iterate(&args[0])?;
            sort_values(&mut items)?;
            if kw.get("reverse").map(is_truthy).unwrap_or(false) {
                items.reverse();
            }
            Ok(Value::Array(items))
        }
        "reversed" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let mut items = iterate(&args[0])?;
            items.reverse();
            Ok(Value::Array(items))
        }
        "enumerate" => {
            let mut kw = take_kwarg(name, kwargs, &["start"])?;
            arity(name, &args, 1, 2)?;
            let start = match args.get(1).cloned().or_else(|| kw.remove("start")) {
                Some(v) => as_index(&v, "enumerate() start")?,
                None => 0,
            };
            let items = iterate(&args[0])?
                .into_iter()
                .enumerate()
                .map(|(i, v)| {
                    let n = start
                        .checked_add(i as i64)
                        .ok_or_else(|| error::overflow("integer overflow in enumerate()"))?;
                    Ok(Value::Array(vec![int(n), v]))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        "zip" => {
            no_kwargs(name, &kwargs)?;
            let columns = args.iter().map(iterate).collect::<Result<Vec<_>>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::Array(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::Array(rows))
        }
        "any" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterate(&args[0])?.iter().any(is_truthy)))
        }
        "all" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterate(&args[0])?.iter().all(is_truthy)))
        }
        other => Err(error::name_error(other)),
    }
}

fn to_int(args: &[Value]) -> Result<Value> {
    let Some(v) = args.first() else {
        return Ok(int(0));
    };
    if let Some(base) = args.get(1) {
        let s = expect_str(v, "int() with an explicit base")?;
        let base = as_index(base, "int() base")?;
        if !(2..=36).contains(&base) {
            return Err(error::value_error("int() base must be >= 2 and <= 36"));
        }
        return i64::from_str_radix(s.trim(), base as u32)
            .map(int)
            .map_err(|_| {
                error::value_error(format!(
                    "invalid literal for int() with base {}: {}",
                    base,
                    repr(v)
                ))
            });
    }
    match v {
        Value::String(s) => s.trim().replace('_', "").parse::<i64>().map(int).map_err(|_| {
            error::value_error(format!(
                "invalid literal for int() with base 10: {}",
                repr(v)
            ))
        }),
        other => match expect_num(other, "int() argument")? {
            Num::Int(i) => Ok(int(i)),
            Num::Float(f) => {
                let t = f.trunc();
                if t < i64::MIN as f64 || t >= i64::MAX as f64 {
                    return Err(error::overflow("float too large to convert to int"));
                }
                Ok(int(t as i64))
            }
        },
    }
}

fn to_float(v: Option<&Value>) -> Result<Value> {
    match v {
        None => float(0.0),
        Some(Value::String(s)) => {
            let parsed = s.trim().parse::<f64>().map_err(|_| {
                error::value_error(format!("could not convert string to float: {}", repr(&Value::String(s.clone()))))
            })?;
            float(parsed)
        }
        Some(other) => float(expect_num(other, "float() argument")?.as_f64()),
    }
}

fn range(args: &[Value]) -> Result<Value> {
    let nums = args
        .iter()
        .map(|a| as_index(a, "range() argument"))
        .collect::<Result<Vec<_>>>()?;
    let (start, stop, step) = match nums.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(error::type_error("range expected at most 3 arguments")),
    };
    if step == 0 {
        return Err(error::value_error("range() arg 3 must not be zero"));
    }
    let span = if step > 0 {
        (stop as i128 - start as i128 + step as i128 - 1) / step as i128
    } else {
        (start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))
    };
    let len = span.max(0) as usize;
    if len > MAX_SEQUENCE_LEN {
        return Err(error::forbidden(format!(
            "range of {} items exceeds the sandbox limit of {}",
            len, MAX_SEQUENCE_LEN
        )));
    }
    Ok(Value::Array(
        (0..len as i64)
            .map(|i| {
                i.checked_mul(step)
                    .and_then(|off| start.checked_add(off))
                    .map(int)
                    .ok_or_else(|| error::overflow("integer overflow in range()"))
            })
            .collect::<Result<Vec<_>>>()?,
    ))
}

fn min_max(name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let mut kw = take_kwarg(name, kwargs, &["default"])?;
    if args.is_empty() {
        return Err(error::type_error(format!(
            "{} expected at least 1 argument, got 0",
            name
        )));
    }
    let items = if args.len() == 1 {
        iterate(&args[0])?
    } else {
        args
    };
    let want = if name == "min" {
        Ordering::Less
    } else {
        Ordering::Greater
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                if order(&item, &current)? == want {
                    item
                } else {
                    current
                }
            }
        });
    }
    match best.or_else(|| kw.remove("default")) {
        Some(v) => Ok(v),
        None => Err(error::value_error(format!(
            "{}() arg is an empty sequence",
            name
        ))),
    }
}

fn round(v: &Value, ndigits: Option<&Value>) -> Result<Value> {
    let n = match ndigits {
        None | Some(Value::Null) => None,
        Some(d) => Some(as_index(d, "round() ndigits")?),
    };
    match (expect_num(v, "round() argument")?, n) {
        (Num::Int(i), _) => Ok(int(i)),
        (Num::Float(f), None) => {
            let r = f.round_ties_even();
            if !r.is_finite() || r < i64::MIN as f64 || r >= i64::MAX as f64 {
                return Err(error::overflow("cannot convert float to integer"));
            }
            Ok(int(r as i64))
        }
        (Num::Float(f), Some(d)) => {
            let factor = 10f64.powi(d.clamp(-308, 308) as i32);
            float((f * factor).round_ties_even() / factor)
        }
    }
}

/// Stable sort using Python ordering; the first comparison error wins
pub(crate) fn sort_values(items: &mut [Value]) -> Result<()> {
    let mut failure = None;
    items.sort_by(|a, b| {
        order(a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================================================================
// Methods
// =============================================================================

/// Methods that change their receiver
pub(crate) fn is_mutating(method: &str) -> bool {
    matches!(
        method,
        "append"
            | "extend"
            | "insert"
            | "pop"
            | "remove"
            | "clear"
            | "sort"
            | "reverse"
            | "update"
            | "setdefault"
    )
}

pub(crate) fn call_method(
    receiver: &mut Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value> {
    match receiver {
        Value::String(s) => str_method(s, method, args, kwargs),
        Value::Array(items) => list_method(items, method, args, kwargs),
        Value::Object(map) => dict_method(map, method, args, kwargs),
        other => Err(error::attribute_error(type_name(other), method)),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let qualified = format!("str.{}", method);
    let name = qualified.as_str();
    if method != "format" && method != "split" {
        no_kwargs(name, &kwargs)?;
    }
    let text = |v: String| Ok(Value::String(v));
    match method {
        "upper" => text(s.to_uppercase()),
        "lower" => text(s.to_lowercase()),
        "title" => text(title_case(s)),
        "capitalize" => {
            let mut chars = s.chars();
            text(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(name, &args, 0, 1)?;
            let set: Option<Vec<char>> = match args.first() {
                Some(Value::Null) | None => None,
                Some(v) => Some(expect_str(v, "strip chars")?.chars().collect()),
            };
            let matches = |c: char| match &set {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            text(match method {
                "strip" => s.trim_matches(matches).to_string(),
                "lstrip" => s.trim_start_matches(matches).to_string(),
                _ => s.trim_end_matches(matches).to_string(),
            })
        }
        "split" => {
            let mut kw = take_kwarg(name, kwargs, &["sep", "maxsplit"])?;
            arity(name, &args, 0, 2)?;
            let sep = args.first().cloned().or_else(|| kw.remove("sep"));
            let maxsplit = match args.get(1).cloned().or_else(|| kw.remove("maxsplit")) {
                Some(v) => as_index(&v, "maxsplit")?,
                None => -1,
            };
            let parts: Vec<String> = match sep {
                None | Some(Value::Null) => {
                    if maxsplit < 0 {
                        s.split_whitespace().map(str::to_string).collect()
                    } else {
                        split_whitespace_n(s, maxsplit as usize)
                    }
                }
                Some(v) => {
                    let sep = expect_str(&v, "separator")?;
                    if sep.is_empty() {
                        return Err(error::value_error("empty separator"));
                    }
                    if maxsplit < 0 {
                        s.split(sep).map(str::to_string).collect()
                    } else {
                        s.splitn((maxsplit as usize).saturating_add(1), sep).map(str::to_string).collect()
                    }
                }
            };
            Ok(Value::Array(parts.into_iter().map(Value::String).collect()))
        }
        "splitlines" => Ok(Value::Array(
            s.lines().map(|l| Value::String(l.to_string())).collect(),
        )),
        "join" => {
            arity(name, &args, 1, 1)?;
            let items = iterate(&args[0])?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(p) => parts.push(p.as_str()),
                    other => {
                        return Err(error::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            type_name(other)
                        )))
                    }
                }
            }
            text(parts.join(s))
        }
        "replace" => {
            arity(name, &args, 2, 3)?;
            let old = expect_str(&args[0], "old")?;
            let new = expect_str(&args[1], "new")?;
            match args.get(2) {
                Some(count) => {
                    let count = as_index(count, "count")?;
                    if count < 0 {
                        text(s.replace(old, new))
                    } else {
                        text(s.replacen(old, new, count as usize))
                    }
                }
                None => text(s.replace(old, new)),
            }
        }
        "startswith" | "endswith" => {
            arity(name, &args, 1, 1)?;
            let candidates = match &args[0] {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for c in &candidates {
                let c = expect_str(c, "prefix")?;
                hit |= if method == "startswith" {
                    s.starts_with(c)
                } else {
                    s.ends_with(c)
                };
            }
            Ok(Value::Bool(hit))
        }
        "find" | "index" | "count" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_str(&args[0], "substring")?;
            if method == "count" {
                let n = if needle.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(needle).count()
                };
                return Ok(int(n as i64));
            }
            match s.find(needle) {
                Some(byte) => Ok(int(s[..byte].chars().count() as i64)),
                None if method == "find" => Ok(int(-1)),
                None => Err(error::value_error("substring not found")),
            }
        }
        "isdigit" => Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))),
        "isalpha" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "isalnum" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric))),
        "isspace" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_whitespace))),
        "zfill" => {
            arity(name, &args, 1, 1)?;
            let width = as_index(&args[0], "width")?.max(0) as usize;
            if width > MAX_SEQUENCE_LEN {
                return Err(error::forbidden(format!(
                    "zfill width {} exceeds the sandbox limit of {}",
                    width, MAX_SEQUENCE_LEN
                )));
            }
            let len = s.chars().count();
            if len >= width {
                return text(s.to_string());
            }
            let (sign, digits) = match s.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", s),
            };
            text(format!("{}{}{}", sign, "0".repeat(width - len), digits))
        }
        "format" => text(str_format(s, &args, &kwargs)?),
        _ => Err(error::attribute_error("str", method)),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

fn split_whitespace_n(s: &str, maxsplit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if parts.len() == maxsplit {
            parts.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }
    parts
}

fn list_method(items: &mut Vec<Value>, method: &str, mut args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let qualified = format!("list.{}", method);
    let name = qualified.as_str();
    if method != "sort" {
        no_kwargs(name, &kwargs)?;
    }
    match method {
        "append" => {
            arity(name, &args, 1, 1)?;
            if items.len() >= MAX_SEQUENCE_LEN {
                return Err(error::forbidden("list exceeds the sandbox size limit"));
            }
            items.extend(args.pop());
            Ok(Value::Null)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let more = iterate(&args[0])?;
            if items.len() + more.len() > MAX_SEQUENCE_LEN {
                return Err(error::forbidden("list exceeds the sandbox size limit"));
            }
            items.extend(more);
            Ok(Value::Null)
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let len = items.len() as i64;
            let i = as_index(&args[0], "insert index")?;
            let pos = if i < 0 { (i + len).max(0) } else { i.min(len) } as usize;
            let value = args.pop().unwrap_or(Value::Null);
            items.insert(pos, value);
            Ok(Value::Null)
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            if items.is_empty() {
                return Err(error::index_error("pop from empty list"));
            }
            let pos = match args.first() {
                Some(i) => list_position(items, i)
                    .map_err(|_| error::index_error("pop index out of range"))?,
                None => items.len() - 1,
            };
            Ok(items.remove(pos))
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            match items.iter().position(|x| values_equal(x, &args[0])) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(Value::Null)
                }
                None => Err(error::value_error("list.remove(x): x not in list")),
            }
        }
        "index" => {
            arity(name, &args, 1, 1)?;
            items
                .iter()
                .position(|x| values_equal(x, &args[0]))
                .map(|p| int(p as i64))
                .ok_or_else(|| error::value_error(format!("{} is not in list", repr(&args[0]))))
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            Ok(int(items.iter().filter(|x| values_equal(x, &args[0])).count() as i64))
        }
        "sort" => {
            let kw = take_kwarg(name, kwargs, &["reverse"])?;
            arity(name, &args, 0, 0)?;
            sort_values(items)?;
            if kw.get("reverse").map(is_truthy).unwrap_or(false) {
                items.reverse();
            }
            Ok(Value::Null)
        }
        "reverse" => {
            arity(name, &args, 0, 0)?;
            items.reverse();
            Ok(Value::Null)
        }
        "copy" => Ok(Value::Array(items.clone())),
        "clear" => {
            items.clear();
            Ok(Value::Null)
        }
        _ => Err(error::attribute_error("list", method)),
    }
}

fn dict_method(
    map: &mut Map<String, Value>,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value> {
    let qualified = format!("dict.{}", method);
    let name = qualified.as_str();
    if method != "update" {
        no_kwargs(name, &kwargs)?;
    }
    match method {
        "get" => {
            arity(name, &args, 1, 2)?;
            let found = match &args[0] {
                Value::String(k) => map.get(k).cloned(),
                _ => None,
            };
            Ok(found.or_else(|| args.get(1).cloned()).unwrap_or(Value::Null))
        }
        "keys" => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        "values" => Ok(Value::Array(map.values().cloned().collect())),
        "items" => Ok(Value::Array(
            map.iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        "update" => {
            arity(name, &args, 0, 1)?;
            if let Some(other) = args.first() {
                let other = match other {
                    Value::Object(m) => m.clone(),
                    v => dict_from_pairs(iterate(v)?)?,
                };
                map.extend(other);
            }
            map.extend(kwargs);
            Ok(Value::Null)
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            let key = dict_key(&args[0])?;
            match map.shift_remove(&key) {
                Some(v) => Ok(v),
                None => args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| error::key_error(repr(&args[0]))),
            }
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            let key = dict_key(&args[0])?;
            let default = args.get(1).cloned().unwrap_or(Value::Null);
            Ok(map.entry(key).or_insert(default).clone())
        }
        "copy" => Ok(Value::Object(map.clone())),
        "clear" => {
            map.clear();
            Ok(Value::Null)
        }
        _ => Err(error::attribute_error("dict", method)),
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// `str.format` with `{}`, `{0}` and `{name}` fields
fn str_format(template: &str, args: &[Value], kwargs: &Kwargs) -> Result<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(error::value_error(
                                "expected '}' before end of string",
                            ))
                        }
                    }
                }
                let (key, spec) = match field.split_once(':') {
                    Some((k, s)) => (k.to_string(), Some(s.to_string())),
                    None => (field, None),
                };
                let value = if key.is_empty() {
                    let v = args.get(auto).ok_or_else(|| {
                        error::index_error("replacement index out of range for positional args")
                    })?;
                    auto += 1;
                    v
                } else if let Ok(i) = key.parse::<usize>() {
                    args.get(i).ok_or_else(|| {
                        error::index_error(format!("replacement index {} out of range", i))
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, v)| v)
                        .ok_or_else(|| error::key_error(format!("'{}'", key)))?
                };
                out.push_str(&format_value(value, spec.as_deref())?);
            }
            '}' => return Err(error::value_error("single '}' encountered in format string")),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Apply a format spec: `[[fill]align][,][width][.precision][type]`
pub(crate) fn format_value(value: &Value, spec: Option<&str>) -> Result<String> {
    let spec = match spec {
        None | Some("") => return Ok(to_display(value)),
        Some(s) => s,
    };
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^');
    let (mut fill, mut align) = (' ', None);
    if chars.len() >= 2 && is_align(chars[1]) {
        fill = chars[0];
        align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        align = Some(chars[0]);
        i = 1;
    }
    if chars.get(i) == Some(&'0') && align.is_none() {
        fill = '0';
        align = Some('>');
        i += 1;
    }
    let mut width = 0usize;
    while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
        width = width
            .checked_mul(10)
            .and_then(|w| w.checked_add(d as usize))
            .filter(|w| *w <= MAX_SEQUENCE_LEN)
            .ok_or_else(|| error::value_error("format width too large"))?;
        i += 1;
    }
    let grouping = chars.get(i) == Some(&',');
    if grouping {
        i += 1;
    }
    let mut precision = None;
    if chars.get(i) == Some(&'.') {
        i += 1;
        let mut p = 0usize;
        while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
            p = p
                .checked_mul(10)
                .and_then(|v| v.checked_add(d as usize))
                .filter(|v| *v <= MAX_SEQUENCE_LEN)
                .ok_or_else(|| error::value_error("format precision too large"))?;
            i += 1;
        }
        precision = Some(p);
    }
    let ty = chars.get(i).copied();
    if chars.len() > i + 1 {
        return Err(error::value_error(format!("invalid format specifier '{}'", spec)));
    }

    let body = match ty {
        Some('f') | Some('F') | Some('%') => {
            let mut x = expect_num(value, "format argument")?.as_f64();
            if ty == Some('%') {
                x *= 100.0;
            }
            let mut s = format!("{:.*}", precision.unwrap_or(6), x);
            if grouping {
                s = group_thousands(&s);
            }
            if ty == Some('%') {
                s.push('%');
            }
            s
        }
        Some('d') => match as_num(value) {
            Some(Num::Int(n)) => {
                let s = n.to_string();
                if grouping {
                    group_thousands(&s)
                } else {
                    s
                }
            }
            _ => {
                return Err(error::value_error(format!(
                    "unknown format code 'd' for object of type '{}'",
                    type_name(value)
                )))
            }
        },
        Some('s') | None => match (as_num(value), precision) {
            (Some(Num::Float(f)), Some(p)) if ty.is_none() => format!("{:.*}", p, f),
            (Some(Num::Int(n)), _) if grouping => group_thousands(&n.to_string()),
            (_, Some(p)) if value.is_string() => to_display(value).chars().take(p).collect(),
            _ => to_display(value),
        },
        Some(other) => {
            return Err(error::value_error(format!(
                "unknown format code '{}' for object of type '{}'",
                other,
                type_name(value)
            )))
        }
    };

    let len = body.chars().count();
    if len >= width {
        return Ok(body);
    }
    let pad = width - len;
    let align = align.unwrap_or(if value.is_string() { '<' } else { '>' });
    let fill_str = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    Ok(match align {
        '<' => format!("{}{}", body, fill_str(pad)),
        '^' => format!("{}{}{}", fill_str(pad / 2), body, fill_str(pad - pad / 2)),
        _ => format!("{}{}", fill_str(pad), body),
    })
}

fn group_thousands(s: &str) -> String {
    let (sign, rest) = match s.strip_prefix('-') {
        Some(r) => ("-", r),
        None => ("", s),
    };
    let (int_part, frac) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };
    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    match frac {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}

// =============================================================================
// math
// =============================================================================

pub(crate) const MATH_CONSTANTS: &[&str] = &["pi", "e", "tau"];

pub(crate) const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "floor", "ceil", "trunc", "log", "log10", "log2", "exp", "pow", "sin", "cos", "tan",
    "asin", "acos", "atan", "atan2", "hypot", "fabs", "factorial", "gcd", "isclose",
];

pub(crate) fn math_constant(name: &str) -> Option<Value> {
    let v = match name {
        "pi" => std::f64::consts::PI,
        "e" => std::f64::consts::E,
        "tau" => std::f64::consts::TAU,
        _ => return None,
    };
    float(v).ok()
}

pub(crate) fn call_math(name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let qualified = format!("math.{}", name);
    let fname = qualified.as_str();
    no_kwargs(fname, &kwargs)?;
    let domain = || error::value_error("math domain error");
    let x = |i: usize| -> Result<f64> { Ok(expect_num(&args[i], fname)?.as_f64()) };

    match name {
        "floor" | "ceil" | "trunc" => {
            arity(fname, &args, 1, 1)?;
            if let Some(Num::Int(i)) = as_num(&args[0]) {
                return Ok(int(i));
            }
            let v = x(0)?;
            let r = match name {
                "floor" => v.floor(),
                "ceil" => v.ceil(),
                _ => v.trunc(),
            };
            if !r.is_finite() || r < i64::MIN as f64 || r >= i64::MAX as f64 {
                return Err(error::overflow("cannot convert float to integer"));
            }
            Ok(int(r as i64))
        }
        "factorial" => {
            arity(fname, &args, 1, 1)?;
            let n = as_index(&args[0], "factorial() argument")?;
            if n < 0 {
                return Err(error::value_error("factorial() not defined for negative values"));
            }
            let mut acc: i64 = 1;
            for k in 2..=n {
                acc = acc
                    .checked_mul(k)
                    .ok_or_else(|| error::overflow("factorial result too large"))?;
            }
            Ok(int(acc))
        }
        "gcd" => {
            let mut acc: i64 = 0;
            for a in &args {
                let mut b = as_index(a, "gcd() argument")?.unsigned_abs();
                let mut g = acc.unsigned_abs();
                while b != 0 {
                    (g, b) = (b, g % b);
                }
                acc = i64::try_from(g).map_err(|_| error::overflow("gcd result too large"))?;
            }
            Ok(int(acc))
        }
        "isclose" => {
            arity(fname, &args, 2, 2)?;
            let (a, b) = (x(0)?, x(1)?);
            let tol = 1e-9 * a.abs().max(b.abs());
            Ok(Value::Bool((a - b).abs() <= tol))
        }
        "sqrt" | "log10" | "log2" | "exp" | "sin" | "cos" | "tan" | "asin" | "acos" | "atan"
        | "fabs" => {
            arity(fname, &args, 1, 1)?;
            let v = x(0)?;
            let r = match name {
                "sqrt" if v < 0.0 => return Err(domain()),
                "sqrt" => v.sqrt(),
                "log10" | "log2" if v <= 0.0 => return Err(domain()),
                "log10" => v.log10(),
                "log2" => v.log2(),
                "exp" => v.exp(),
                "sin" => v.sin(),
                "cos" => v.cos(),
                "tan" => v.tan(),
                "asin" | "acos" if !(-1.0..=1.0).contains(&v) => return Err(domain()),
                "asin" => v.asin(),
                "acos" => v.acos(),
                "atan" => v.atan(),
                _ => v.abs(),
            };
            float(r).map_err(|_| error::overflow("math range error"))
        }
        "log" => {
            arity(fname, &args, 1, 2)?;
            let v = x(0)?;
            if v <= 0.0 {
                return Err(domain());
            }
            let r = match args.len() {
                2 => {
                    let base = x(1)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain());
                    }
                    v.ln() / base.ln()
                }
                _ => v.ln(),
            };
            float(r)
        }
        "pow" | "atan2" | "hypot" => {
            arity(fname, &args, 2, 2)?;
            let (a, b) = (x(0)?, x(1)?);
            let r = match name {
                "pow" => a.powf(b),
                "atan2" => a.atan2(b),
                _ => a.hypot(b),
            };
            float(r).map_err(|_| error::overflow("math range error"))
        }
        other => Err(error::attribute_error("module", other)
            .with_context("module", "math")),
    }
}

/// Imported `math` names that are values rather than functions
pub(crate) fn is_math_name(name: &str) -> bool {
    MATH_CONSTANTS.contains(&name) || MATH_FUNCTIONS.contains(&name)
}
