//! Nested-path read/write over a decoded [`Value`], the machinery behind `get-in` and
//! `assoc-in`/`update-in`'s "rest of the path is a nested lookup inside the decoded value"
//! semantics.
//!
//! [`Value`] doesn't derive `PartialEq` (a [`Value::Custom`] can't meaningfully compare by
//! value), so path traversal uses [`values_equal`], a structural comparison that treats any
//! two `Custom` values as unequal — custom types are not expected to appear as map keys on
//! a navigated path.
//!
//! Reading a nested value out of an owned tree without destroying the tree normally means
//! cloning it, but [`Value`] has no general `Clone` (a [`Value::Custom`] payload has no
//! generic way to duplicate itself). [`take_path`] sidesteps this for the two call sites that
//! need an owned copy of a nested leaf — `get-in` and the read side of `update-in` — by moving
//! the value out and leaving a `Value::Nil` placeholder rather than cloning it; this works
//! because both call sites either discard the surrounding tree afterward or are about to
//! overwrite that exact placeholder via [`assoc_path`] anyway. [`CloneValue`] remains for the
//! handful of sites that need to duplicate a whole *store key* (never expected to be a
//! `Value::Custom`) rather than navigate into one.

use konserve_traits::Value;

/// Structural equality over [`Value`], used to find a key inside a [`Value::Map`] while
/// walking a path. Two [`Value::Custom`] values are never equal under this comparison.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int8(x), Value::Int8(y)) => x == y,
        (Value::Int16(x), Value::Int16(y)) => x == y,
        (Value::Int32(x), Value::Int32(y)) => x == y,
        (Value::Int64(x), Value::Int64(y)) => x == y,
        (Value::Float32(x), Value::Float32(y)) => x == y,
        (Value::Float64(x), Value::Float64(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Keyword(x), Value::Keyword(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Uuid(xh, xl), Value::Uuid(yh, yl)) => xh == yh && xl == yl,
        (Value::Instant(x), Value::Instant(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (
            Value::BigDecimal { scale: xs, unscaled: xu },
            Value::BigDecimal { scale: ys, unscaled: yu },
        ) => xs == ys && xu == yu,
        (Value::Ratio { numer: xn, denom: xd }, Value::Ratio { numer: yn, denom: yd }) => {
            xn == yn && xd == yd
        }
        (Value::Int16Array(x), Value::Int16Array(y)) => x == y,
        (Value::Int32Array(x), Value::Int32Array(y)) => x == y,
        (Value::Int64Array(x), Value::Int64Array(y)) => x == y,
        (Value::Float32Array(x), Value::Float32Array(y)) => x == y,
        (Value::Float64Array(x), Value::Float64Array(y)) => x == y,
        (Value::BoolArray(x), Value::BoolArray(y)) => x == y,
        (Value::CharArray(x), Value::CharArray(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) | (Value::Set(x), Value::Set(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(xk, xv)| {
                    y.iter().any(|(yk, yv)| values_equal(xk, yk) && values_equal(xv, yv))
                })
        }
        _ => false,
    }
}

fn map_get<'a>(pairs: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| values_equal(k, key)).map(|(_, v)| v)
}

/// Look up `path` inside `root`, first segment of `path` indexing directly into `root`.
/// Returns `None` as soon as a segment is missing or `root` isn't a [`Value::Map`] at that
/// point.
pub fn get_path<'a>(root: &'a Value, path: &[Value]) -> Option<&'a Value> {
    let Some((head, rest)) = path.split_first() else {
        return Some(root);
    };
    match root {
        Value::Map(pairs) => {
            let next = map_get(pairs, head)?;
            get_path(next, rest)
        }
        _ => None,
    }
}

/// Move the value at `path` out of `root`, leaving a [`Value::Nil`] placeholder behind at
/// that position. Returns the (possibly modified) `root` alongside the moved-out value, or
/// `None` for the latter if any segment is missing or `root` isn't a [`Value::Map`] at that
/// point, in which case `root` comes back unchanged.
///
/// Unlike [`get_path`] paired with [`CloneValue::clone`], this never clones and so never
/// panics on a [`Value::Custom`] leaf: read-modify-write call sites that discard the old
/// structure anyway (they rebuild it from `root` via [`assoc_path`] right after) can use this
/// to hand a transform the old nested value without needing `Value` to be generally cloneable.
pub fn take_path(root: Value, path: &[Value]) -> (Value, Option<Value>) {
    let Some((head, rest)) = path.split_first() else {
        return (Value::Nil, Some(root));
    };
    match root {
        Value::Map(mut pairs) => {
            let Some(idx) = pairs.iter().position(|(k, _)| values_equal(k, head)) else {
                return (Value::Map(pairs), None);
            };
            let nested = std::mem::replace(&mut pairs[idx].1, Value::Nil);
            let (rebuilt, taken) = take_path(nested, rest);
            pairs[idx].1 = rebuilt;
            (Value::Map(pairs), taken)
        }
        other => (other, None),
    }
}

/// Replace the value at `path` inside `root` with `new_value`, creating intermediate
/// [`Value::Map`]s for any segment that doesn't exist yet or whose current value isn't a
/// map — mirroring `assoc-in`'s behavior of building out missing structure rather than
/// failing. `root` is consumed; pass `None` to build a value from scratch.
pub fn assoc_path(root: Option<Value>, path: &[Value], new_value: Value) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return new_value;
    };

    let mut pairs = match root {
        Some(Value::Map(pairs)) => pairs,
        _ => Vec::new(),
    };

    let existing = pairs.iter().position(|(k, _)| values_equal(k, head));
    // Move the sibling's current value out rather than cloning it: `Value::Custom` can't be
    // cloned in general, and a clone would be thrown away immediately below anyway once
    // `nested_new` overwrites it.
    let nested_old = existing.map(|idx| std::mem::replace(&mut pairs[idx].1, Value::Nil));
    let nested_new = assoc_path(nested_old, rest, new_value);

    match existing {
        Some(idx) => pairs[idx].1 = nested_new,
        None => pairs.push((head.clone(), nested_new)),
    }

    Value::Map(pairs)
}

/// Clone just enough of [`Value`] to support [`assoc_path`]'s "read old nested value, build
/// a new one" pattern. [`Value`] doesn't derive `Clone` because cloning a
/// [`Value::Custom`]'s opaque payload has no general answer; this restricts cloning to the
/// subset of variants `assoc_path` actually needs to carry forward (no `Custom` inside a
/// navigated path).
pub trait CloneValue {
    /// Deep-clone, panicking if a [`Value::Custom`] is encountered.
    fn clone(&self) -> Value;
}

impl CloneValue for Value {
    fn clone(&self) -> Value {
        match self {
            Value::Nil => Value::Nil,
            Value::Bool(v) => Value::Bool(*v),
            Value::Int8(v) => Value::Int8(*v),
            Value::Int16(v) => Value::Int16(*v),
            Value::Int32(v) => Value::Int32(*v),
            Value::Int64(v) => Value::Int64(*v),
            Value::Float32(v) => Value::Float32(*v),
            Value::Float64(v) => Value::Float64(*v),
            Value::Str(v) => Value::Str(v.clone()),
            Value::Keyword(v) => Value::Keyword(v.clone()),
            Value::Symbol(v) => Value::Symbol(v.clone()),
            Value::Uuid(h, l) => Value::Uuid(*h, *l),
            Value::Instant(v) => Value::Instant(*v),
            Value::Bytes(v) => Value::Bytes(v.clone()),
            Value::Char(v) => Value::Char(*v),
            Value::BigInt(v) => Value::BigInt(v.clone()),
            Value::BigDecimal { scale, unscaled } => {
                Value::BigDecimal { scale: *scale, unscaled: unscaled.clone() }
            }
            Value::Ratio { numer, denom } => {
                Value::Ratio { numer: numer.clone(), denom: denom.clone() }
            }
            Value::Int16Array(v) => Value::Int16Array(v.clone()),
            Value::Int32Array(v) => Value::Int32Array(v.clone()),
            Value::Int64Array(v) => Value::Int64Array(v.clone()),
            Value::Float32Array(v) => Value::Float32Array(v.clone()),
            Value::Float64Array(v) => Value::Float64Array(v.clone()),
            Value::BoolArray(v) => Value::BoolArray(v.clone()),
            Value::CharArray(v) => Value::CharArray(v.clone()),
            Value::Seq(items) => Value::Seq(items.iter().map(CloneValue::clone).collect()),
            Value::Set(items) => Value::Set(items.iter().map(CloneValue::clone).collect()),
            Value::Map(pairs) => Value::Map(
                pairs.iter().map(|(k, v)| (CloneValue::clone(k), CloneValue::clone(v))).collect(),
            ),
            Value::Custom(_) => panic!("cannot clone a Value::Custom while walking a nested path"),
        }
    }
}

#[cfg(test)]
mod tests {
    use konserve_traits::Keyword;

    use super::*;

    fn kw(name: &str) -> Value {
        Value::Keyword(Keyword::plain(name))
    }

    #[test]
    fn get_path_descends_through_nested_maps() {
        let root = Value::Map(vec![(
            kw("db"),
            Value::Map(vec![(kw("host"), Value::Str("localhost".into()))]),
        )]);
        let found = get_path(&root, &[kw("db"), kw("host")]);
        assert!(matches!(found, Some(Value::Str(s)) if s == "localhost"));
        assert!(get_path(&root, &[kw("missing")]).is_none());
    }

    #[test]
    fn assoc_path_builds_missing_structure() {
        let built = assoc_path(None, &[kw("db"), kw("host")], Value::Str("localhost".into()));
        let found = get_path(&built, &[kw("db"), kw("host")]);
        assert!(matches!(found, Some(Value::Str(s)) if s == "localhost"));
    }

    #[test]
    fn assoc_path_single_segment_replaces_whole_value() {
        let built = assoc_path(Some(Value::Int64(1)), &[], Value::Int64(2));
        assert!(matches!(built, Value::Int64(2)));
    }
}
