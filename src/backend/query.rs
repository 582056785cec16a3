//! Matcher evaluation, projection and ordering over BSON documents.
//!
//! Supported matcher operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$in`, `$nin`, `$exists`, and the logical `$and`, `$or`, `$nor`. Dotted
//! paths descend into sub-documents, numeric segments index arrays, and a
//! condition on an array field matches when any element matches.

use crate::backend::update::{set_path, unset_path};
use crate::error::{Error, Result};
use bson::{Bson, Document};
use std::cmp::Ordering;

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segs = path.split('.');
    let mut cur = doc.get(segs.next()?)?;
    for seg in segs {
        cur = match cur {
            Bson::Document(d) => d.get(seg)?,
            Bson::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Every value reachable at `path`, fanning out through arrays of documents.
fn values_at<'a>(cur: &'a Bson, segs: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push(cur);
        return;
    };
    match cur {
        Bson::Document(d) => {
            if let Some(next) = d.get(*seg) {
                values_at(next, rest, out);
            }
        }
        Bson::Array(arr) => {
            if let Ok(idx) = seg.parse::<usize>() {
                if let Some(next) = arr.get(idx) {
                    values_at(next, rest, out);
                }
            } else {
                for elem in arr {
                    if matches!(elem, Bson::Document(_)) {
                        values_at(elem, segs, out);
                    }
                }
            }
        }
        _ => {}
    }
}

pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in clause_list(key, cond)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in clause_list(key, cond)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in clause_list(key, cond)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            k if k.starts_with('$') => return Err(Error::Backend(format!("unknown top level operator: {}", k))),
            path => field_matches(doc, path, cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clause_list<'a>(op: &str, cond: &'a Bson) -> Result<Vec<&'a Document>> {
    let Bson::Array(items) = cond else {
        return Err(Error::Backend(format!("{} must be an array", op)));
    };
    items
        .iter()
        .map(|b| match b {
            Bson::Document(d) => Ok(d),
            _ => Err(Error::Backend(format!("{} entries must be objects", op))),
        })
        .collect()
}

fn is_operator_doc(cond: &Bson) -> Option<&Document> {
    match cond {
        Bson::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn field_matches(doc: &Document, path: &str, cond: &Bson) -> Result<bool> {
    let root = Bson::Document(doc.clone());
    let segs: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();
    values_at(&root, &segs, &mut found);

    let Some(ops) = is_operator_doc(cond) else {
        return Ok(equals_any(&found, cond));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(&found, arg),
            "$ne" => !equals_any(&found, arg),
            "$gt" => compares_any(&found, arg, |o| o == Ordering::Greater),
            "$gte" => compares_any(&found, arg, |o| o != Ordering::Less),
            "$lt" => compares_any(&found, arg, |o| o == Ordering::Less),
            "$lte" => compares_any(&found, arg, |o| o != Ordering::Greater),
            "$in" => in_list(&found, op, arg)?,
            "$nin" => !in_list(&found, op, arg)?,
            "$exists" => {
                let want = match arg {
                    Bson::Boolean(b) => *b,
                    other => truthy(other),
                };
                want == !found.is_empty()
            }
            other => return Err(Error::Backend(format!("unknown operator: {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals_any(found: &[&Bson], want: &Bson) -> bool {
    if found.is_empty() {
        return matches!(want, Bson::Null);
    }
    found.iter().any(|v| {
        values_equal(v, want)
            || match v {
                Bson::Array(arr) => arr.iter().any(|e| values_equal(e, want)),
                _ => false,
            }
    })
}

fn compares_any(found: &[&Bson], arg: &Bson, pred: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Bson| comparable(v, arg).map(|o| pred(o)).unwrap_or(false);
    found.iter().any(|v| {
        check(v)
            || match v {
                Bson::Array(arr) => arr.iter().any(&check),
                _ => false,
            }
    })
}

fn in_list(found: &[&Bson], op: &str, arg: &Bson) -> Result<bool> {
    let Bson::Array(options) = arg else {
        return Err(Error::Backend(format!("{} needs an array", op)));
    };
    Ok(options.iter().any(|o| equals_any(found, o)))
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn number(b: &Bson) -> Option<f64> {
    match b {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

pub fn truthy(b: &Bson) -> bool {
    match b {
        Bson::Boolean(v) => *v,
        Bson::Null | Bson::Undefined => false,
        other => number(other).map(|n| n != 0.0).unwrap_or(true),
    }
}

/// Canonical cross-type ordering rank.
fn type_rank(b: &Bson) -> u8 {
    match b {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Ordering between two values of the same type class, for range operators.
fn comparable(a: &Bson, b: &Bson) -> Option<Ordering> {
    if type_rank(a) != type_rank(b) || matches!(a, Bson::Document(_) | Bson::Array(_)) {
        return None;
    }
    Some(compare_values(a, b))
}

pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        _ if ra == 2 => {
            let (x, y) = (number(a).unwrap_or(0.0), number(b).unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let o = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (vx, vy) in x.iter().zip(y.iter()) {
                let o = compare_values(vx, vy);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        _ => Ordering::Equal,
    }
}

fn sort_direction(v: &Bson) -> i32 {
    match number(v) {
        Some(n) if n < 0.0 => -1,
        _ => 1,
    }
}

/// Order two documents by a sort specification; keys apply in document order.
pub fn compare_docs(a: &Document, b: &Document, sort: &Document) -> Ordering {
    let null = Bson::Null;
    for (path, dir) in sort {
        let va = get_path(a, path).unwrap_or(&null);
        let vb = get_path(b, path).unwrap_or(&null);
        let mut o = compare_values(va, vb);
        if sort_direction(dir) < 0 {
            o = o.reverse();
        }
        if o != Ordering::Equal {
            return o;
        }
    }
    Ordering::Equal
}

/// Stable sort by a sort specification.
pub fn sort_docs(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| compare_docs(a, b, sort));
}

/// Apply an inclusion or exclusion projection. `_id` is kept unless
/// explicitly excluded.
pub fn project(doc: &Document, keys: &Document) -> Document {
    if keys.is_empty() {
        return doc.clone();
    }
    let mut include_id = true;
    let mut include_mode = false;
    for (k, v) in keys {
        if k == "_id" {
            include_id = truthy(v);
        } else if truthy(v) {
            include_mode = true;
        }
    }

    if include_mode {
        let mut out = Document::new();
        if include_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (k, v) in keys {
            if k == "_id" || !truthy(v) {
                continue;
            }
            if let Some(val) = get_path(doc, k) {
                set_path(&mut out, k, val.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (k, v) in keys {
            if k == "_id" {
                if !include_id {
                    out.remove("_id");
                }
            } else if !truthy(v) {
                unset_path(&mut out, k);
            }
        }
        out
    }
}
