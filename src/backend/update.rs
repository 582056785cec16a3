//! Update documents: operator updates, replacements and upsert seeding.

use crate::backend::query::{get_path, matches, values_equal};
use crate::error::{Error, Result};
use bson::{Bson, Document};
use std::collections::HashSet;

const OPERATORS: [&str; 6] = ["$set", "$unset", "$inc", "$rename", "$push", "$pull"];

fn seg_is_index(seg: &str) -> Option<usize> {
    seg.parse::<usize>().ok()
}

pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let mut root = Bson::Document(std::mem::take(doc));
    let segments: Vec<&str> = path.split('.').collect();
    set_path_bson(&mut root, &segments, value);
    if let Bson::Document(updated) = root {
        *doc = updated;
    }
}

fn set_path_bson(cur: &mut Bson, segs: &[&str], value: Bson) {
    let Some((seg, rest)) = segs.split_first() else {
        *cur = value;
        return;
    };
    let next_is_index = rest.first().and_then(|s| seg_is_index(s)).is_some();
    let empty_child = || if next_is_index { Bson::Array(Vec::new()) } else { Bson::Document(Document::new()) };
    match (seg_is_index(seg), &mut *cur) {
        (Some(idx), Bson::Array(arr)) => {
            if arr.len() <= idx {
                arr.resize(idx + 1, Bson::Null);
            }
            if rest.is_empty() {
                arr[idx] = value;
            } else {
                if matches!(arr[idx], Bson::Null) {
                    arr[idx] = empty_child();
                }
                set_path_bson(&mut arr[idx], rest, value);
            }
        }
        (_, Bson::Document(d)) => {
            if rest.is_empty() {
                d.insert(seg.to_string(), value);
            } else {
                let entry = d.entry(seg.to_string()).or_insert_with(empty_child);
                set_path_bson(entry, rest, value);
            }
        }
        _ => {
            // Scalar in the way: replace it with a container.
            *cur = if seg_is_index(seg).is_some() { Bson::Array(Vec::new()) } else { Bson::Document(Document::new()) };
            set_path_bson(cur, segs, value);
        }
    }
}

pub fn unset_path(doc: &mut Document, path: &str) {
    let mut root = Bson::Document(std::mem::take(doc));
    let segments: Vec<&str> = path.split('.').collect();
    unset_path_bson(&mut root, &segments);
    if let Bson::Document(updated) = root {
        *doc = updated;
    }
}

fn unset_path_bson(cur: &mut Bson, segs: &[&str]) {
    let Some((seg, rest)) = segs.split_first() else {
        return;
    };
    match cur {
        Bson::Array(arr) => {
            if let Some(idx) = seg_is_index(seg) {
                if idx < arr.len() {
                    if rest.is_empty() {
                        arr[idx] = Bson::Null;
                    } else {
                        unset_path_bson(&mut arr[idx], rest);
                    }
                }
            }
        }
        Bson::Document(d) => {
            if rest.is_empty() {
                d.remove(*seg);
            } else if let Some(child) = d.get_mut(*seg) {
                unset_path_bson(child, rest);
            }
        }
        _ => {}
    }
}

/// True when every top-level key is an update operator.
pub fn is_operator_update(update: &Document) -> Result<bool> {
    let ops = update.keys().filter(|k| k.starts_with('$')).count();
    if ops == 0 {
        return Ok(false);
    }
    if ops != update.len() {
        return Err(Error::Backend("cannot mix update operators and replacement fields".into()));
    }
    Ok(true)
}

/// Apply `update` to `doc` in place. A replacement keeps the original `_id`.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<()> {
    if !is_operator_update(update)? {
        let id = doc.get("_id").cloned();
        let mut replacement = update.clone();
        if let Some(id) = id {
            match replacement.get("_id") {
                Some(new_id) if new_id != &id => {
                    return Err(Error::Backend("the _id field cannot be changed by an update".into()));
                }
                _ => {
                    replacement.insert("_id", id);
                }
            }
        }
        *doc = replacement;
        return Ok(());
    }

    for (op, spec) in update {
        if !OPERATORS.contains(&op.as_str()) {
            return Err(Error::Backend(format!("unsupported update operator: {}", op)));
        }
        let Bson::Document(fields) = spec else {
            return Err(Error::Backend(format!("{} expects a document", op)));
        };
        if fields.keys().any(|k| k == "_id") && op != "$pull" && op != "$push" {
            return Err(Error::Backend("the _id field cannot be changed by an update".into()));
        }
        match op.as_str() {
            "$set" => {
                for (k, v) in fields {
                    set_path(doc, k, v.clone());
                }
            }
            "$unset" => {
                for k in fields.keys() {
                    unset_path(doc, k);
                }
            }
            "$inc" => {
                for (k, v) in fields {
                    apply_inc(doc, k, v)?;
                }
            }
            "$rename" => apply_renames(doc, fields)?,
            "$push" => {
                for (k, v) in fields {
                    apply_push(doc, k, v)?;
                }
            }
            "$pull" => {
                for (k, v) in fields {
                    apply_pull(doc, k, v)?;
                }
            }
            _ => unreachable!("filtered by OPERATORS"),
        }
    }
    Ok(())
}

fn checked_inc(path: &str, a: i64, b: i64) -> Result<i64> {
    a.checked_add(b)
        .ok_or_else(|| Error::Backend(format!("$inc on {} would overflow a 64-bit integer", path)))
}

fn apply_inc(doc: &mut Document, path: &str, delta: &Bson) -> Result<()> {
    let sum = match (get_path(doc, path), delta) {
        (None, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => delta.clone(),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(n) => Bson::Int32(n),
            None => Bson::Int64(*a as i64 + *b as i64),
        },
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(checked_inc(path, *a as i64, *b)?),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(checked_inc(path, *a, *b as i64)?),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(checked_inc(path, *a, *b)?),
        (Some(Bson::Double(a)), Bson::Int32(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Double(a)), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (Some(Bson::Int32(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        (Some(Bson::Int64(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        (_, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => {
            return Err(Error::Backend(format!("cannot apply $inc to non-numeric field {}", path)));
        }
        _ => return Err(Error::Backend("$inc requires a numeric value".into())),
    };
    set_path(doc, path, sum);
    Ok(())
}

fn is_ancestor_path(a: &str, b: &str) -> bool {
    b.starts_with(a) && (b.len() == a.len() || b.as_bytes().get(a.len()) == Some(&b'.'))
}

fn apply_renames(doc: &mut Document, fields: &Document) -> Result<()> {
    let mut targets: HashSet<&str> = HashSet::new();
    for (from, to) in fields {
        let Bson::String(to) = to else {
            return Err(Error::Backend("$rename target must be a string path".into()));
        };
        if from == to {
            return Err(Error::Backend("$rename source and target must differ".into()));
        }
        if is_ancestor_path(from, to) || is_ancestor_path(to, from) {
            return Err(Error::Backend("$rename cannot target an ancestor or descendant path".into()));
        }
        if !targets.insert(to.as_str()) {
            return Err(Error::Backend("$rename has a duplicate target path".into()));
        }
    }
    for (from, to) in fields {
        if let (Some(val), Bson::String(to)) = (get_path(doc, from).cloned(), to) {
            unset_path(doc, from);
            set_path(doc, to, val);
        }
    }
    Ok(())
}

fn apply_push(doc: &mut Document, path: &str, val: &Bson) -> Result<()> {
    let mut arr = match get_path(doc, path) {
        None => Vec::new(),
        Some(Bson::Array(a)) => a.clone(),
        Some(_) => return Err(Error::Backend(format!("cannot $push to non-array field {}", path))),
    };
    match val {
        Bson::Document(spec) if spec.contains_key("$each") => {
            let each = spec
                .get_array("$each")
                .map_err(|_| Error::Backend("$each must be an array".into()))?;
            let at = match spec.get("$position") {
                Some(p) => bson_int(p).ok_or_else(|| Error::Backend("$position must be an integer".into()))?,
                None => arr.len() as i64,
            };
            let at = if at < 0 { (arr.len() as i64 + at).max(0) } else { at.min(arr.len() as i64) } as usize;
            arr.splice(at..at, each.iter().cloned());
            if let Some(s) = spec.get("$slice") {
                let n = bson_int(s).ok_or_else(|| Error::Backend("$slice must be an integer".into()))?;
                if n >= 0 {
                    arr.truncate(n as usize);
                } else {
                    let keep = n.unsigned_abs() as usize;
                    if arr.len() > keep {
                        arr.drain(0..arr.len() - keep);
                    }
                }
            }
        }
        other => arr.push(other.clone()),
    }
    set_path(doc, path, Bson::Array(arr));
    Ok(())
}

fn apply_pull(doc: &mut Document, path: &str, criterion: &Bson) -> Result<()> {
    let Some(Bson::Array(arr)) = get_path(doc, path) else {
        return Ok(());
    };
    let mut kept = Vec::with_capacity(arr.len());
    for elem in arr {
        if !pull_matches(elem, criterion)? {
            kept.push(elem.clone());
        }
    }
    set_path(doc, path, Bson::Array(kept));
    Ok(())
}

fn pull_matches(elem: &Bson, criterion: &Bson) -> Result<bool> {
    match criterion {
        Bson::Document(c) if c.keys().all(|k| k.starts_with('$')) && !c.is_empty() => {
            let wrapped = bson::doc! { "v": elem.clone() };
            let mut cond = Document::new();
            cond.insert("v", Bson::Document(c.clone()));
            matches(&wrapped, &cond)
        }
        Bson::Document(c) => match elem {
            Bson::Document(e) => matches(e, c),
            _ => Ok(false),
        },
        other => Ok(values_equal(elem, other)),
    }
}

fn bson_int(b: &Bson) -> Option<i64> {
    match b {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

/// Starting document for an upsert: the plain equality fields of `criteria`.
pub fn upsert_seed(criteria: &Document) -> Document {
    let mut seed = Document::new();
    for (k, v) in criteria {
        if k.starts_with('$') {
            continue;
        }
        match v {
            Bson::Document(d) if d.keys().any(|op| op.starts_with('$')) => {
                if let Some(eq) = d.get("$eq") {
                    set_path(&mut seed, k, eq.clone());
                }
            }
            other => set_path(&mut seed, k, other.clone()),
        }
    }
    seed
}
