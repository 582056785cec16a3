//! Filter and sort translation to PostgreSQL over the `doc jsonb` column.
//!
//! Scalar comparisons become `jsonb_path_exists` predicates (lax mode, so a
//! path that lands on an array also tests its elements). Equality against
//! documents, arrays and extended types falls back to `@>` containment. A
//! plain `_id` equality uses the primary key.

use crate::error::{Error, Result};
use bson::{Bson, Document, doc};

pub fn build_where(filter: &Document) -> Result<String> {
    let mut clauses: Vec<String> = Vec::new();
    for (key, cond) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let subs = sub_filters(key, cond)?;
                if subs.is_empty() {
                    return Err(Error::Backend(format!("{} must be a nonempty array", key)));
                }
                let parts = subs.iter().map(|d| build_where(d).map(|w| format!("({})", w))).collect::<Result<Vec<_>>>()?;
                clauses.push(match key.as_str() {
                    "$and" => parts.join(" AND "),
                    "$or" => format!("({})", parts.join(" OR ")),
                    _ => format!("NOT ({})", parts.join(" OR ")),
                });
            }
            k if k.starts_with('$') => return Err(Error::Backend(format!("unknown top level operator: {}", k))),
            "_id" if !is_operator_doc(cond) => clauses.push(format!("id = {}", id_literal(cond)?)),
            path => clauses.push(field_clause(path, cond)?),
        }
    }
    if clauses.is_empty() {
        Ok(String::from("TRUE"))
    } else {
        Ok(clauses.join(" AND "))
    }
}

fn sub_filters<'a>(op: &str, cond: &'a Bson) -> Result<Vec<&'a Document>> {
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

fn is_operator_doc(cond: &Bson) -> bool {
    matches!(cond, Bson::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')))
}

fn field_clause(path: &str, cond: &Bson) -> Result<String> {
    let Bson::Document(ops) = cond else {
        return Ok(eq_clause(path, cond));
    };
    if !is_operator_doc(cond) {
        return Ok(eq_clause(path, cond));
    }
    let jp = jsonpath_path(path);
    let mut parts = Vec::new();
    for (op, arg) in ops {
        let clause = match op.as_str() {
            "$eq" => eq_clause(path, arg),
            "$ne" => format!("NOT {}", eq_clause(path, arg)),
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let sym = match op.as_str() {
                    "$gt" => ">",
                    "$gte" => ">=",
                    "$lt" => "<",
                    _ => "<=",
                };
                let lit = json_literal(arg)
                    .ok_or_else(|| Error::Backend(format!("{} needs a number, string or boolean", op)))?;
                path_exists(&format!("{} ? (@ {} {})", jp, sym, lit))
            }
            "$in" | "$nin" => {
                let Bson::Array(options) = arg else {
                    return Err(Error::Backend(format!("{} needs an array", op)));
                };
                let any = if options.is_empty() {
                    "FALSE".to_string()
                } else {
                    let eqs: Vec<String> = options.iter().map(|o| eq_clause(path, o)).collect();
                    format!("({})", eqs.join(" OR "))
                };
                if op == "$in" { any } else { format!("NOT {}", any) }
            }
            "$exists" => {
                let want = match arg {
                    Bson::Boolean(b) => *b,
                    Bson::Int32(n) => *n != 0,
                    Bson::Int64(n) => *n != 0,
                    Bson::Double(f) => *f != 0.0,
                    Bson::Null => false,
                    _ => true,
                };
                let exists = path_exists(&jp);
                if want { exists } else { format!("NOT {}", exists) }
            }
            other => return Err(Error::Backend(format!("unknown operator: {}", other))),
        };
        parts.push(clause);
    }
    Ok(parts.join(" AND "))
}

/// Equality, with `null` also matching a missing field.
fn eq_clause(path: &str, value: &Bson) -> String {
    let jp = jsonpath_path(path);
    match value {
        Bson::Null => format!(
            "(NOT {} OR {})",
            path_exists(&jp),
            path_exists(&format!("{} ? (@ == null)", jp))
        ),
        other => match json_literal(other) {
            Some(lit) => path_exists(&format!("{} ? (@ == {})", jp, lit)),
            None => containment(path, other),
        },
    }
}

fn containment(path: &str, value: &Bson) -> String {
    let mut nested = value.clone().into_relaxed_extjson();
    for seg in path.rsplit('.') {
        let mut m = serde_json::Map::new();
        m.insert(seg.to_string(), nested);
        nested = serde_json::Value::Object(m);
    }
    format!("doc @> '{}'::jsonb", escape_single(&nested.to_string()))
}

fn path_exists(jsonpath: &str) -> String {
    format!("jsonb_path_exists(doc, '{}')", escape_single(jsonpath))
}

pub fn jsonpath_path(key: &str) -> String {
    let mut out = String::from("$");
    for seg in key.split('.') {
        if seg.parse::<usize>().is_ok() {
            out.push('[');
            out.push_str(seg);
            out.push(']');
            continue;
        }
        let esc = seg.replace('\\', "\\\\").replace('"', "\\\"");
        out.push_str(".\"");
        out.push_str(&esc);
        out.push('"');
    }
    out
}

/// A jsonpath literal for scalars that compare the same way in jsonb.
pub fn json_literal(v: &Bson) -> Option<String> {
    match v {
        Bson::Null => Some("null".to_string()),
        Bson::Boolean(b) => Some(b.to_string()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(f) if f.is_finite() => Some(f.to_string()),
        Bson::String(s) => serde_json::to_string(s).ok(),
        _ => None,
    }
}

/// Primary key bytes for an `_id`: the BSON encoding of `{_id: value}`.
pub fn id_bytes(id: &Bson) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc! { "_id": id.clone() }
        .to_writer(&mut buf)
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(buf)
}

fn id_literal(id: &Bson) -> Result<String> {
    let hex: String = id_bytes(id)?.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("decode('{}', 'hex')", hex))
}

pub fn build_order_by(sort: Option<&Document>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut has_id = false;
    if let Some(spec) = sort {
        for (k, v) in spec {
            let desc = match v {
                Bson::Int32(n) => *n < 0,
                Bson::Int64(n) => *n < 0,
                Bson::Double(f) => *f < 0.0,
                _ => false,
            };
            let ord = if desc { "DESC NULLS LAST" } else { "ASC NULLS FIRST" };
            if k == "_id" {
                has_id = true;
            }
            let segs: Vec<String> = k.split('.').map(|s| s.replace('\\', "\\\\").replace('"', "\\\"")).collect();
            let pg_path = format!("{{\"{}\"}}", segs.join("\",\""));
            parts.push(format!("doc #> '{}' {}", escape_single(&pg_path), ord));
        }
    }
    if !has_id {
        parts.push("id ASC".to_string());
    }
    format!("ORDER BY {}", parts.join(", "))
}

pub fn escape_single(s: &str) -> String {
    s.replace('\'', "''")
}
