use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub const MAX_TEXT_CHARS: usize = 500;

/// Walk a dotted path (`seller.id`, `address.city_name`) through nested objects.
/// JSON null counts as absent.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = record;
    for key in path.split('.') {
        cur = cur.as_object()?.get(key)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// First alias that holds something other than null or a blank string.
pub fn first<'a>(record: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|p| {
        lookup(record, p).filter(|v| !matches!(v, Value::String(s) if s.trim().is_empty()))
    })
}

/// First alias whose value `f` accepts. An alias holding junk falls through to the next one.
pub fn first_map<T>(record: &Value, paths: &[&str], f: impl Fn(&Value) -> Option<T>) -> Option<T> {
    paths.iter().find_map(|p| lookup(record, p).and_then(&f))
}

/// Scalar to string. Whole floats print without a fractional part so numeric ids stay stable.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn text_field(record: &Value, paths: &[&str]) -> Option<String> {
    first(record, paths).and_then(as_text)
}

pub fn clean_field(record: &Value, paths: &[&str]) -> Option<String> {
    text_field(record, paths).and_then(|t| clean_text(&t))
}

/// Flatten line breaks, collapse whitespace, cap at [`MAX_TEXT_CHARS`] characters.
pub fn clean_text(text: &str) -> Option<String> {
    let flat = WS_RE.replace_all(text, " ");
    let trimmed = flat.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_TEXT_CHARS).collect())
}

/// Number, or a numeric string using either `.` or `,` as decimal mark.
pub fn as_f64(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let t = s.trim();
            let normalized = if t.contains(',') && !t.contains('.') {
                t.replace(',', ".")
            } else {
                t.to_string()
            };
            normalized.parse::<f64>().ok()?
        }
        _ => return None,
    };
    f.is_finite().then_some(f)
}

pub fn as_count(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => parse_grouped_count(s.trim()),
        _ => None,
    };
    n.filter(|n| *n >= 0)
}

/// `1532`, `1.532` or `1,532`. Any group after a separator must be exactly three digits.
fn parse_grouped_count(raw: &str) -> Option<i64> {
    let mut groups = raw.split(['.', ',']);
    let lead = groups.next()?;
    let mut digits = lead.to_string();
    for g in groups {
        if g.len() != 3 {
            return None;
        }
        digits.push_str(g);
    }
    if lead.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
