use mongodb::bson::{doc, Bson, Document};
use time::OffsetDateTime;

/* ================== Time ================== */

pub fn now_iso_rfc3339() -> String {
    fmt_rfc3339(OffsetDateTime::now_utc())
}

pub fn fmt_rfc3339(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// UTC, whole seconds: stored instants compare correctly as strings.
pub fn fmt_rfc3339_secs(t: OffsetDateTime) -> String {
    let utc = t.to_offset(time::UtcOffset::UTC);
    fmt_rfc3339(utc.replace_nanosecond(0).unwrap_or(utc))
}

pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &time::format_description::well_known::Rfc3339).ok()
}

/* ================== Document field readers ================== */

pub fn f64_from(d: &Document, k: &str) -> f64 {
    d.get_f64(k)
        .ok()
        .or_else(|| d.get_i64(k).ok().map(|v| v as f64))
        .or_else(|| d.get_i32(k).ok().map(|v| v as f64))
        .or_else(|| {
            d.get_str(k)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
        })
        .unwrap_or(0.0)
}

pub fn opt_f64(d: &Document, k: &str) -> Option<f64> {
    match d.get(k) {
        None | Some(Bson::Null) => None,
        Some(_) => Some(f64_from(d, k)),
    }
}

pub fn i64_from(d: &Document, k: &str) -> i64 {
    d.get_i64(k)
        .ok()
        .or_else(|| d.get_i32(k).ok().map(i64::from))
        .or_else(|| d.get_f64(k).ok().map(|v| v as i64))
        .unwrap_or(0)
}

pub fn opt_i64(d: &Document, k: &str) -> Option<i64> {
    match d.get(k) {
        None | Some(Bson::Null) => None,
        Some(_) => Some(i64_from(d, k)),
    }
}

pub fn str_from(d: &Document, k: &str) -> String {
    d.get_str(k).unwrap_or_default().to_string()
}

pub fn opt_string(d: &Document, k: &str) -> Option<String> {
    d.get_str(k).ok().map(|s| s.to_string())
}

pub fn bool_from(d: &Document, k: &str) -> Option<bool> {
    if let Ok(b) = d.get_bool(k) {
        return Some(b);
    }
    if let Ok(i) = d.get_i32(k) {
        return Some(i != 0);
    }
    if let Ok(i) = d.get_i64(k) {
        return Some(i != 0);
    }
    if let Ok(s) = d.get_str(k) {
        let s = s.trim().to_ascii_lowercase();
        return match s.as_str() {
            "1" | "true" | "yes" | "y" => Some(true),
            "0" | "false" | "no" | "n" => Some(false),
            _ => None,
        };
    }
    None
}

pub fn id_of(d: &Document) -> String {
    d.get_str("id")
        .or_else(|_| d.get_str("_id"))
        .unwrap_or_default()
        .to_string()
}

pub fn opt_bson(v: Option<String>) -> Bson {
    v.map(Bson::String).unwrap_or(Bson::Null)
}

pub fn opt_f64_bson(v: Option<f64>) -> Bson {
    v.map(Bson::Double).unwrap_or(Bson::Null)
}

/* ================== Filters ================== */

pub fn id_filter(id: &str) -> Document {
    doc! { "$or": [ { "id": id }, { "_id": id } ] }
}

/// Same as `id_filter` but hides soft-deleted records.
pub fn live_id_filter(id: &str) -> Document {
    doc! { "$and": [ id_filter(id), { "is_deleted": { "$ne": true } } ] }
}

/* ================== Money / text ================== */

/// True when `v` has no digits past the cent.
pub fn whole_cents(v: f64) -> bool {
    let cents = v * 100.0;
    (cents - cents.round()).abs() < 1e-6
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Escapes regex metacharacters so user input can be used in `$regex`.
pub fn escape_regex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if "\\^$.|?*+()[]{}".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Smart  Phones & Tablets "), "smart-phones-tablets");
        assert_eq!(slugify("iPhone 15 Pro"), "iphone-15-pro");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn escape_regex_quotes_metacharacters() {
        assert_eq!(escape_regex("a.b*(c)"), r"a\.b\*\(c\)");
        assert_eq!(escape_regex("plain"), "plain");
    }

    #[test]
    fn numeric_readers_accept_mixed_bson() {
        let d = doc! { "a": 2_i32, "b": 3_i64, "c": "4.5", "d": 1.25, "n": Bson::Null };
        assert_eq!(f64_from(&d, "a"), 2.0);
        assert_eq!(f64_from(&d, "b"), 3.0);
        assert_eq!(f64_from(&d, "c"), 4.5);
        assert_eq!(i64_from(&d, "d"), 1);
        assert_eq!(opt_f64(&d, "n"), None);
        assert_eq!(opt_f64(&d, "missing"), None);
    }

    #[test]
    fn bool_reader_understands_strings() {
        let d = doc! { "x": "yes", "y": 0_i32, "z": "maybe" };
        assert_eq!(bool_from(&d, "x"), Some(true));
        assert_eq!(bool_from(&d, "y"), Some(false));
        assert_eq!(bool_from(&d, "z"), None);
    }

    #[test]
    fn rfc3339_roundtrips_through_parse() {
        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        assert_eq!(parse_rfc3339(&fmt_rfc3339(now)), Some(now));
        assert!(parse_rfc3339("not a date").is_none());
    }

    #[test]
    fn second_precision_strings_sort_chronologically() {
        let a = parse_rfc3339("2026-03-01T10:00:00.900+02:00").unwrap();
        let b = parse_rfc3339("2026-03-01T08:00:01Z").unwrap();
        assert_eq!(fmt_rfc3339_secs(a), "2026-03-01T08:00:00Z");
        assert!(fmt_rfc3339_secs(a) < fmt_rfc3339_secs(b));
    }

    #[test]
    fn round2_keeps_cents() {
        assert_eq!(round2(10.005_1), 10.01);
        assert_eq!(round2(3.333), 3.33);
    }

    #[test]
    fn whole_cents_rejects_fractions_of_a_cent() {
        assert!(whole_cents(19.99));
        assert!(whole_cents(0.1));
        assert!(whole_cents(1200.0));
        assert!(!whole_cents(0.333));
        assert!(!whole_cents(4.999));
    }
}
