use std::sync::LazyLock;

use regex::Regex;

// space or NBSP groups count only as whole thousands (`1 299 000`); otherwise the amount ends at the first space
static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}(?:[ \u{a0}]\d{3})+(?:[.,]\d+)?\b|\d(?:[\d.,]*\d)?").unwrap()
});
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{3}\b").unwrap());

/// Parse a scraped price string such as `$ 1.299.999,99`, `US$ 1,299.50` or `R$ 89,90`.
///
/// The last separator followed by one or two digits is the decimal mark; every other
/// `.` or `,` is a thousands separator. A single separator followed by exactly three
/// digits is read as thousands (`$ 1.299` is 1299, as marketplace listings print it).
/// Only the first amount counts, so trailing text such as `3 cuotas` is ignored.
/// Negative or unparseable amounts yield `None`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let m = AMOUNT_RE.find(raw)?;
    if raw[..m.start()].contains('-') {
        return None;
    }

    let digits: String = m
        .as_str()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}'))
        .collect();

    let last_dot = digits.rfind('.');
    let last_comma = digits.rfind(',');

    let decimal_pos = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(d.max(c)),
        (Some(p), None) | (None, Some(p)) => {
            let sep = digits.as_bytes()[p] as char;
            let count = digits.matches(sep).count();
            let tail = digits.len() - p - 1;
            if count == 1 && tail != 3 {
                Some(p)
            } else {
                None
            }
        }
        (None, None) => None,
    };

    let normalized: String = digits
        .char_indices()
        .filter_map(|(i, c)| match c {
            '.' | ',' if Some(i) == decimal_pos => Some('.'),
            '.' | ',' => None,
            _ => Some(c),
        })
        .collect();

    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Currency implied by the symbol or code in a price string.
pub fn currency_from_text(raw: &str) -> Option<&'static str> {
    let upper = raw.to_uppercase();
    if upper.contains("US$") || upper.contains("U$S") {
        return Some("USD");
    }
    if upper.contains("R$") {
        return Some("BRL");
    }
    if upper.contains('€') {
        return Some("EUR");
    }
    CODE_RE
        .find_iter(&upper)
        .find_map(|m| KNOWN_CODES.iter().copied().find(|code| *code == m.as_str()))
}

const KNOWN_CODES: &[&str] = &[
    "USD", "BRL", "EUR", "ARS", "MXN", "CLP", "COP", "UYU", "PEN", "BOB", "PYG", "VES",
];

/// Normalize an explicit currency field; only three-letter codes are accepted.
pub fn normalize_currency(raw: &str) -> Option<String> {
    let t = raw.trim();
    (t.len() == 3 && t.chars().all(|c| c.is_ascii_alphabetic())).then(|| t.to_ascii_uppercase())
}

/// Local currency of a Mercado Libre site id.
pub fn site_currency(site_id: &str) -> Option<&'static str> {
    match site_id.to_ascii_uppercase().as_str() {
        "MLA" => Some("ARS"),
        "MLB" => Some("BRL"),
        "MLM" => Some("MXN"),
        "MLC" => Some("CLP"),
        "MCO" => Some("COP"),
        "MLU" => Some("UYU"),
        "MPE" => Some("PEN"),
        "MBO" => Some("BOB"),
        "MPY" => Some("PYG"),
        "MLV" => Some("VES"),
        _ => None,
    }
}

/// Site id behind a scraping actor's country domain code (`AR` -> `MLA`).
pub fn site_for_domain(domain_code: &str) -> Option<&'static str> {
    match domain_code.to_ascii_uppercase().as_str() {
        "AR" => Some("MLA"),
        "BR" => Some("MLB"),
        "MX" => Some("MLM"),
        "CL" => Some("MLC"),
        "CO" => Some("MCO"),
        "UY" => Some("MLU"),
        "PE" => Some("MPE"),
        "BO" => Some("MBO"),
        "PY" => Some("MPY"),
        "VE" => Some("MLV"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latam_format() {
        assert_eq!(parse_price("$ 1.299.999,99"), Some(1_299_999.99));
        assert_eq!(parse_price("R$ 89,90"), Some(89.9));
        assert_eq!(parse_price("$ 1.299"), Some(1299.0));
    }

    #[test]
    fn us_format() {
        assert_eq!(parse_price("US$ 1,299.50"), Some(1299.5));
        assert_eq!(parse_price("1,299"), Some(1299.0));
        assert_eq!(parse_price("499.9"), Some(499.9));
    }

    #[test]
    fn spaces_as_thousands() {
        assert_eq!(parse_price("$ 1 299 000"), Some(1_299_000.0));
        assert_eq!(parse_price("1\u{a0}250,5"), Some(1250.5));
    }

    #[test]
    fn trailing_numbers_are_not_part_of_the_amount() {
        assert_eq!(parse_price("US$ 1,299.50 3 cuotas"), Some(1299.5));
        assert_eq!(parse_price("$ 1.299 12x"), Some(1299.0));
        // cents rendered as a separate superscript are dropped, not glued on
        assert_eq!(parse_price("$ 849.999 99"), Some(849_999.0));
        assert_eq!(parse_price("$ 1 299 000 en 12 cuotas"), Some(1_299_000.0));
    }

    #[test]
    fn rejects_garbage_and_negatives() {
        assert_eq!(parse_price("Consultar precio"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("-$ 100"), None);
    }

    #[test]
    fn currency_detection() {
        assert_eq!(currency_from_text("US$ 10"), Some("USD"));
        assert_eq!(currency_from_text("U$S 10"), Some("USD"));
        assert_eq!(currency_from_text("R$ 10"), Some("BRL"));
        assert_eq!(currency_from_text("10 ARS"), Some("ARS"));
        assert_eq!(currency_from_text("$ 10"), None);
        assert_eq!(currency_from_text("1.500 EUR"), Some("EUR"));
        // codes only count as whole words
        assert_eq!(currency_from_text("Consultar precio"), None);
    }

    #[test]
    fn currency_codes() {
        assert_eq!(normalize_currency(" ars "), Some("ARS".into()));
        assert_eq!(normalize_currency("$"), None);
        assert_eq!(site_currency("mla"), Some("ARS"));
        assert_eq!(site_for_domain("BR"), Some("MLB"));
        assert_eq!(site_for_domain("XX"), None);
    }
}
