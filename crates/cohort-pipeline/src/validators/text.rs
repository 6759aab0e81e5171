//! Token normalisation shared by the text-based validators.

use std::collections::BTreeMap;

/// Lower-case, trim, then strip leading/trailing characters outside `[a-z']`.
pub fn token(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .trim_matches(|c: char| !(c.is_ascii_lowercase() || c == '\''))
        .to_owned()
}

/// Whitespace-split `text` into normalised, non-empty tokens.
pub fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(token).filter(|t| !t.is_empty())
}

pub fn counts<I>(tokens: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = String>,
{
    let mut out = BTreeMap::new();
    for t in tokens {
        *out.entry(t).or_insert(0) += 1;
    }
    out
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
