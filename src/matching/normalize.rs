// src/matching/normalize.rs
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

const NAME_PREFIXES: [&str; 3] = ["the ", "a ", "an "];

/// Legal-form and filler suffixes stripped from business names.
const NAME_SUFFIXES: [&str; 22] = [
    " incorporated", " inc", " corporation", " corp", " limited liability company", " llc",
    " limited", " ltd", " limited partnership", " lp", " llp", " company", " co", " pllc",
    " pc", " plc", " gmbh", " group", " enterprises", " holdings", " services", " service",
];

static NAME_ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\b(ctr|cntr)\b", "center"),
        (r"\b(svcs|svc|srv)\b", "service"),
        (r"\b(mgmt|mgt)\b", "management"),
        (r"\b(bros)\b", "brothers"),
        (r"\b(mfg)\b", "manufacturing"),
        (r"\b(intl)\b", "international"),
        (r"\b(assoc|assn)\b", "association"),
        (r"\b(dept)\b", "department"),
    ]
    .iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, *replacement)))
    .collect()
});

/// Case-folds, strips punctuation, prefixes and legal suffixes, and expands
/// common abbreviations. `"Joe's HVAC, Inc."` → `"joes hvac"`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = name.to_lowercase();

    let char_substitutions = [
        ("&", " and "),
        ("+", " plus "),
        ("'", ""),
        ("’", ""),
        ("/", " "),
        ("-", " "),
        (".", " "),
        (",", " "),
        ("(", " "),
        (")", " "),
    ];
    for (pattern, replacement) in &char_substitutions {
        normalized = normalized.replace(pattern, replacement);
    }

    normalized = normalized
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    normalized = collapse_whitespace(&normalized);

    for prefix in NAME_PREFIXES {
        if let Some(stripped) = normalized.strip_prefix(prefix) {
            normalized = stripped.to_string();
        }
    }

    // Repeat so "joes hvac services inc" loses both suffixes.
    loop {
        let before = normalized.len();
        for suffix in NAME_SUFFIXES {
            if normalized.ends_with(suffix) && normalized.len() > suffix.len() {
                normalized = normalized[..normalized.len() - suffix.len()]
                    .trim_end()
                    .to_string();
            }
        }
        if normalized.len() == before {
            break;
        }
    }

    for (re, replacement) in NAME_ABBREVIATIONS.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }

    collapse_whitespace(&normalized)
}

/// Digits only, with a leading US country code dropped. Numbers outside
/// 7..=15 digits are treated as absent and yield an empty string.
pub fn normalize_phone(phone: &str) -> String {
    let digits_only: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits_only.len() == 11 && digits_only.starts_with('1') {
        return digits_only[1..].to_string();
    }
    if (7..=15).contains(&digits_only.len()) {
        return digits_only;
    }
    debug!(
        "Phone number '{}' normalized to '{}', considered invalid for matching.",
        phone, digits_only
    );
    String::new()
}

/// Lowercases, removes punctuation and unit designators, and expands street
/// suffix abbreviations.
pub fn normalize_address(address: &str) -> String {
    let lower = address.to_lowercase();
    let cleaned: String = lower
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '#' {
                c
            } else {
                ' '
            }
        })
        .collect();

    // Pad so whole-word replacements also match at the ends.
    let mut normalized = format!(" {} ", collapse_whitespace(&cleaned));
    let suffixes = [
        (" st ", " street "),
        (" str ", " street "),
        (" rd ", " road "),
        (" ave ", " avenue "),
        (" av ", " avenue "),
        (" blvd ", " boulevard "),
        (" dr ", " drive "),
        (" ln ", " lane "),
        (" ct ", " court "),
        (" pl ", " place "),
        (" pkwy ", " parkway "),
        (" hwy ", " highway "),
        (" cir ", " circle "),
        (" n ", " north "),
        (" s ", " south "),
        (" e ", " east "),
        (" w ", " west "),
    ];
    for (short, long) in suffixes {
        while normalized.contains(short) {
            normalized = normalized.replace(short, long);
        }
    }

    let unit_markers = ["apt", "apartment", "suite", "ste", "unit", "fl", "floor", "rm", "room"];
    let mut tokens: Vec<&str> = Vec::new();
    let mut skip_next = false;
    for token in normalized.split_whitespace() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if unit_markers.contains(&token) {
            skip_next = true;
            continue;
        }
        if token.starts_with('#') {
            if token.len() == 1 {
                skip_next = true;
            }
            continue;
        }
        tokens.push(token);
    }
    tokens.join(" ")
}

/// Lowercased, trimmed address without a `mailto:` prefix.
pub fn normalize_email(email: &str) -> String {
    let trimmed = email.trim().to_lowercase();
    trimmed
        .strip_prefix("mailto:")
        .unwrap_or(&trimmed)
        .to_string()
}

/// Host without `www.` plus path without trailing slash, ignoring scheme,
/// query and fragment. Falls back to simple folding for unparseable input.
pub fn normalize_website(website: &str) -> String {
    let trimmed = website.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    match Url::parse(&with_scheme) {
        Ok(url) => {
            let host = url
                .host_str()
                .unwrap_or_default()
                .trim_start_matches("www.")
                .to_lowercase();
            let path = url.path().trim_end_matches('/');
            format!("{}{}", host, path.to_lowercase())
        }
        Err(e) => {
            debug!("Website '{}' did not parse as a URL: {}", website, e);
            trimmed.trim_end_matches('/').to_lowercase()
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
