//! Region tags derived from node names.
//!
//! Subscription providers encode the location in the node name
//! ("香港 IPLC 01", "Japan Tokyo", "US-LA"). Names are matched against a fixed
//! keyword table; two-letter codes only match as whole tokens so "RUSSIA"
//! does not read as "US".

/// (tag, long keywords, short codes)
const REGIONS: &[(&str, &[&str], &[&str])] = &[
    ("HK", &["香港", "hong kong", "hongkong"], &["hk", "hkg"]),
    ("JP", &["日本", "japan", "tokyo", "osaka"], &["jp", "jpn"]),
    ("TW", &["台湾", "臺灣", "taiwan"], &["tw", "twn"]),
    ("US", &["美国", "united states", "america"], &["us", "usa"]),
    ("KR", &["韩国", "korea", "seoul"], &["kr", "kor"]),
    ("SG", &["新加坡", "狮城", "singapore"], &["sg", "sgp"]),
    ("GB", &["英国", "united kingdom", "london"], &["uk", "gb"]),
    ("DE", &["德国", "germany", "frankfurt"], &["de"]),
];

/// Extract a region tag from a node name.
pub fn extract_region(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    REGIONS
        .iter()
        .find(|(_, keywords, codes)| {
            keywords.iter().any(|k| lower.contains(k))
                || tokens.iter().any(|t| codes.contains(t))
        })
        .map(|(tag, _, _)| (*tag).to_string())
}

/// Normalize a user-supplied region ("hk", "香港", "Japan") to its tag.
///
/// Unknown values are upper-cased and used as-is.
pub fn normalize_region(region: &str) -> String {
    let trimmed = region.trim();
    let upper = trimmed.to_uppercase();
    if REGIONS.iter().any(|(tag, _, _)| *tag == upper) {
        return upper;
    }
    extract_region(trimmed).unwrap_or(upper)
}
