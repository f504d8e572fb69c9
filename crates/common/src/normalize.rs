//! Label normalization and domain canonicalization
//!
//! Every detection label passes through [`normalize_label`] before it is
//! persisted; discovery/open-vocab/verify candidates additionally go through
//! [`canonicalize_label`], which folds synonym phrases into one canonical
//! entity name so the report does not split "armoured car" and "armored
//! vehicle" into separate entities.

/// Synonym phrase -> canonical entity name
const CANONICAL_MAP: &[(&str, &str)] = &[
    ("naval ship", "warship"),
    ("military ship", "warship"),
    ("carrier ship", "aircraft carrier"),
    ("naval carrier", "aircraft carrier"),
    ("carrier vessel", "aircraft carrier"),
    ("aircraft-carrier", "aircraft carrier"),
    ("fighter aircraft", "fighter jet"),
    ("combat aircraft", "fighter jet"),
    ("attack helicopter", "military helicopter"),
    ("combat helicopter", "military helicopter"),
    ("gunship helicopter", "military helicopter"),
    ("helicopter gunship", "military helicopter"),
    ("armored vehicle", "military vehicle"),
    ("armoured vehicle", "military vehicle"),
    ("armored car", "military vehicle"),
    ("armoured car", "military vehicle"),
    ("armored personnel carrier", "military vehicle"),
    ("armoured personnel carrier", "military vehicle"),
    ("main battle tank", "tank"),
    ("armored tank", "tank"),
    ("armoured tank", "tank"),
    ("self propelled gun", "artillery"),
    ("self-propelled gun", "artillery"),
    ("unmanned aerial vehicle", "drone"),
    ("unmanned aircraft", "drone"),
    ("machine gun", "weapon"),
    ("surface to air missile", "missile"),
];

fn canonical_lookup(text: &str) -> Option<&'static str> {
    CANONICAL_MAP
        .iter()
        .find(|(from, _)| *from == text)
        .map(|(_, to)| *to)
}

/// Normalize a raw label: lowercase, collapse internal whitespace, trim.
/// Labels that collapse to the empty string yield `None` and are dropped.
#[must_use]
pub fn normalize_label(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// True when the label looks like an uppercase alphanumeric designator
/// (hull numbers, tail codes) that should keep its original casing.
#[must_use]
pub fn is_marker_code(label: &str) -> bool {
    label.len() >= 3
        && label
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
        && label.chars().any(|c| c.is_ascii_digit())
}

/// Fold a normalized label into its canonical entity name.
///
/// Marker codes pass through uppercased and untouched. Plural forms are
/// singularized before the synonym lookup runs a second time.
#[must_use]
pub fn canonicalize_label(label: &str) -> String {
    if is_marker_code(label.trim()) {
        return label.trim().to_uppercase();
    }

    let text = match normalize_label(label) {
        Some(t) => t,
        None => return String::new(),
    };

    if let Some(canonical) = canonical_lookup(&text) {
        return canonical.to_string();
    }
    if text == "apc" || text == "ifv" {
        return "military vehicle".to_string();
    }
    if text.contains("carrier") && (text.contains("aircraft") || text.contains("naval")) {
        return "aircraft carrier".to_string();
    }
    if text.contains("fighter") && (text.contains("jet") || text.contains("aircraft")) {
        return "fighter jet".to_string();
    }
    if text.ends_with('s') && text.len() > 3 {
        let singular = &text[..text.len() - 1];
        if let Some(canonical) = canonical_lookup(singular) {
            return canonical.to_string();
        }
        return singular.to_string();
    }
    text
}
