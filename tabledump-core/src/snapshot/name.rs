/*!
Snapshot file names: `YYYYMMDDHHMMSS[-description][@tag,tag,...].{tmp|tgz}`.
*/

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Characters kept verbatim in descriptions and tags.
static DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9 _\-]+").expect("tag charset regex"));
static DISALLOWED_DESCRIPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9 _\-()#]+").expect("description charset regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{14})(?:-([^@]*))?(?:@([^@]*))?\.(tmp|tgz)$").expect("file name regex")
});

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub const DESCRIPTION_MAX: usize = 50;
pub const TAG_MAX: usize = 20;

/// Lifecycle state encoded in the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Being written
    Tmp,
    /// Finalized
    Tgz,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Tmp => "tmp",
            Extension::Tgz => "tgz",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "tmp" => Some(Extension::Tmp),
            "tgz" => Some(Extension::Tgz),
            _ => None,
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields recovered from a snapshot file name.
///
/// Names that do not follow the grammar parse to empty fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameParts {
    pub timestamp: Option<DateTime<Utc>>,
    pub description: String,
    pub tags: Vec<String>,
    pub ext: Option<Extension>,
}

fn clean_str(input: &str, disallowed: &Regex) -> String {
    let collapsed = WHITESPACE.replace_all(input.trim(), " ");
    disallowed.replace_all(&collapsed, "_").into_owned()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Sanitize a free-text description.
pub fn clean_description(description: &str) -> String {
    let cleaned = clean_str(description, &DISALLOWED_DESCRIPTION);
    truncate(&cleaned, DESCRIPTION_MAX).trim().to_string()
}

/// Sanitize a single tag.
///
/// `+` is outside the tag alphabet and becomes `_`; leading `-` is dropped
/// since both are filter syntax, not tag content.
pub fn clean_tag(tag: &str) -> String {
    let cleaned = clean_str(tag, &DISALLOWED).to_lowercase();
    let cleaned = cleaned.trim_start_matches(|c: char| c == '-' || c.is_whitespace());
    truncate(cleaned, TAG_MAX).trim_end().to_string()
}

/// Sanitize a comma separated tag list into a sorted, unique set.
pub fn clean_tags(tags: &str) -> Vec<String> {
    let mut cleaned: Vec<String> = tags
        .split(',')
        .map(clean_tag)
        .filter(|tag| !tag.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    cleaned
}

/// Build a file name for the given instant.
pub fn file_name(
    timestamp: DateTime<Utc>,
    description: &str,
    tags: &str,
    ext: Extension,
) -> String {
    let mut name = timestamp.format(TIMESTAMP_FORMAT).to_string();
    let description = clean_description(description);
    if !description.is_empty() {
        name.push('-');
        name.push_str(&description);
    }
    let tags = clean_tags(tags);
    if !tags.is_empty() {
        name.push('@');
        name.push_str(&tags.join(","));
    }
    name.push('.');
    name.push_str(ext.as_str());
    name
}

/// Recover the fields encoded in a file name. Never fails.
pub fn parse(name: &str) -> NameParts {
    let Some(caps) = NAME.captures(name) else {
        return NameParts::default();
    };
    let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive));
    let description = caps
        .get(2)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let tags = caps.get(3).map(|m| clean_tags(m.as_str())).unwrap_or_default();
    NameParts {
        timestamp,
        description,
        tags,
        ext: Extension::parse(&caps[4]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
    }

    #[test]
    fn test_description_sanitization() {
        assert_eq!(clean_description("  hello   world  "), "hello world");
        assert_eq!(clean_description("a/b\\c"), "a_b_c");
        assert_eq!(clean_description("fix (#42)"), "fix (#42)");
        assert_eq!(clean_description("pâté"), "p_t_");
        assert_eq!(clean_description(&"x".repeat(80)).len(), DESCRIPTION_MAX);
    }

    #[test]
    fn test_tag_sanitization() {
        assert_eq!(clean_tag(" Important "), "important");
        assert_eq!(clean_tag("--old"), "old");
        assert_eq!(clean_tag("+new"), "_new");
        assert_eq!(clean_tag("v1.2"), "v1_2");
        assert_eq!(clean_tag("(x)"), "_x_");
        assert_eq!(clean_tag(&"t".repeat(30)).len(), TAG_MAX);
    }

    #[test]
    fn test_tags_are_sorted_and_unique() {
        assert_eq!(clean_tags("b, a,B,,-a"), vec!["a".to_string(), "b".to_string()]);
        assert!(clean_tags("").is_empty());
    }

    #[test]
    fn test_file_name_layout() {
        assert_eq!(file_name(at(), "", "", Extension::Tgz), "20240309070501.tgz");
        assert_eq!(
            file_name(at(), "before deploy", "prod,Nightly", Extension::Tmp),
            "20240309070501-before deploy@nightly,prod.tmp"
        );
        assert_eq!(file_name(at(), "", "x", Extension::Tgz), "20240309070501@x.tgz");
    }

    #[test]
    fn test_parse_inverts_file_name() {
        let name = file_name(at(), "release (v2)", "b,a", Extension::Tgz);
        let parts = parse(&name);
        assert_eq!(parts.timestamp, Some(at()));
        assert_eq!(parts.description, "release (v2)");
        assert_eq!(parts.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parts.ext, Some(Extension::Tgz));
    }

    #[test]
    fn test_unicode_and_punctuation_survive_the_round_trip() {
        let cases = [
            ("pâté @home", "Ünï,çödé"),
            ("(#1) ok", "a.b,c@d,e/f"),
            ("naïve.v2", "日本語,中文"),
            ("", "+keep,-drop"),
        ];
        for (description, tags) in cases {
            let parts = parse(&file_name(at(), description, tags, Extension::Tmp));
            assert_eq!(parts.timestamp, Some(at()), "{description:?} {tags:?}");
            assert_eq!(parts.description, clean_description(description));
            assert_eq!(parts.tags, clean_tags(tags));
            assert_eq!(parts.ext, Some(Extension::Tmp));
        }
        assert_eq!(clean_tags("a.b,c@d,e/f"), vec!["a_b", "c_d", "e_f"]);
    }

    #[test]
    fn test_parse_of_foreign_names_is_neutral() {
        for name in ["notes.txt", "2024-01-01.tgz", "20240309070501.zip", ""] {
            assert_eq!(parse(name), NameParts::default(), "{name}");
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_recovers_cleaned_fields(
            secs in 0i64..253_402_300_799,
            description in "\\PC{0,60}",
            tags in "\\PC{0,60}",
        ) {
            let at = Utc.timestamp_opt(secs, 0).unwrap();
            let parts = parse(&file_name(at, &description, &tags, Extension::Tgz));
            proptest::prop_assert_eq!(parts.timestamp, Some(at));
            proptest::prop_assert_eq!(parts.description, clean_description(&description));
            proptest::prop_assert_eq!(parts.tags, clean_tags(&tags));
            proptest::prop_assert_eq!(parts.ext, Some(Extension::Tgz));
        }
    }
}
