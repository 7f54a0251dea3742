/*!
Tag filter expressions and unit (table / asset) filters.
*/

use std::collections::{BTreeSet, HashMap};

use super::name::clean_tag;
use crate::{DumpError, Result};

/// ANY / ALL / NONE tag matching, parsed from `a,+b,-c`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagFilter {
    /// Unmarked: at least one must be present
    any: BTreeSet<String>,
    /// `+` prefixed: all must be present
    all: BTreeSet<String>,
    /// `-` prefixed: none may be present
    none: BTreeSet<String>,
}

impl TagFilter {
    /// Parse a comma separated expression.
    ///
    /// A tag that is both required and forbidden is a configuration error.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut filter = TagFilter::default();
        for token in expression.split(',') {
            let token = token.trim();
            let (group, raw) = if let Some(rest) = token.strip_prefix('+') {
                (&mut filter.all, rest)
            } else if let Some(rest) = token.strip_prefix('-') {
                (&mut filter.none, rest)
            } else {
                (&mut filter.any, token)
            };
            let tag = clean_tag(raw);
            if !tag.is_empty() {
                group.insert(tag);
            }
        }

        let clashing: Vec<&str> = filter
            .all
            .intersection(&filter.none)
            .map(String::as_str)
            .collect();
        if !clashing.is_empty() {
            return Err(DumpError::config(format!(
                "tags {} are both required and forbidden",
                clashing.join(", ")
            )));
        }

        // Unmarked tags already covered by a stronger rule add nothing.
        let redundant: Vec<String> = filter
            .any
            .iter()
            .filter(|tag| filter.all.contains(*tag) || filter.none.contains(*tag))
            .cloned()
            .collect();
        for tag in redundant {
            filter.any.remove(&tag);
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.all.is_empty() && self.none.is_empty()
    }

    /// Does a snapshot carrying `tags` pass this filter?
    pub fn matches<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        let has = |wanted: &String| tags.iter().any(|tag| tag.as_ref() == wanted);
        if !self.any.is_empty() && !self.any.iter().any(has) {
            return false;
        }
        if !self.all.iter().all(has) {
            return false;
        }
        !self.none.iter().any(has)
    }
}

/// Include / exclude list for tables and asset roots.
///
/// `"a,b"` passes only `a` and `b`; `"-a,b"` passes everything but them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitFilter {
    values: Option<Vec<String>>,
    invert: bool,
}

impl UnitFilter {
    /// A filter that passes everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(expression: Option<&str>) -> Self {
        let Some(expression) = expression else {
            return Self::all();
        };
        let trimmed = expression.trim();
        let (invert, list) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let mut values: Vec<String> = Vec::new();
        for value in list
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_lowercase)
        {
            if !value.is_empty() && !values.contains(&value) {
                values.push(value);
            }
        }
        Self {
            values: Some(values),
            invert,
        }
    }

    /// Exact, case-insensitive match.
    pub fn passes(&self, unit: &str) -> bool {
        let unit = unit.to_lowercase();
        self.passes_with(|value| value == unit)
    }

    /// Match using a caller supplied predicate over the listed values.
    pub fn passes_with<F: Fn(&str) -> bool>(&self, predicate: F) -> bool {
        match &self.values {
            Some(values) => self.invert ^ values.iter().any(|v| predicate(v)),
            None => true,
        }
    }
}

/// Caller-owned memoization of parsed filters, keyed by source string.
#[derive(Debug, Default)]
pub struct FilterCache {
    tags: HashMap<String, TagFilter>,
    units: HashMap<Option<String>, UnitFilter>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_filter(&mut self, expression: &str) -> Result<&TagFilter> {
        if !self.tags.contains_key(expression) {
            let parsed = TagFilter::parse(expression)?;
            self.tags.insert(expression.to_string(), parsed);
        }
        self.tags
            .get(expression)
            .ok_or_else(|| DumpError::config("tag filter cache miss"))
    }

    pub fn unit_filter(&mut self, expression: Option<&str>) -> &UnitFilter {
        self.units
            .entry(expression.map(str::to_string))
            .or_insert_with(|| UnitFilter::parse(expression))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS: [&str; 3] = ["a", "d", "o"];

    #[test]
    fn test_required_tags_match() {
        assert!(TagFilter::parse("+a,+d").unwrap().matches(&TAGS));
        assert!(!TagFilter::parse("+a,+z").unwrap().matches(&TAGS));
    }

    #[test]
    fn test_forbidden_tag_excludes() {
        assert!(!TagFilter::parse("-o").unwrap().matches(&TAGS));
        assert!(TagFilter::parse("-z").unwrap().matches(&TAGS));
    }

    #[test]
    fn test_any_of_tags() {
        assert!(!TagFilter::parse("z").unwrap().matches(&TAGS));
        assert!(TagFilter::parse("z,o").unwrap().matches(&TAGS));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = TagFilter::parse("").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches::<&str>(&[]));
    }

    #[test]
    fn test_clash_is_a_configuration_error() {
        let err = TagFilter::parse("+a,-A").unwrap_err();
        assert!(matches!(err, DumpError::Config(_)));
        assert!(err.to_string().contains('a'));
    }

    #[test]
    fn test_unmarked_duplicate_of_forbidden_is_dropped() {
        let filter = TagFilter::parse("o,-o").unwrap();
        assert!(!filter.matches(&TAGS));
        assert!(filter.matches(&["x"]));
    }

    #[test]
    fn test_unit_filter_include_and_exclude() {
        let include = UnitFilter::parse(Some("users, Posts"));
        assert!(include.passes("users"));
        assert!(include.passes("posts"));
        assert!(!include.passes("comments"));

        let exclude = UnitFilter::parse(Some("-users"));
        assert!(!exclude.passes("users"));
        assert!(exclude.passes("comments"));

        assert!(UnitFilter::parse(None).passes("anything"));
    }

    #[test]
    fn test_unit_filter_with_prefix_predicate() {
        let filter = UnitFilter::parse(Some("public/system"));
        let root = "public/system/avatars";
        assert!(filter.passes_with(|value| root.starts_with(value)));
    }

    #[test]
    fn test_filter_cache_reuses_parsed_filters() {
        let mut cache = FilterCache::new();
        assert!(cache.tag_filter("+a").unwrap().matches(&TAGS));
        assert!(cache.tag_filter("+a,-a").is_err());
        assert!(cache.unit_filter(Some("-x")).passes("y"));
        assert_eq!(cache.tags.len(), 1);
    }
}
