// Checkrun
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! External definition mappings: `mangled-name path` lines as printed by
//! the mapping tool, and their merge into one unambiguous index.

use super::{CtuError, CtuResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One definition reported for a translation unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CtuEntry {
    pub mangled_name: String,
    pub source_file: String,
}

impl CtuEntry {
    pub fn new(mangled_name: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            mangled_name: mangled_name.into(),
            source_file: source_file.into(),
        }
    }
}

fn malformed(line: &str, reason: impl Into<String>) -> CtuError {
    CtuError::Mapping {
        line: line.to_string(),
        reason: reason.into(),
    }
}

/// Splits one mapping line.
///
/// Names may contain spaces, in which case the tool prefixes them with
/// their byte length (`<len>:<name> <path>`). The prefix stays part of the
/// name, as the analyzer looks names up in that form.
pub fn parse_extdef_line(line: &str) -> CtuResult<CtuEntry> {
    if line.starts_with(|c: char| c.is_ascii_digit()) {
        let (len_str, _) = line.split_once(':').ok_or_else(|| malformed(line, "missing ':' after length prefix"))?;
        let length: usize = len_str.parse().map_err(|_| malformed(line, format!("bad length prefix `{len_str}`")))?;
        let sep = len_str.len() + 1 + length;
        if line.as_bytes().get(sep) != Some(&b' ') {
            return Err(malformed(line, "length prefix does not end at a separator"));
        }
        let name = line.get(..sep).ok_or_else(|| malformed(line, "length prefix splits a character"))?;
        return Ok(CtuEntry::new(name, &line[sep + 1..]));
    }

    let (name, path) = line.split_once(' ').ok_or_else(|| malformed(line, "no separator"))?;
    Ok(CtuEntry::new(name, path))
}

/// Parses the mapping tool's whole stdout, skipping blank lines.
pub fn parse_extdef_mapping(output: &str) -> CtuResult<Vec<CtuEntry>> {
    output.lines().filter(|line| !line.trim().is_empty()).map(parse_extdef_line).collect()
}

/// Every file each name was reported in, for one architecture.
#[derive(Debug, Default)]
pub struct Candidates {
    by_name: HashMap<String, BTreeSet<String>>,
}

impl Candidates {
    pub fn add(&mut self, entries: impl IntoIterator<Item = CtuEntry>) {
        for entry in entries {
            self.by_name.entry(entry.mangled_name).or_default().insert(entry.source_file);
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Keeps names defined in exactly one file.
    pub fn resolve(self) -> BTreeMap<String, String> {
        self.by_name
            .into_iter()
            .filter_map(|(name, mut files)| if files.len() == 1 { files.pop_first().map(|file| (name, file)) } else { None })
            .collect()
    }
}

/// Unions per-file maps of one architecture and drops ambiguous names.
pub fn merge_extdef_maps<I>(locals: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = Vec<CtuEntry>>,
{
    let mut candidates = Candidates::default();
    for local in locals {
        candidates.add(local);
    }
    candidates.resolve()
}

/// Renders a merged map as the analyzer's index file.
pub fn render_index(map: &BTreeMap<String, String>) -> String {
    map.iter().map(|(name, file)| format!("{name} {file}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_line() {
        let entry = parse_extdef_line("c:@F@foo /src/foo.c").unwrap();
        assert_eq!(entry, CtuEntry::new("c:@F@foo", "/src/foo.c"));
    }

    #[test]
    fn test_length_prefixed_name_with_spaces() {
        let entry = parse_extdef_line("11:c:@F@a b c# /src/with space.c").unwrap();
        assert_eq!(entry.mangled_name, "11:c:@F@a b c#");
        assert_eq!(entry.source_file, "/src/with space.c");
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse_extdef_line("nospace"), Err(CtuError::Mapping { .. })));
        assert!(parse_extdef_line("12abc").is_err());
        assert!(parse_extdef_line("99:c:@F@short /a.c").is_err());
        assert!(parse_extdef_line("3:abcdef /a.c").is_err());
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let entries = parse_extdef_mapping("c:@F@f /a.c\n\n9:c:@F@foo# /a.c\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mangled_name, "9:c:@F@foo#");
    }

    #[test]
    fn test_ambiguous_names_are_dropped() {
        let merged = merge_extdef_maps(vec![
            vec![CtuEntry::new("f", "a.c"), CtuEntry::new("g", "a.c")],
            vec![CtuEntry::new("f", "b.c")],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("g").map(String::as_str), Some("a.c"));
        assert!(!merged.contains_key("f"));
    }

    #[test]
    fn test_same_file_twice_is_not_ambiguous() {
        let merged = merge_extdef_maps(vec![vec![CtuEntry::new("h", "a.c")], vec![CtuEntry::new("h", "a.c")]]);
        assert_eq!(merged.get("h").map(String::as_str), Some("a.c"));
    }

    #[test]
    fn test_render_index_sorted() {
        let merged = merge_extdef_maps(vec![vec![CtuEntry::new("z", "z.c"), CtuEntry::new("a", "a.c")]]);
        assert_eq!(render_index(&merged), "a a.c\nz z.c\n");
    }

    proptest! {
        #[test]
        fn prop_merged_names_have_one_file(pairs in prop::collection::vec((0u8..8, 0u8..4), 0..64)) {
            let locals: Vec<Vec<CtuEntry>> = pairs
                .iter()
                .map(|(name, file)| vec![CtuEntry::new(format!("n{name}"), format!("f{file}.c"))])
                .collect();
            let merged = merge_extdef_maps(locals);

            for (name, file) in &merged {
                let files: BTreeSet<_> = pairs.iter().filter(|(n, _)| format!("n{n}") == *name).map(|(_, f)| format!("f{f}.c")).collect();
                prop_assert_eq!(files.len(), 1);
                prop_assert!(files.contains(file));
            }
            let distinct_names: BTreeSet<_> = pairs.iter().map(|(n, _)| *n).collect();
            for n in distinct_names {
                let files: BTreeSet<_> = pairs.iter().filter(|(m, _)| *m == n).map(|(_, f)| *f).collect();
                prop_assert_eq!(merged.contains_key(&format!("n{n}")), files.len() == 1);
            }
        }
    }
}
