use crate::error::{Error, Result};
use crate::pattern::Pattern;
use crate::scan::scan;
use crate::source::ByteSource;
use hex_buffer_serde::{Hex as _, HexForm};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A run of differing bytes between two images of the same length.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct DiffSection {
    pub id: u32,
    pub start: usize,
    pub end: usize,
    #[serde(with = "HexForm")]
    pub search: Vec<u8>,
    #[serde(with = "HexForm")]
    pub data: Vec<u8>,
}

/// Collects differing runs. Up to `gap` equal bytes between two differences
/// are folded into the same section.
pub fn diff(original: &[u8], patched: &[u8], gap: usize) -> Result<Vec<DiffSection>> {
    if original.len() != patched.len() {
        return Err(Error::config(format!(
            "different file sizes: 0x{:x} and 0x{:x}",
            original.len(),
            patched.len()
        )));
    }

    let mut sections: Vec<DiffSection> = Vec::new();
    let mut last_diff: Option<usize> = None;
    for (i, (&before, &after)) in original.iter().zip(patched).enumerate() {
        if before == after {
            continue;
        }
        let id = sections.len() as u32;
        match (sections.last_mut(), last_diff) {
            (Some(section), Some(last)) if i - last - 1 <= gap => {
                section.search.extend_from_slice(&original[last + 1..=i]);
                section.data.extend_from_slice(&patched[last + 1..=i]);
                section.end = i;
            }
            _ => sections.push(DiffSection {
                id,
                start: i,
                end: i,
                search: vec![before],
                data: vec![after],
            }),
        }
        last_diff = Some(i);
    }
    Ok(sections)
}

/// Offsets inside `sections` that changed but are not the flag byte of any
/// record `pattern` finds in `original`.
pub fn unexpected_changes(
    original: &ByteSource,
    sections: &[DiffSection],
    pattern: &Pattern,
) -> Vec<usize> {
    let flags: HashSet<usize> = scan(original, pattern)
        .filter_map(|m| m.start_offset.checked_add(pattern.flag_offset()))
        .collect();

    sections
        .iter()
        .flat_map(|section| {
            section
                .search
                .iter()
                .zip(&section.data)
                .enumerate()
                .filter(|(_, (before, after))| before != after)
                .map(move |(k, _)| section.start + k)
        })
        .filter(|offset| !flags.contains(offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Descriptor, RECORD_LEN};
    use crate::source::Mode;

    #[test]
    fn test_sections_and_gap() {
        let original = vec![0u8; 16];
        let mut patched = original.clone();
        patched[2] = 1;
        patched[4] = 1;
        patched[10] = 0xff;

        let sections = diff(&original, &patched, 1).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!((sections[0].start, sections[0].end), (2, 4));
        assert_eq!(sections[0].search, vec![0, 0, 0]);
        assert_eq!(sections[0].data, vec![1, 0, 1]);
        assert_eq!((sections[1].id, sections[1].start), (1, 10));

        let sections = diff(&original, &patched, 0).unwrap();
        assert_eq!(sections.len(), 3);
    }

    #[test]
    fn test_identical_images() {
        let image = vec![0x5au8; 64];
        assert!(diff(&image, &image, 1).unwrap().is_empty());
    }

    #[test]
    fn test_size_mismatch() {
        assert!(matches!(
            diff(&[0; 4], &[0; 5], 1),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_only_flag_changes_are_expected() {
        let mut original = vec![0u8; 40];
        original[0] = 0x10;
        original[4] = 0x10;
        original[8] = 0x01;
        let mut patched = original.clone();
        patched[32] = 0x01;

        let source = ByteSource::from_vec(original.clone(), Mode::ReadOnly);
        let pattern = Pattern::gos();
        let sections = diff(&original, &patched, 1).unwrap();
        assert!(unexpected_changes(&source, &sections, &pattern).is_empty());

        patched[36] = 0x01;
        let sections = diff(&original, &patched, 1).unwrap();
        assert_eq!(unexpected_changes(&source, &sections, &pattern), vec![36]);
    }

    #[test]
    fn test_flag_offset_past_address_space() {
        let mut descriptors = vec![Descriptor::OneOf(vec![0x00, 0x10]); RECORD_LEN];
        descriptors[0] = Descriptor::Exact(0x10);
        let pattern = Pattern::new("far", descriptors, usize::MAX).unwrap();

        let mut original = vec![0u8; 40];
        original[1] = 0x10;
        let mut patched = original.clone();
        patched[39] = 0x01;

        let source = ByteSource::from_vec(original.clone(), Mode::ReadOnly);
        let sections = diff(&original, &patched, 1).unwrap();
        assert_eq!(unexpected_changes(&source, &sections, &pattern), vec![39]);
    }
}
