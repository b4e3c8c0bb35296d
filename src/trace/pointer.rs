// SPDX-License-Identifier: PMPL-1.0-or-later

//! Pointer-search protocol lines.
//!
//! In pointer-search mode the oracle dumps its memory map (`vtx map`) and
//! candidate pointer records (`vtx ptr`) alongside the usual events. A
//! candidate only counts as a real pointer when its target falls inside a
//! mapped range.

use regex::Regex;

/// One `vtx map <start>-<end> ...` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub start: u64,
    pub end: u64,
}

impl MapRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One `vtx ptr <size> <offset> 0x<container> 0x<target>` line: a
/// pointer-sized value found at `offset` inside an allocation of
/// `allocation_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerRecord {
    pub allocation_size: u64,
    pub offset: u64,
    pub pointer: u64,
}

pub fn parse_map_line(line: &str) -> Option<MapRange> {
    let re = Regex::new(r"^vtx map ([0-9a-f]+)-([0-9a-f]+)").unwrap();
    let caps = re.captures(line.trim())?;
    Some(MapRange {
        start: u64::from_str_radix(&caps[1], 16).ok()?,
        end: u64::from_str_radix(&caps[2], 16).ok()?,
    })
}

pub fn parse_ptr_line(line: &str) -> Option<PointerRecord> {
    let re = Regex::new(r"^vtx ptr (\d+) (\d+) 0x([0-9a-f]+) 0x([0-9a-f]+)$").unwrap();
    let caps = re.captures(line.trim())?;
    Some(PointerRecord {
        allocation_size: caps[1].parse().ok()?,
        offset: caps[2].parse().ok()?,
        pointer: u64::from_str_radix(&caps[4], 16).ok()?,
    })
}

/// Collect the pointer records from a pointer-search run whose target lies
/// inside one of the oracle's mapped ranges. Unrelated lines are ignored.
pub fn resolve_pointers<S: AsRef<str>>(lines: &[S]) -> Vec<PointerRecord> {
    let mut ranges = Vec::new();
    let mut candidates = Vec::new();

    for raw in lines {
        let line = raw.as_ref();
        if let Some(range) = parse_map_line(line) {
            ranges.push(range);
        } else if let Some(record) = parse_ptr_line(line) {
            candidates.push(record);
        }
    }

    candidates
        .into_iter()
        .filter(|record| ranges.iter().any(|range| range.contains(record.pointer)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_map_line_ignores_trailing_fields() {
        let range = parse_map_line("vtx map 7f0000000000-7f0000001000 r-xp 00000000 00:00 0")
            .expect("map line should parse");
        assert_eq!(range.start, 0x7f00_0000_0000);
        assert_eq!(range.end, 0x7f00_0000_1000);
    }

    #[test]
    fn test_parse_ptr_line() {
        let record = parse_ptr_line("vtx ptr 40 16 0x2ab52ca628c0 0x2a79730")
            .expect("ptr line should parse");
        assert_eq!(record.allocation_size, 40);
        assert_eq!(record.offset, 16);
        assert_eq!(record.pointer, 0x2a79730);
    }

    #[test]
    fn test_resolve_pointers_keeps_only_mapped_targets() {
        let lines = vec![
            "vtx map 1000-2000 rw-p".to_string(),
            "vtx ptr 64 8 0x5000 0x1800".to_string(),
            "vtx ptr 64 16 0x5000 0x9999".to_string(),
            "vtx alloc 32 0x5000".to_string(),
        ];
        let resolved = resolve_pointers(&lines);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].pointer, 0x1800);
    }
}
