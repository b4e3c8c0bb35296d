// SPDX-License-Identifier: PMPL-1.0-or-later

//! Allocator interaction model and the `vtx` wire trace protocol.
//!
//! Events are typed allocator interactions carrying logical ids (`uid`)
//! unique within one sequence. Two encodings exist on the wire: the uid form
//! written by this crate (starting configurations, candidates, reproducers)
//! and the address form emitted by an oracle replaying a sequence against a
//! real allocator. Parsing the address form translates runtime addresses
//! back into logical ids through a table that lives only for the duration of
//! the parse.

pub mod pointer;

use thiserror::Error;

/// Marker line spliced into reproducer files after the first named
/// allocation. The staged solver uses it as the insertion point for the next
/// stage's heap manipulation; the codec skips it when re-reading.
pub const STAGE_MARKER: &str = "vtx stagestart";

/// uid carried by the first named allocation.
pub const FIRST_NAMED_UID: u64 = 1;
/// uid carried by the second named allocation.
pub const SECOND_NAMED_UID: u64 = 2;

/// Placeholder uid for a reference to an allocation the sequence does not
/// own (e.g. a free of an address the trace never allocated). Never issued
/// to a real allocation, so it can never appear in a live set.
pub const FOREIGN_REF: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unrecognized trace line: '{0}'")]
    UnrecognizedLine(String),
}

#[derive(Debug, Error)]
pub enum StartingConfigError {
    #[error("free of address {0:#x} which was never allocated")]
    UnknownFree(u64),
    #[error("realloc of address {0:#x} which was never allocated")]
    UnknownRealloc(u64),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocTag {
    Normal,
    /// The allocation whose placement is measured against the second named
    /// allocation.
    FirstNamed,
    SecondNamed,
}

/// One allocator interaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    Alloc { uid: u64, size: u64, tag: AllocTag },
    Calloc { uid: u64, count: u64, elem_size: u64 },
    Free { uid: u64 },
    /// `old_uid` 0 means the allocator treats this as a fresh allocation.
    Realloc { old_uid: u64, new_uid: u64, size: u64 },
}

impl Event {
    pub fn stringify(&self) -> String {
        match self {
            Event::Alloc { uid, size, tag } => match tag {
                AllocTag::Normal => format!("vtx alloc {} {}", size, uid),
                AllocTag::FirstNamed => format!("vtx src {}", size),
                AllocTag::SecondNamed => format!("vtx dst {}", size),
            },
            Event::Calloc {
                uid,
                count,
                elem_size,
            } => format!("vtx calloc {} {} {}", count, elem_size, uid),
            Event::Free { uid } => format!("vtx free {}", uid),
            Event::Realloc {
                old_uid,
                new_uid,
                size,
            } => format!("vtx realloc {} {} {}", size, old_uid, new_uid),
        }
    }
}

/// An ordered, immutable interaction sequence. Equality and hashing cover
/// the full ordered event list, which is what exact-duplicate detection
/// across candidate pools relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Sequence {
    events: Vec<Event>,
}

impl Sequence {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn stringify(&self) -> Vec<String> {
        self.events.iter().map(Event::stringify).collect()
    }

    /// Stable identity of this sequence, derived from its protocol lines.
    /// Survives persistence, unlike an in-process hash.
    pub fn id(&self) -> String {
        blake3::hash(self.stringify().join("\n").as_bytes())
            .to_hex()
            .to_string()
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Parse uid-form protocol lines back into a sequence.
///
/// Blank lines and the stage marker are skipped; any other line that does
/// not match a known event pattern fails the parse.
pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Sequence, ParseError> {
    let mut events = Vec::with_capacity(lines.len());

    for raw in lines {
        let line = raw.as_ref().trim();
        if line.is_empty() || line == STAGE_MARKER {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let event = match fields.as_slice() {
            ["vtx", "alloc", size, uid] => Event::Alloc {
                uid: parse_int(uid, line)?,
                size: parse_int(size, line)?,
                tag: AllocTag::Normal,
            },
            ["vtx", "calloc", count, elem_size, uid] => Event::Calloc {
                uid: parse_int(uid, line)?,
                count: parse_int(count, line)?,
                elem_size: parse_int(elem_size, line)?,
            },
            ["vtx", "free", uid] => Event::Free {
                uid: parse_int(uid, line)?,
            },
            ["vtx", "realloc", size, old_uid, new_uid] => Event::Realloc {
                old_uid: parse_int(old_uid, line)?,
                new_uid: parse_int(new_uid, line)?,
                size: parse_int(size, line)?,
            },
            ["vtx", "src", size] => Event::Alloc {
                uid: FIRST_NAMED_UID,
                size: parse_int(size, line)?,
                tag: AllocTag::FirstNamed,
            },
            ["vtx", "dst", size] => Event::Alloc {
                uid: SECOND_NAMED_UID,
                size: parse_int(size, line)?,
                tag: AllocTag::SecondNamed,
            },
            _ => return Err(ParseError::UnrecognizedLine(line.to_string())),
        };
        events.push(event);
    }

    Ok(Sequence::new(events))
}

/// Parse address-form oracle output into a sequence with fresh logical ids
/// starting at `starting_uid`.
///
/// A free of address 0 is skipped. A free or realloc of an address with no
/// live entry is tolerated: it is recorded against [`FOREIGN_REF`], which
/// marks the sequence as not self-contained when summarized.
pub fn parse_trace<S: AsRef<str>>(
    lines: &[S],
    starting_uid: u64,
) -> Result<Sequence, ParseError> {
    parse_trace_inner(lines, starting_uid, false).map_err(|e| match e {
        StartingConfigError::Parse(p) => p,
        // Strict-only variants cannot surface in tolerant mode.
        other => unreachable!("tolerant trace parse produced {other}"),
    })
}

/// Strict variant used when deriving a starting configuration from a
/// recorded trace: any free/realloc of an address never allocated is an
/// error, since it indicates the trace does not describe a reachable
/// allocator state.
pub fn parse_trace_strict<S: AsRef<str>>(
    lines: &[S],
    starting_uid: u64,
) -> Result<Sequence, StartingConfigError> {
    parse_trace_inner(lines, starting_uid, true)
}

fn parse_trace_inner<S: AsRef<str>>(
    lines: &[S],
    starting_uid: u64,
    strict: bool,
) -> Result<Sequence, StartingConfigError> {
    let mut events = Vec::with_capacity(lines.len());
    let mut addr_to_uid: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    let mut next_uid = starting_uid;

    for raw in lines {
        let line = raw.as_ref().trim();
        if line.is_empty() || line == STAGE_MARKER {
            continue;
        }
        // Report lines the oracle interleaves with its event trace.
        if line.starts_with("vtx distance ")
            || line.starts_with("vtx map ")
            || line.starts_with("vtx ptr ")
        {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["vtx", "alloc", size, addr] => {
                let size = parse_int(size, line)?;
                let addr = parse_addr(addr, line)?;
                events.push(Event::Alloc {
                    uid: next_uid,
                    size,
                    tag: AllocTag::Normal,
                });
                addr_to_uid.insert(addr, next_uid);
                next_uid += 1;
            }
            ["vtx", "calloc", count, elem_size, addr] => {
                let count = parse_int(count, line)?;
                let elem_size = parse_int(elem_size, line)?;
                let addr = parse_addr(addr, line)?;
                events.push(Event::Calloc {
                    uid: next_uid,
                    count,
                    elem_size,
                });
                addr_to_uid.insert(addr, next_uid);
                next_uid += 1;
            }
            ["vtx", "free", addr] => {
                let addr = parse_addr(addr, line)?;
                if addr == 0 {
                    // free(NULL) is a no-op on every allocator
                    continue;
                }
                match addr_to_uid.remove(&addr) {
                    Some(uid) => events.push(Event::Free { uid }),
                    None if strict => return Err(StartingConfigError::UnknownFree(addr)),
                    None => events.push(Event::Free { uid: FOREIGN_REF }),
                }
            }
            ["vtx", "realloc", size, old_addr, new_addr] => {
                let size = parse_int(size, line)?;
                let old_addr = parse_addr(old_addr, line)?;
                let new_addr = parse_addr(new_addr, line)?;
                if old_addr == 0 {
                    // realloc(NULL, n) behaves as malloc(n)
                    events.push(Event::Alloc {
                        uid: next_uid,
                        size,
                        tag: AllocTag::Normal,
                    });
                } else {
                    let old_uid = match addr_to_uid.remove(&old_addr) {
                        Some(uid) => uid,
                        None if strict => {
                            return Err(StartingConfigError::UnknownRealloc(old_addr))
                        }
                        None => FOREIGN_REF,
                    };
                    events.push(Event::Realloc {
                        old_uid,
                        new_uid: next_uid,
                        size,
                    });
                }
                addr_to_uid.insert(new_addr, next_uid);
                next_uid += 1;
            }
            _ => return Err(ParseError::UnrecognizedLine(line.to_string()).into()),
        }
    }

    Ok(Sequence::new(events))
}

fn parse_int(field: &str, line: &str) -> Result<u64, ParseError> {
    field
        .parse::<u64>()
        .map_err(|_| ParseError::UnrecognizedLine(line.to_string()))
}

fn parse_addr(field: &str, line: &str) -> Result<u64, ParseError> {
    let hex = field
        .strip_prefix("0x")
        .ok_or_else(|| ParseError::UnrecognizedLine(line.to_string()))?;
    u64::from_str_radix(hex, 16).map_err(|_| ParseError::UnrecognizedLine(line.to_string()))
}
