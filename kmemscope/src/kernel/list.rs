//! `struct list_head` traversal
//!
//! Every step validates the back link of the node it arrives at. The first
//! broken back link does not stop the walk: it is remembered, and from then
//! on a second cursor runs two steps per iteration (Floyd's tortoise and
//! hare) so a cycle that does not pass through the head still terminates.
//! The remembered break is reported once the walk returns to the head.

use std::collections::HashSet;

use crate::domain::{Direction, Finding, ListError};
use crate::memory::Reader;

/// Default bound on entries per list
pub const DEFAULT_LIST_LIMIT: usize = 1 << 22;

#[derive(Debug, Clone, Copy)]
struct LinkOffsets {
    next: u64,
    prev: u64,
}

impl LinkOffsets {
    fn resolve(reader: &Reader<'_>) -> Self {
        let ptr = reader.pointer_size();
        Self {
            next: reader.offset_of("struct list_head", "next").unwrap_or(0),
            prev: reader.offset_of("struct list_head", "prev").unwrap_or(ptr),
        }
    }

    /// (forward link, back link) for a direction
    fn for_direction(self, direction: Direction) -> (u64, u64, &'static str, &'static str) {
        match direction {
            Direction::Forward => (self.next, self.prev, "next", "prev"),
            Direction::Reverse => (self.prev, self.next, "prev", "next"),
        }
    }
}

/// Result of one directional walk: the nodes reached and why it stopped early
#[derive(Debug, Clone, Default)]
pub struct RawWalk {
    /// `list_head` addresses in visiting order, head excluded
    pub nodes: Vec<u64>,
    pub error: Option<ListError>,
}

/// Walk the list at `head` in one direction
#[must_use]
pub fn walk_list(reader: &Reader<'_>, head: u64, direction: Direction, limit: usize) -> RawWalk {
    let mut nodes = Vec::new();
    let error = walk_inner(reader, head, direction, limit, &mut nodes).err();
    RawWalk { nodes, error }
}

fn walk_inner(
    reader: &Reader<'_>,
    head: u64,
    direction: Direction,
    limit: usize,
    nodes: &mut Vec<u64>,
) -> Result<(), ListError> {
    if head == 0 {
        return Err(ListError::NullHead);
    }
    let (fwd, back, fwd_name, back_name) = LinkOffsets::resolve(reader).for_direction(direction);

    let mut next = reader.read_ptr(head + fwd)?;
    if next == 0 {
        return Err(ListError::NullLink { node: head, link: fwd_name.to_string() });
    }

    let mut prev = head;
    let mut node = next;
    let mut fast: Option<u64> = None;
    let mut pending: Option<ListError> = None;

    while node != head {
        if nodes.len() >= limit {
            return Err(ListError::TooLong { limit });
        }
        let found = reader.read_ptr(node + back)?;
        nodes.push(node);

        if found != prev {
            pending = Some(ListError::BrokenLink { prev, node, found, link: back_name.to_string() });
            fast = Some(node);
        }
        next = reader.read_ptr(node + fwd)?;

        if let Some(mut hare) = fast {
            for _ in 0..2 {
                // the hare is home, nothing left to chase
                if hare == head {
                    break;
                }
                hare = reader.read_ptr(hare + fwd)?;
                if hare == node {
                    return Err(ListError::Cycle { node });
                }
            }
            fast = Some(hare);
        }

        prev = node;
        if next == 0 {
            return Err(ListError::NullLink { node, link: fwd_name.to_string() });
        }
        node = next;
    }

    pending.map_or(Ok(()), Err)
}

/// How a list walk ended after the optional reverse retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Clean,
    /// Damage was found but one direction still got back to the head
    Recovered,
    /// Neither direction got back to the head; `nodes` holds what either reached
    Unrecoverable,
}

/// A list walk with its diagnostics
#[derive(Debug, Clone)]
pub struct ListWalk {
    /// Nodes in forward order
    pub nodes: Vec<u64>,
    pub outcome: WalkOutcome,
    pub findings: Vec<Finding>,
}

impl ListWalk {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcome == WalkOutcome::Clean
    }
}

/// A walk that got back to its head; a broken back link alone does not
/// stop a walk, it is only reported
fn reached_head(error: Option<&ListError>) -> bool {
    matches!(error, None | Some(ListError::BrokenLink { .. }))
}

/// Walk forward; on a cycle or a dead link retry once in reverse
///
/// A forward walk that got back to the head despite a broken back link keeps
/// its nodes. Otherwise a reverse walk that gets back to the head supersedes
/// the forward nodes, and when it does not, the union of what each direction
/// reached is kept, forward first.
#[must_use]
pub fn walk_with_retry(reader: &Reader<'_>, head: u64, context: &str, limit: usize) -> ListWalk {
    let forward = walk_list(reader, head, Direction::Forward, limit);
    let Some(forward_error) = forward.error else {
        return ListWalk { nodes: forward.nodes, outcome: WalkOutcome::Clean, findings: Vec::new() };
    };

    if reached_head(Some(&forward_error)) {
        log::debug!("{context}: {forward_error}, forward walk of {head:#x} still complete");
        let finding = Finding::ListCorruption {
            context: context.to_string(),
            head,
            direction: Direction::Forward,
            error: forward_error,
            recovered: true,
        };
        return ListWalk { nodes: forward.nodes, outcome: WalkOutcome::Recovered, findings: vec![finding] };
    }

    log::debug!("{context}: forward walk of {head:#x} failed ({forward_error}), retrying in reverse");
    let reverse = walk_list(reader, head, Direction::Reverse, limit);
    let recovered = reached_head(reverse.error.as_ref());

    let corruption = |direction, error| Finding::ListCorruption {
        context: context.to_string(),
        head,
        direction,
        error,
        recovered,
    };

    let mut findings = vec![corruption(Direction::Forward, forward_error)];
    if let Some(reverse_error) = reverse.error {
        findings.push(corruption(Direction::Reverse, reverse_error));
    }

    if recovered {
        let mut nodes = reverse.nodes;
        nodes.reverse();
        return ListWalk { nodes, outcome: WalkOutcome::Recovered, findings };
    }

    // a forward walk stopped by a cycle already holds repeats
    let mut seen = HashSet::new();
    let nodes: Vec<u64> =
        forward.nodes.into_iter().chain(reverse.nodes).filter(|n| seen.insert(*n)).collect();
    ListWalk { nodes, outcome: WalkOutcome::Unrecoverable, findings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArchInfo, SparseImage, TypeLayout};

    const HEAD: u64 = 0x1000;

    fn node_addr(i: u64) -> u64 {
        0x1100 + i * 0x40
    }

    /// Circular list of `n` nodes hanging off `HEAD`
    fn build(n: u64) -> SparseImage {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x1000);
        img.define_type("struct list_head", TypeLayout::new(16).field("next", 0, 8).field("prev", 8, 8));

        let mut all = vec![HEAD];
        all.extend((0..n).map(node_addr));
        for (i, &addr) in all.iter().enumerate() {
            let next = all[(i + 1) % all.len()];
            let prev = all[(i + all.len() - 1) % all.len()];
            img.write_u64(addr, next).unwrap();
            img.write_u64(addr + 8, prev).unwrap();
        }
        img
    }

    #[test]
    fn test_clean_walk_both_directions() {
        let img = build(4);
        let reader = Reader::new(&img);
        let fwd = walk_list(&reader, HEAD, Direction::Forward, 100);
        assert!(fwd.error.is_none());
        assert_eq!(fwd.nodes, (0..4).map(node_addr).collect::<Vec<_>>());

        let rev = walk_list(&reader, HEAD, Direction::Reverse, 100);
        assert!(rev.error.is_none());
        assert_eq!(rev.nodes, (0..4).rev().map(node_addr).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_list() {
        let img = build(0);
        let reader = Reader::new(&img);
        let walk = walk_with_retry(&reader, HEAD, "empty", 100);
        assert!(walk.is_clean());
        assert!(walk.nodes.is_empty());
    }

    #[test]
    fn test_cycle_not_through_head() {
        let mut img = build(5);
        // entry 5 points back to entry 2
        img.write_u64(node_addr(4), node_addr(1)).unwrap();
        let reader = Reader::new(&img);

        let fwd = walk_list(&reader, HEAD, Direction::Forward, 100);
        assert!(matches!(fwd.error, Some(ListError::Cycle { .. })));

        // the prev chain is intact, so the reverse walk gets home
        let walk = walk_with_retry(&reader, HEAD, "cycle", 100);
        assert_eq!(walk.outcome, WalkOutcome::Recovered);
        assert_eq!(walk.nodes, (0..5).map(node_addr).collect::<Vec<_>>());
        let first = &walk.findings[0];
        assert!(matches!(first, Finding::ListCorruption { error: ListError::Cycle { .. }, .. }));
        assert_eq!(first.category(), crate::domain::Category::Corruption);
    }

    #[test]
    fn test_broken_prev_reported_after_walk() {
        let mut img = build(3);
        img.write_u64(node_addr(1) + 8, 0xdead_0000).unwrap();
        let reader = Reader::new(&img);

        let fwd = walk_list(&reader, HEAD, Direction::Forward, 100);
        assert_eq!(fwd.nodes.len(), 3);
        assert_eq!(
            fwd.error,
            Some(ListError::BrokenLink {
                prev: node_addr(0),
                node: node_addr(1),
                found: 0xdead_0000,
                link: "prev".into()
            })
        );

        // forward got home, so no reverse retry and every node is kept
        let walk = walk_with_retry(&reader, HEAD, "prev", 100);
        assert_eq!(walk.outcome, WalkOutcome::Recovered);
        assert_eq!(walk.nodes.len(), 3);
        assert_eq!(walk.findings.len(), 1);
    }

    #[test]
    fn test_null_next_recovered_in_reverse() {
        let mut img = build(3);
        img.write_u64(node_addr(1), 0).unwrap();
        let reader = Reader::new(&img);

        let walk = walk_with_retry(&reader, HEAD, "partial", 100);
        assert_eq!(walk.outcome, WalkOutcome::Recovered);
        assert_eq!(walk.nodes, (0..3).map(node_addr).collect::<Vec<_>>());
        // the reverse walk sees the same damage as a broken next link
        assert_eq!(walk.findings.len(), 2);
        assert!(matches!(
            &walk.findings[0],
            Finding::ListCorruption { error: ListError::NullLink { .. }, recovered: true, .. }
        ));
        assert!(matches!(
            &walk.findings[1],
            Finding::ListCorruption { direction: Direction::Reverse, error: ListError::BrokenLink { .. }, .. }
        ));
    }

    #[test]
    fn test_unreadable_both_ways_is_unrecoverable() {
        let mut img = build(4);
        img.write_u64(node_addr(1), 0x7777_0000).unwrap();
        img.write_u64(node_addr(2) + 8, 0x7777_0000).unwrap();
        let reader = Reader::new(&img);

        let walk = walk_with_retry(&reader, HEAD, "torn", 100);
        assert_eq!(walk.outcome, WalkOutcome::Unrecoverable);
        assert_eq!(walk.findings.len(), 2);
        assert!(walk.findings.iter().all(|f| f.category() == crate::domain::Category::UnreadableMemory));
        assert_eq!(walk.nodes, vec![node_addr(0), node_addr(1), node_addr(3), node_addr(2)]);
    }

    #[test]
    fn test_cycle_with_dead_reverse_counts_each_node_once() {
        let mut img = build(5);
        img.write_u64(node_addr(4), node_addr(1)).unwrap();
        img.write_u64(HEAD + 8, 0).unwrap();
        let reader = Reader::new(&img);

        let walk = walk_with_retry(&reader, HEAD, "cycle", 100);
        assert_eq!(walk.outcome, WalkOutcome::Unrecoverable);
        assert_eq!(walk.nodes, (0..5).map(node_addr).collect::<Vec<_>>());
        assert!(matches!(
            &walk.findings[1],
            Finding::ListCorruption { direction: Direction::Reverse, error: ListError::NullLink { .. }, .. }
        ));
    }

    #[test]
    fn test_null_head_and_limit() {
        let img = build(10);
        let reader = Reader::new(&img);
        assert_eq!(walk_list(&reader, 0, Direction::Forward, 100).error, Some(ListError::NullHead));
        assert_eq!(
            walk_list(&reader, HEAD, Direction::Forward, 4).error,
            Some(ListError::TooLong { limit: 4 })
        );
    }
}
