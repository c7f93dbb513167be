//! Node validation.
//!
//! Checks split in two groups:
//!
//! - **Intrinsic**: facts about a node that hold wherever it is reached
//!   from (kind and level agree, record count fits, owner and self-address
//!   match, keys sorted). Run once at decode time, so cached nodes never
//!   repeat them.
//! - **Contextual**: facts about a node relative to the path that reached
//!   it (level one below the parent, keys inside the parent's separator
//!   range). Run on every use.

use std::cmp::Ordering;

use pfs_error::{PfsError, Result};
use pfs_types::NodeRef;
use tracing::error;

use crate::error::{corruption, structural};
use crate::format::TreeFormat;
use crate::layout::{DuplicateKeys, HeaderVersion, LevelPolicy};
use crate::node::{InternalNode, Node};
use crate::tree::TreeOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelExpectation {
    Any,
    Exactly(u16),
    Below(u16),
}

/// What the path leading to a node says about it.
#[derive(Debug, Clone)]
pub struct Expectation<K> {
    pub level: LevelExpectation,
    /// Inclusive lower key bound from the parent separator.
    pub lower: Option<K>,
    /// Upper key bound from the next parent separator.
    pub upper: Option<K>,
}

impl<K> Expectation<K> {
    /// Expectation for a root node of known (or unknown) level.
    #[must_use]
    pub fn root(level: Option<u16>) -> Self {
        Self {
            level: level.map_or(LevelExpectation::Any, LevelExpectation::Exactly),
            lower: None,
            upper: None,
        }
    }

    /// A leaf reached through a sibling link.
    #[must_use]
    pub fn sibling_leaf() -> Self {
        Self {
            level: LevelExpectation::Exactly(0),
            lower: None,
            upper: None,
        }
    }
}

/// Expectation for child `slot` of `parent`.
pub(crate) fn child_expectation<K: Clone>(
    policy: LevelPolicy,
    parent: &InternalNode<K>,
    slot: usize,
) -> Expectation<K> {
    let level = match policy {
        LevelPolicy::StrictByOne => {
            LevelExpectation::Exactly(parent.header.level.saturating_sub(1))
        }
        LevelPolicy::Decreasing => LevelExpectation::Below(parent.header.level),
    };
    Expectation {
        level,
        lower: parent.entries.get(slot).map(|entry| entry.key.clone()),
        upper: parent.entries.get(slot + 1).map(|entry| entry.key.clone()),
    }
}

fn violation<F: TreeFormat>(
    format: &F,
    node: NodeRef,
    invariant: &'static str,
    err: PfsError,
) -> PfsError {
    error!(
        format = format.name(),
        node = node.0,
        invariant,
        error = %err,
        "btree_invariant_violation"
    );
    err
}

/// Whether two adjacent keys are correctly ordered under `policy`.
pub(crate) fn ordered<F: TreeFormat>(format: &F, prev: &F::Key, next: &F::Key) -> bool {
    let ord = format.compare(prev, next);
    match format.layout().duplicates {
        DuplicateKeys::Forbidden => ord == Ordering::Less,
        DuplicateKeys::Leftmost | DuplicateKeys::Rightmost => ord != Ordering::Greater,
    }
}

/// Checks that depend only on the node and tree-wide parameters.
pub fn check_intrinsic<F: TreeFormat>(
    format: &F,
    options: &TreeOptions,
    owner: Option<u64>,
    addr: NodeRef,
    node: &Node<F::Key, F::Record>,
) -> Result<()> {
    let layout = format.layout();
    let header = node.header();

    match node {
        Node::Leaf(_) if header.level != 0 => {
            return Err(violation(
                format,
                addr,
                "leaf_level",
                corruption(addr, format!("leaf node at level {}", header.level)),
            ));
        }
        Node::Internal(_) if header.level == 0 => {
            return Err(violation(
                format,
                addr,
                "internal_level",
                corruption(addr, "internal node at level 0"),
            ));
        }
        Node::Internal(internal) if internal.entries.is_empty() => {
            return Err(violation(
                format,
                addr,
                "internal_nonempty",
                structural(addr, "internal node has no entries"),
            ));
        }
        _ => {}
    }

    if header.level > layout.max_level {
        return Err(violation(
            format,
            addr,
            "max_level",
            corruption(
                addr,
                format!("level {} exceeds maximum {}", header.level, layout.max_level),
            ),
        ));
    }

    if !matches!(node, Node::Header(_)) {
        let declared = usize::try_from(header.record_count).unwrap_or(usize::MAX);
        let capacity = layout.capacity(node.kind());
        if declared != node.len() || declared > capacity {
            return Err(violation(
                format,
                addr,
                "record_count",
                structural(
                    addr,
                    format!(
                        "record count {declared} (decoded {}) exceeds capacity {capacity} or disagrees",
                        node.len()
                    ),
                ),
            ));
        }
    }

    if layout.version == HeaderVersion::Extended {
        let Some(extended) = header.extended else {
            return Err(violation(
                format,
                addr,
                "extended_header",
                structural(addr, "checksummed layout without extended header"),
            ));
        };
        if options.check_owner {
            if let Some(expected) = owner {
                if extended.owner != expected {
                    return Err(violation(
                        format,
                        addr,
                        "owner",
                        corruption(
                            addr,
                            format!("owner {} where {expected} expected", extended.owner),
                        ),
                    ));
                }
            }
        }
    }

    if let Err(detail) = format.check_identity(addr, header) {
        return Err(violation(
            format,
            addr,
            "identity",
            corruption(addr, detail),
        ));
    }

    if options.check_key_order {
        for idx in 1..node.len() {
            let (Some(prev), Some(next)) = (node.key_at(idx - 1), node.key_at(idx)) else {
                break;
            };
            if !ordered(format, prev, next) {
                return Err(violation(
                    format,
                    addr,
                    "key_order",
                    corruption(addr, format!("keys out of order at entry {idx}")),
                ));
            }
        }
    }

    Ok(())
}

/// Checks that depend on how the node was reached.
pub fn check_context<F: TreeFormat>(
    format: &F,
    options: &TreeOptions,
    addr: NodeRef,
    node: &Node<F::Key, F::Record>,
    expect: &Expectation<F::Key>,
) -> Result<()> {
    if matches!(node, Node::Header(_)) {
        return Err(violation(
            format,
            addr,
            "header_in_descent",
            structural(addr, "header node reached as a tree node"),
        ));
    }

    let level = node.level();
    let level_ok = match expect.level {
        LevelExpectation::Any => true,
        LevelExpectation::Exactly(want) => level == want,
        LevelExpectation::Below(parent) => level < parent,
    };
    if !level_ok {
        return Err(violation(
            format,
            addr,
            "level_sequence",
            corruption(
                addr,
                format!("level {level} does not match expected {:?}", expect.level),
            ),
        ));
    }

    if !options.check_key_order {
        return Ok(());
    }
    if let (Some(lower), Some(first)) = (&expect.lower, node.first_key()) {
        if format.compare(first, lower) == Ordering::Less {
            return Err(violation(
                format,
                addr,
                "separator_lower",
                corruption(addr, "first key sorts below parent separator"),
            ));
        }
    }
    if let (Some(upper), Some(last)) = (&expect.upper, node.last_key()) {
        if !ordered(format, last, upper) {
            return Err(violation(
                format,
                addr,
                "separator_upper",
                corruption(addr, "last key reaches next parent separator"),
            ));
        }
    }
    Ok(())
}
