//! Priority-ordered chains of errors raised across one logical operation.
//!
//! Synchronizing many nested archives must not abort on the first failure, so
//! failures are collected into an immutable singly-linked chain. Each node
//! records the error, a priority and the order in which it appeared. Sorting
//! by priority is non-destructive: nodes are shared between chains and only
//! the nodes that actually move get cloned.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Default cap on entries shown when formatting a chain.
pub const DEFAULT_MAX_PRINTED: usize = 3;

/// Priority for conditions that did not lose data (e.g. a busy archive that
/// was skipped and can be synchronized later).
pub const PRIORITY_WARN: i32 = 0;

/// Priority for genuine failures.
pub const PRIORITY_ERROR: i32 = 100;

/// One node of an error chain.
///
/// The predecessor is an error that appeared *earlier* in the same sweep but
/// did not cause this one; causality stays on [`StdError::source`]. Nodes are
/// immutable once linked, and linking is consuming, so a node can be linked
/// into a chain at most once.
pub struct SyncError {
    source: Arc<dyn StdError + Send + Sync>,
    priority: i32,
    index: u64,
    predecessor: Option<Arc<SyncError>>,
}

impl SyncError {
    /// Create an unlinked node with appearance index 0.
    pub fn new(source: impl Into<Box<dyn StdError + Send + Sync>>, priority: i32) -> Self {
        Self {
            source: Arc::from(source.into()),
            priority,
            index: 0,
            predecessor: None,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Appearance index: 0 for the first error of a sweep, predecessor + 1
    /// afterwards. Sorting never renumbers nodes.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn predecessor(&self) -> Option<&Arc<SyncError>> {
        self.predecessor.as_ref()
    }

    /// Number of nodes in the chain, this one included.
    pub fn len(&self) -> usize {
        let mut n = 1;
        let mut cur = &self.predecessor;
        while let Some(p) = cur {
            n += 1;
            cur = &p.predecessor;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Structural-sharing clone with a different predecessor.
    fn reparent(&self, predecessor: Option<Arc<SyncError>>) -> Arc<SyncError> {
        Arc::new(SyncError {
            source: Arc::clone(&self.source),
            priority: self.priority,
            index: self.index,
            predecessor,
        })
    }

    /// Format with a caller-chosen cap on printed entries instead of
    /// [`DEFAULT_MAX_PRINTED`].
    pub fn display_limited(&self, max: usize) -> DisplayLimited<'_> {
        DisplayLimited { chain: self, max }
    }

    fn fmt_limited(&self, f: &mut fmt::Formatter<'_>, max: usize) -> fmt::Result {
        let mut nodes = Vec::with_capacity(self.len());
        let mut cur = Some(self);
        while let Some(node) = cur {
            nodes.push(node);
            cur = node.predecessor.as_deref();
        }
        // Chain order is priority-descending after sorting; print the other
        // way around so the most actionable error comes last.
        nodes.reverse();
        let total = nodes.len();
        let mut first = true;
        if total > max {
            write!(f, "({} earlier error(s) omitted)", total - max)?;
            first = false;
        }
        for node in nodes.iter().skip(total.saturating_sub(max)) {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", node.source)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_limited(f, DEFAULT_MAX_PRINTED)
    }
}

/// Adapter returned by [`SyncError::display_limited`].
pub struct DisplayLimited<'a> {
    chain: &'a SyncError,
    max: usize,
}

impl fmt::Display for DisplayLimited<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain.fmt_limited(f, self.max)
    }
}

impl fmt::Debug for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncError")
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("index", &self.index)
            .field("predecessor", &self.predecessor)
            .finish()
    }
}

impl StdError for SyncError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Attach `chain` as the predecessor of `new`.
///
/// `new` is consumed, so a node cannot be linked twice; its appearance index
/// becomes the predecessor's index + 1 (or 0 for an empty chain).
pub fn link(new: SyncError, chain: Option<Arc<SyncError>>) -> Arc<SyncError> {
    let index = chain.as_ref().map_or(0, |c| c.index + 1);
    Arc::new(SyncError {
        source: new.source,
        priority: new.priority,
        index,
        predecessor: chain,
    })
}

/// Return the chain ordered by descending priority, ties broken by
/// descending appearance index.
///
/// If the input is already in order, the identical `Arc` is returned. Nodes
/// that keep their relative position are shared, not cloned, so unrelated
/// references to the original chain stay valid.
pub fn sort_by_priority(chain: &Arc<SyncError>) -> Arc<SyncError> {
    match &chain.predecessor {
        None => Arc::clone(chain),
        Some(pred) => {
            let sorted = sort_by_priority(pred);
            if chain.priority >= sorted.priority {
                // The head outranks the rest; on a tie its higher appearance
                // index keeps it in front.
                if Arc::ptr_eq(&sorted, pred) {
                    Arc::clone(chain)
                } else {
                    chain.reparent(Some(sorted))
                }
            } else {
                insert(chain, sorted)
            }
        }
    }
}

/// Insert `node` into the sorted `chain`. `node` has a higher appearance
/// index than every node in `chain`, so ties place it in front.
fn insert(node: &Arc<SyncError>, chain: Arc<SyncError>) -> Arc<SyncError> {
    if node.priority >= chain.priority {
        node.reparent(Some(chain))
    } else {
        let pred = match &chain.predecessor {
            None => node.reparent(None),
            Some(p) => insert(node, Arc::clone(p)),
        };
        chain.reparent(Some(pred))
    }
}

/// Accumulates errors across a loop that must keep going after a failure.
#[derive(Default)]
pub struct SyncErrorBuilder {
    chain: Option<Arc<SyncError>>,
}

impl SyncErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error and continue the sweep.
    pub fn push(&mut self, source: impl Into<Box<dyn StdError + Send + Sync>>, priority: i32) {
        self.chain = Some(link(SyncError::new(source, priority), self.chain.take()));
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_none()
    }

    /// Yield the sorted chain if at least one error was recorded.
    ///
    /// The builder is reset and can be reused for the next sweep.
    pub fn finish(&mut self) -> Result<(), Arc<SyncError>> {
        match self.chain.take() {
            None => Ok(()),
            Some(chain) => Err(sort_by_priority(&chain)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn err(msg: &str) -> io::Error {
        io::Error::other(msg.to_string())
    }

    fn build(priorities: &[i32]) -> Arc<SyncError> {
        let mut chain = None;
        for (i, &p) in priorities.iter().enumerate() {
            chain = Some(link(SyncError::new(err(&format!("e{i}")), p), chain));
        }
        chain.unwrap()
    }

    fn flatten(chain: &Arc<SyncError>) -> Vec<(i32, u64)> {
        let mut out = Vec::new();
        let mut cur = Some(chain.as_ref());
        while let Some(node) = cur {
            out.push((node.priority(), node.index()));
            cur = node.predecessor().map(|a| a.as_ref());
        }
        out
    }

    #[test]
    fn link_assigns_appearance_indexes() {
        let chain = build(&[5, 5, 5]);
        assert_eq!(flatten(&chain), vec![(5, 2), (5, 1), (5, 0)]);
    }

    #[test]
    fn sort_orders_by_priority_then_appearance() {
        let chain = build(&[1, 3, 1, 2, 1]);
        let sorted = sort_by_priority(&chain);
        assert_eq!(
            flatten(&sorted),
            vec![(3, 1), (2, 3), (1, 4), (1, 2), (1, 0)]
        );
    }

    #[test]
    fn sort_is_idempotent_and_identity_preserving() {
        let chain = build(&[1, 3, 1, 2, 1]);
        let once = sort_by_priority(&chain);
        let twice = sort_by_priority(&once);
        assert!(Arc::ptr_eq(&once, &twice));
        assert_eq!(flatten(&once), flatten(&twice));
    }

    #[test]
    fn sort_does_not_mutate_the_original_chain() {
        let chain = build(&[1, 3, 1]);
        let before = flatten(&chain);
        let _sorted = sort_by_priority(&chain);
        assert_eq!(flatten(&chain), before);
    }

    #[test]
    fn already_sorted_chain_is_returned_unchanged() {
        let chain = build(&[1, 2, 3]);
        let sorted = sort_by_priority(&chain);
        assert!(Arc::ptr_eq(&sorted, &chain));
    }

    #[test]
    fn builder_yields_nothing_without_errors() {
        let mut builder = SyncErrorBuilder::new();
        assert!(builder.finish().is_ok());
    }

    #[test]
    fn builder_aggregates_and_sorts() {
        let mut builder = SyncErrorBuilder::new();
        builder.push(err("warn"), PRIORITY_WARN);
        builder.push(err("fatal"), PRIORITY_ERROR);
        let chain = builder.finish().unwrap_err();
        assert_eq!(chain.priority(), PRIORITY_ERROR);
        assert_eq!(chain.len(), 2);
        // builder is reusable afterwards
        assert!(builder.finish().is_ok());
    }

    #[test]
    fn display_elides_the_oldest_entries() {
        let mut builder = SyncErrorBuilder::new();
        for i in 0..5 {
            builder.push(err(&format!("e{i}")), PRIORITY_ERROR);
        }
        let chain = builder.finish().unwrap_err();
        let text = format!("{chain}");
        assert!(text.starts_with("(2 earlier error(s) omitted)"), "{text}");
        // most recent, highest-ranked error comes last
        assert!(text.ends_with("e4"), "{text}");
        assert!(text.contains("e2") && text.contains("e3"));
        assert!(!text.contains("e0") && !text.contains("e1"));
    }

    #[test]
    fn display_cap_is_configurable() {
        let mut builder = SyncErrorBuilder::new();
        for i in 0..5 {
            builder.push(err(&format!("e{i}")), PRIORITY_ERROR);
        }
        let chain = builder.finish().unwrap_err();

        let tight = format!("{}", chain.display_limited(1));
        assert!(tight.starts_with("(4 earlier error(s) omitted)"), "{tight}");
        assert!(tight.ends_with("e4"), "{tight}");

        let full = format!("{}", chain.display_limited(5));
        assert!(!full.contains("omitted"), "{full}");
        assert!(full.contains("e0") && full.ends_with("e4"));
    }
}
