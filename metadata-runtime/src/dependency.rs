//! Transitive completeness and dependency cycles.
//!
//! A completion step that cannot finish names one [`MetadataDependency`]:
//! the record it waits for and the state that record must reach. Together
//! those links form an implicit graph. Waiting on it is fine as long as it is
//! acyclic; a cycle can never make progress and is reported as a fatal
//! [`DependencyCycle`].

use std::fmt;

use rustc_hash::FxHashSet;

use crate::config::DEFAULT_MAX_DIAGNOSTIC_BYTES;
use crate::metadata::{MetadataKind, MetadataRef, MetadataSource};
use crate::runtime::MetadataRuntime;
use crate::state::{MetadataDependency, MetadataState};

/// Records a type structurally references for transitive completeness:
/// the superclass of a class, then generic arguments (tuple elements for
/// tuples). Field types are deliberately not included.
pub(crate) fn transitive_referents(metadata: MetadataRef) -> impl Iterator<Item = MetadataRef> {
    let superclass = match metadata.kind() {
        MetadataKind::Class => metadata.superclass(),
        _ => None,
    };
    superclass
        .into_iter()
        .chain(metadata.generic_arguments().iter().copied())
}

/// Optimistic check that needs no cache lookups.
///
/// Static records are always complete; any instantiated referent is
/// conservatively treated as incomplete.
pub(crate) fn is_cheaply_transitively_complete(metadata: MetadataRef) -> bool {
    transitive_referents(metadata).all(|referent| referent.source() == MetadataSource::Static)
}

/// Search everything `initial` references for a record below
/// `NonTransitiveComplete`.
///
/// Records that are themselves only non-transitively complete have their own
/// referents searched. Anything already visited is presumed complete, which
/// makes mutually referencing records complete together.
pub(crate) fn check_transitive_completeness(
    rt: &MetadataRuntime,
    initial: MetadataRef,
) -> Option<MetadataDependency> {
    let mut presumed_complete: FxHashSet<MetadataRef> = FxHashSet::default();
    let mut worklist = Vec::new();
    presumed_complete.insert(initial);

    for referent in transitive_referents(initial) {
        if presumed_complete.insert(referent) {
            worklist.push(referent);
        }
    }

    while let Some(metadata) = worklist.pop() {
        let state = rt.current_state(metadata);
        if state == MetadataState::Complete {
            continue;
        }
        if state < MetadataState::NonTransitiveComplete {
            return Some(MetadataDependency::new(
                metadata,
                MetadataState::NonTransitiveComplete,
            ));
        }
        for referent in transitive_referents(metadata) {
            if presumed_complete.insert(referent) {
                worklist.push(referent);
            }
        }
    }

    None
}

/// Follow the chain that starts with `start` waiting on `first`.
///
/// Each link's target is checked against the start and all earlier targets.
/// The chain ends at a target that has reached the required state or is not
/// itself blocked.
pub(crate) fn check_dependency_cycle(
    rt: &MetadataRuntime,
    start: MetadataRef,
    first: MetadataDependency,
) -> Result<(), DependencyCycle> {
    let mut links = vec![first];

    loop {
        let (last, earlier) = match links.split_last() {
            Some((last, earlier)) => (*last, earlier),
            None => return Ok(()),
        };

        if last.target == start || earlier.iter().any(|link| link.target == last.target) {
            return Err(DependencyCycle { start, links });
        }

        match rt.blocking_dependency(last) {
            Some(next) => links.push(next),
            None => return Ok(()),
        }
    }
}

/// A chain of dependencies that leads back to a record already in it.
#[derive(Debug, Clone)]
pub struct DependencyCycle {
    start: MetadataRef,
    links: Vec<MetadataDependency>,
}

impl DependencyCycle {
    /// Build a cycle report by hand.
    pub fn new(start: MetadataRef, links: Vec<MetadataDependency>) -> Self {
        Self { start, links }
    }

    /// Record whose completion found the cycle.
    pub fn start(&self) -> MetadataRef {
        self.start
    }

    /// Every hop, in order.
    pub fn links(&self) -> &[MetadataDependency] {
        &self.links
    }

    /// The diagnostic, with the chain truncated to roughly `max_bytes`.
    pub fn diagnostic(&self, max_bytes: usize) -> String {
        let mut out = format!(
            "runtime error: unresolvable type metadata dependency cycle detected\n  Request for {}",
            self.start
        );

        for link in &self.links {
            if out.len() >= max_bytes {
                break;
            }
            out.push_str(&format!("\n  depends on {link}"));
        }

        if out.len() > max_bytes {
            let mut cut = max_bytes;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
            out.push_str("...");
        }

        out.push_str("\nAborting!");
        out
    }
}

impl fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostic(DEFAULT_MAX_DIAGNOSTIC_BYTES))
    }
}

impl std::error::Error for DependencyCycle {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::MetadataArena;
    use crate::builtins;
    use crate::metadata::Metadata;

    #[test]
    fn test_tuple_referents_are_elements() {
        let arena = MetadataArena::default();
        let tuple = Metadata::tuple(&arena, &[builtins::int32(), builtins::double()]);
        let referents: Vec<_> = transitive_referents(tuple).collect();
        assert_eq!(referents, vec![builtins::int32(), builtins::double()]);
        assert!(is_cheaply_transitively_complete(tuple));
    }

    #[test]
    fn test_cheap_check_is_conservative() {
        let arena = MetadataArena::default();
        let inner = Metadata::tuple(&arena, &[builtins::int32()]);
        let outer = Metadata::tuple(&arena, &[inner, builtins::bool()]);
        assert!(!is_cheaply_transitively_complete(outer));
        assert_eq!(transitive_referents(builtins::int8()).count(), 0);
    }

    #[test]
    fn test_diagnostic_format() {
        let arena = MetadataArena::default();
        let a = Metadata::tuple(&arena, &[builtins::int8()]);
        let b = Metadata::tuple(&arena, &[builtins::int16()]);
        let cycle = DependencyCycle::new(
            a,
            vec![
                MetadataDependency::new(b, MetadataState::NonTransitiveComplete),
                MetadataDependency::new(a, MetadataState::LayoutComplete),
            ],
        );

        let text = cycle.to_string();
        assert_eq!(
            text,
            "runtime error: unresolvable type metadata dependency cycle detected\n  \
             Request for (Int8)\n  \
             depends on completion of (Int16)\n  \
             depends on layout of (Int8)\n\
             Aborting!"
        );
    }

    #[test]
    fn test_diagnostic_truncation() {
        let chain = (0..64)
            .map(|_| MetadataDependency::new(builtins::int32(), MetadataState::Complete))
            .collect();
        let cycle = DependencyCycle::new(builtins::int64(), chain);

        let text = cycle.diagnostic(200);
        assert!(text.len() <= 200 + "...\nAborting!".len());
        assert!(text.ends_with("...\nAborting!"));
        assert!(text.contains("depends on transitive completion of Int32"));
    }
}
