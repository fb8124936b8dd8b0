use crate::types::{SnapshotEvent, SnapshotState};

/// Returns the state `event` moves `from` into, or `None` when illegal.
///
/// `prior` is only consulted by `AbortDelete`, which rolls a DELETING
/// snapshot back to where it was before the delete started.
pub fn apply(
    from: SnapshotState,
    event: SnapshotEvent,
    prior: Option<SnapshotState>,
) -> Option<SnapshotState> {
    use SnapshotEvent as E;
    use SnapshotState as S;
    match (from, event) {
        (S::Created, E::Catalog) => Some(S::Cataloged),
        (S::Cataloged | S::Unmounted, E::Mount) => Some(S::Mounted),
        (S::Mounted, E::Unmount) => Some(S::Unmounted),
        (S::Cataloged | S::Unmounted, E::Revert) => Some(S::Reverted),
        (S::Created | S::Cataloged | S::Unmounted, E::Invalidate) => Some(S::Stale),
        (S::Cataloged | S::Unmounted | S::Stale, E::BeginDelete) => Some(S::Deleting),
        (S::Deleting, E::ConfirmDelete) => Some(S::Deleted),
        (S::Deleting, E::AbortDelete) => prior.filter(|p| allows(*p, E::BeginDelete)),
        _ => None,
    }
}

/// Events accepted in `from`.
pub fn allowed_events(from: SnapshotState) -> Vec<SnapshotEvent> {
    use SnapshotEvent::*;
    match from {
        SnapshotState::Created => vec![Catalog, Invalidate],
        SnapshotState::Cataloged => vec![Mount, Revert, Invalidate, BeginDelete],
        SnapshotState::Mounted => vec![Unmount],
        SnapshotState::Unmounted => vec![Mount, Revert, Invalidate, BeginDelete],
        SnapshotState::Stale => vec![BeginDelete],
        SnapshotState::Deleting => vec![ConfirmDelete, AbortDelete],
        SnapshotState::Reverted | SnapshotState::Deleted => vec![],
    }
}

/// Whether `event` is accepted in `from`, ignoring the rollback target.
pub fn allows(from: SnapshotState, event: SnapshotEvent) -> bool {
    allowed_events(from).contains(&event)
}

/// Validates a transition without applying it.
///
/// With the `strict-debug` feature an illegal transition panics, which is
/// how the lifecycle test suites catch controllers that skip their
/// precondition checks.
pub fn validate(
    from: SnapshotState,
    event: SnapshotEvent,
    prior: Option<SnapshotState>,
) -> Option<SnapshotState> {
    let next = apply(from, event, prior);
    #[cfg(feature = "strict-debug")]
    if next.is_none() {
        panic!("Illegal snapshot transition attempted: {from:?} --{event:?}-->");
    }
    next
}
