use isnap_kernel::state_machine::{allowed_events, allows, apply};
use isnap_kernel::types::{SnapshotEvent, SnapshotState};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = SnapshotState> {
    prop_oneof![
        Just(SnapshotState::Created),
        Just(SnapshotState::Cataloged),
        Just(SnapshotState::Mounted),
        Just(SnapshotState::Unmounted),
        Just(SnapshotState::Reverted),
        Just(SnapshotState::Stale),
        Just(SnapshotState::Deleting),
        Just(SnapshotState::Deleted),
    ]
}

fn any_event() -> impl Strategy<Value = SnapshotEvent> {
    prop_oneof![
        Just(SnapshotEvent::Catalog),
        Just(SnapshotEvent::Mount),
        Just(SnapshotEvent::Unmount),
        Just(SnapshotEvent::Revert),
        Just(SnapshotEvent::Invalidate),
        Just(SnapshotEvent::BeginDelete),
        Just(SnapshotEvent::ConfirmDelete),
        Just(SnapshotEvent::AbortDelete),
    ]
}

#[test]
fn test_delete_path() {
    assert_eq!(
        apply(SnapshotState::Stale, SnapshotEvent::BeginDelete, None),
        Some(SnapshotState::Deleting)
    );
    assert_eq!(
        apply(SnapshotState::Deleting, SnapshotEvent::ConfirmDelete, None),
        Some(SnapshotState::Deleted)
    );
    // Deleting a mounted snapshot is never legal.
    assert_eq!(apply(SnapshotState::Mounted, SnapshotEvent::BeginDelete, None), None);
}

#[test]
fn test_terminal_states_accept_nothing() {
    assert!(allowed_events(SnapshotState::Reverted).is_empty());
    assert!(allowed_events(SnapshotState::Deleted).is_empty());
}

proptest! {
    #[test]
    fn prop_apply_agrees_with_allowed_events(
        from in any_state(),
        event in any_event(),
        prior in proptest::option::of(any_state()),
    ) {
        let next = apply(from, event, prior);
        if next.is_some() {
            prop_assert!(allows(from, event));
        }
        if event != SnapshotEvent::AbortDelete {
            prop_assert_eq!(next.is_some(), allows(from, event));
        }
    }

    #[test]
    fn prop_transitions_never_leave_terminal_states(
        from in any_state(),
        event in any_event(),
    ) {
        if from.is_terminal() {
            prop_assert_eq!(apply(from, event, Some(SnapshotState::Cataloged)), None);
        }
    }

    #[test]
    fn prop_abort_delete_only_returns_to_deletable_states(prior in any_state()) {
        match apply(SnapshotState::Deleting, SnapshotEvent::AbortDelete, Some(prior)) {
            Some(back) => {
                prop_assert_eq!(back, prior);
                prop_assert!(allows(back, SnapshotEvent::BeginDelete));
            }
            None => prop_assert!(!allows(prior, SnapshotEvent::BeginDelete)),
        }
    }

    #[test]
    fn prop_random_walks_stay_monotonic(
        events in proptest::collection::vec(any_event(), 0..40),
    ) {
        // Apart from mount cycling and delete rollback, nothing re-enters
        // CREATED or leaves a terminal state.
        let mut state = SnapshotState::Created;
        let mut prior = None;
        for event in events {
            if let Some(next) = apply(state, event, prior) {
                prop_assert!(next != SnapshotState::Created);
                prior = (event == SnapshotEvent::BeginDelete).then_some(state);
                state = next;
            }
        }
        prop_assert!(!(state.is_terminal() && !allowed_events(state).is_empty()));
    }
}
