//! Walking a suspension cursor back through its chain.

use chrono::{DateTime, Utc};
use stepchain_types::execution::{BranchSlot, ChainCursor, StepCursor};

use super::chain::Chain;
use super::step::{BranchCase, Step, StepKind};

/// Chain run by case `case` of an `and_branch`; the default is `cases.len()`.
pub(crate) fn branch_body<'a>(
    cases: &'a [BranchCase],
    default: Option<&'a Chain>,
    case: usize,
) -> Option<&'a Chain> {
    match cases.get(case) {
        Some(c) => Some(&c.chain),
        None if case == cases.len() => default,
        None => None,
    }
}

fn suspended_slots(slots: &[BranchSlot]) -> impl Iterator<Item = (usize, &ChainCursor)> {
    slots.iter().enumerate().filter_map(|(i, slot)| match slot {
        BranchSlot::Suspended { cursor, .. } => Some((i, cursor)),
        BranchSlot::Completed { .. } => None,
    })
}

/// Whether the paused position waits for outside input. A pending sleep
/// does not; it is woken by time.
pub(crate) fn awaits_input(cursor: &ChainCursor) -> bool {
    match cursor.inner.as_deref() {
        None => true,
        Some(StepCursor::Sleep { .. }) => false,
        Some(
            StepCursor::Splice { cursor, .. }
            | StepCursor::Race { cursor, .. }
            | StepCursor::Loop { cursor, .. },
        ) => awaits_input(cursor),
        Some(StepCursor::Fanout { slots } | StepCursor::ForEach { slots, .. }) => {
            suspended_slots(slots).any(|(_, c)| awaits_input(c))
        }
    }
}

/// Earliest wake time of any sleep still pending under `cursor`.
pub(crate) fn earliest_wake(cursor: &ChainCursor) -> Option<DateTime<Utc>> {
    match cursor.inner.as_deref() {
        None => None,
        Some(StepCursor::Sleep { wake_at }) => Some(*wake_at),
        Some(
            StepCursor::Splice { cursor, .. }
            | StepCursor::Race { cursor, .. }
            | StepCursor::Loop { cursor, .. },
        ) => earliest_wake(cursor),
        Some(StepCursor::Fanout { slots } | StepCursor::ForEach { slots, .. }) => {
            suspended_slots(slots).filter_map(|(_, c)| earliest_wake(c)).min()
        }
    }
}

/// Among suspended positions in branch order, the one a resume payload is
/// delivered to: the first that awaits input, else the first.
pub(crate) fn payload_target<'c>(
    suspended: impl IntoIterator<Item = (usize, &'c ChainCursor)>,
) -> Option<(usize, &'c ChainCursor)> {
    let mut first = None;
    for (index, cursor) in suspended {
        if awaits_input(cursor) {
            return Some((index, cursor));
        }
        first.get_or_insert((index, cursor));
    }
    first
}

/// Slot of a fan-out or for-each window that receives the resume payload.
pub(crate) fn payload_slot(slots: &[BranchSlot]) -> Option<(usize, &ChainCursor)> {
    payload_target(suspended_slots(slots))
}

/// Find the step a resume payload will be delivered to.
///
/// Fails with a description when the cursor does not fit the chain, e.g.
/// after the chain definition changed under a stored suspension.
pub(crate) fn resolve_leaf<'a>(chain: &'a Chain, cursor: &ChainCursor) -> Result<&'a Step, String> {
    let step = chain.step(cursor.step_index).ok_or_else(|| {
        format!(
            "chain '{}' has no step at index {}",
            chain.id(),
            cursor.step_index
        )
    })?;
    if step.id() != cursor.step_id {
        return Err(format!(
            "chain '{}' has step '{}' at index {}, expected '{}'",
            chain.id(),
            step.id(),
            cursor.step_index,
            cursor.step_id
        ));
    }
    let Some(inner) = cursor.inner.as_deref() else {
        return Ok(step);
    };
    let mismatch = || format!("cursor does not match step '{}'", step.id());

    match (&step.kind, inner) {
        (StepKind::When { chain: body, .. }, StepCursor::Splice { case: 0, cursor }) => {
            resolve_leaf(body, cursor)
        }
        (StepKind::Branch { cases, default }, StepCursor::Splice { case, cursor }) => {
            let body = branch_body(cases, default.as_ref(), *case).ok_or_else(mismatch)?;
            resolve_leaf(body, cursor)
        }
        (StepKind::All(branches), StepCursor::Fanout { slots }) if slots.len() == branches.len() => {
            let (index, cursor) = payload_slot(slots).ok_or_else(mismatch)?;
            resolve_leaf(&branches[index], cursor)
        }
        (StepKind::Race(branches), StepCursor::Race { branch, cursor, .. }) => {
            let body = branches.get(*branch).ok_or_else(mismatch)?;
            resolve_leaf(body, cursor)
        }
        (StepKind::ForEach { chain: item, .. }, StepCursor::ForEach { slots, .. }) => {
            let (_, cursor) = payload_slot(slots).ok_or_else(mismatch)?;
            resolve_leaf(item, cursor)
        }
        (StepKind::Loop { body, .. }, StepCursor::Loop { cursor, .. }) => resolve_leaf(body, cursor),
        (StepKind::Sleep(_), StepCursor::Sleep { .. }) => Ok(step),
        _ => Err(mismatch()),
    }
}
