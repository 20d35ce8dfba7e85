//! Budget enforcement over a turn history.

use juris_core::session::Turn;
use juris_core::tokens::{estimate_turn_tokens, estimate_turns_tokens};

/// Drop the oldest evictable turns until the history fits `budget` tokens.
///
/// Pinned turns and the most recent user turn are never dropped, so the
/// result can stay over budget when only protected turns remain.
/// Returns the evicted turns, oldest first.
pub fn evict_to_budget(turns: &mut Vec<Turn>, budget: usize) -> Vec<Turn> {
    let mut evicted = Vec::new();
    let mut total = estimate_turns_tokens(turns);

    while total > budget {
        let last_user = turns.iter().rposition(|t| t.role == juris_core::Role::User);
        let candidate = turns
            .iter()
            .enumerate()
            .position(|(i, t)| !t.pinned && Some(i) != last_user);

        let Some(index) = candidate else {
            break;
        };
        let turn = turns.remove(index);
        total -= estimate_turn_tokens(&turn);
        evicted.push(turn);
    }

    evicted
}

/// The most recent turns that fit `max_tokens`, oldest first.
///
/// Pinned turns are always included and their cost is charged first. The
/// unpinned window is a contiguous suffix of the history: the walk back
/// stops at the first turn that does not fit.
pub fn context_window(turns: &[Turn], max_tokens: usize) -> Vec<Turn> {
    let pinned_cost: usize = turns
        .iter()
        .filter(|t| t.pinned)
        .map(estimate_turn_tokens)
        .sum();
    let mut remaining = max_tokens.saturating_sub(pinned_cost);

    let mut keep = vec![false; turns.len()];
    for (i, turn) in turns.iter().enumerate() {
        keep[i] = turn.pinned;
    }
    for (i, turn) in turns.iter().enumerate().rev() {
        if turn.pinned {
            continue;
        }
        let cost = estimate_turn_tokens(turn);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        keep[i] = true;
    }

    turns
        .iter()
        .zip(keep)
        .filter_map(|(turn, kept)| kept.then(|| turn.clone()))
        .collect()
}
