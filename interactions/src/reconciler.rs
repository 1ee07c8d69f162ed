//! Pure vote and save transitions. These functions are total over their
//! input space and never touch storage or the network; the dispatcher owns
//! all side effects.

/// A viewer's vote on a single entity.
///
/// The backend reports this as a nullable integer in {-1, 0, 1}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VoteValue {
    Down,
    #[default]
    None,
    Up,
}

impl VoteValue {
    pub fn as_int(self) -> i64 {
        match self {
            VoteValue::Down => -1,
            VoteValue::None => 0,
            VoteValue::Up => 1,
        }
    }

    /// Narrow a server-supplied integer. Anything outside {-1, 1} counts as
    /// no vote, so a malformed field never poisons an otherwise valid payload.
    pub fn from_int(value: i64) -> VoteValue {
        match value {
            -1 => VoteValue::Down,
            1 => VoteValue::Up,
            _ => VoteValue::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    Upvote,
    Downvote,
}

/// The transition produced by applying a [`VoteAction`] to a current vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    pub value: VoteValue,
    pub score_delta: i64,
}

/// Compute the next vote value and the score delta for a toggle action.
///
/// Repeating the action that is already active clears the vote, the opposite
/// action flips it directly (magnitude 2), and acting on a neutral entity
/// casts a fresh vote.
pub fn apply_vote(current: VoteValue, action: VoteAction) -> VoteOutcome {
    match (current, action) {
        (VoteValue::Up, VoteAction::Upvote) => VoteOutcome {
            value: VoteValue::None,
            score_delta: -1,
        },
        (VoteValue::Down, VoteAction::Downvote) => VoteOutcome {
            value: VoteValue::None,
            score_delta: 1,
        },
        (VoteValue::Down, VoteAction::Upvote) => VoteOutcome {
            value: VoteValue::Up,
            score_delta: 2,
        },
        (VoteValue::Up, VoteAction::Downvote) => VoteOutcome {
            value: VoteValue::Down,
            score_delta: -2,
        },
        (VoteValue::None, VoteAction::Upvote) => VoteOutcome {
            value: VoteValue::Up,
            score_delta: 1,
        },
        (VoteValue::None, VoteAction::Downvote) => VoteOutcome {
            value: VoteValue::Down,
            score_delta: -1,
        },
    }
}

/// Flip the saved flag.
pub fn apply_save_toggle(saved: bool) -> bool {
    !saved
}
