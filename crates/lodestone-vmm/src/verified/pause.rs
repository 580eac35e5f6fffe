//! Two-tier pause accounting shared by VCPUs and devices.
//!
//! A pausable entity is paused while either the manual flag is set (an
//! operator asked for it) or the internal counter is non-zero (one or more
//! nested system operations such as snapshot or flush asked for it).  The
//! two mechanisms are independent: releasing one never releases the other.

use thiserror::Error;

/// Misuse of the manual pause flag or an unbalanced internal unpause.
///
/// These are expected, non-fatal outcomes; callers report them and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PauseError {
    #[error("already paused")]
    AlreadyPaused,
    #[error("not paused")]
    NotPaused,
}

/// Manual flag plus nested internal counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseState {
    pub manual: bool,
    pub count: u32,
}

impl PauseState {
    /// Paused iff either mechanism holds it.
    pub const fn is_paused(&self) -> bool {
        self.manual || self.count > 0
    }

    /// State after a pause request.
    pub fn pause(self, manual: bool) -> Result<Self, PauseError> {
        if manual {
            if self.manual {
                return Err(PauseError::AlreadyPaused);
            }
            Ok(Self {
                manual: true,
                ..self
            })
        } else {
            Ok(Self {
                count: self.count.saturating_add(1),
                ..self
            })
        }
    }

    /// State after an unpause request.
    pub fn unpause(self, manual: bool) -> Result<Self, PauseError> {
        if manual {
            if !self.manual {
                return Err(PauseError::NotPaused);
            }
            Ok(Self {
                manual: false,
                ..self
            })
        } else {
            match self.count.checked_sub(1) {
                Some(count) => Ok(Self { count, ..self }),
                None => Err(PauseError::NotPaused),
            }
        }
    }
}
