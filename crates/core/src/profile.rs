//! Day/night profile selection.
//!
//! The selector is the single writer of the process-wide [`Profile`] value.
//! Transitions are debounced by a dwell window so template reassignment can
//! never thrash while an instance is mid-teardown, and every accepted
//! transition reports the old and new profile for event emission.
//!
//! The trigger source is configurable: [`ProfileTrigger::Automatic`]
//! classifies the ambient loudness judgment from the level monitor, while
//! [`ProfileTrigger::Operator`] only honors explicit commands. Operator
//! commands are accepted in both modes (manual override).

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Operating mode affecting which template a profile-varying mount uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Profile {
    Day,
    Night,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Day => write!(f, "Day"),
            Profile::Night => write!(f, "Night"),
        }
    }
}

/// What drives profile transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProfileTrigger {
    /// Only explicit operator/schedule commands switch the profile.
    Operator,
    /// Ambient loudness switches the profile, with hysteresis: a quiet
    /// house goes to night, sustained activity brings day back.
    Automatic {
        /// Ambient level below which the environment counts as asleep.
        night_below: f64,
        /// Ambient level above which the environment counts as active.
        day_above: f64,
    },
}

/// Debounced two-state profile machine.
#[derive(Debug)]
pub struct ProfileSelector {
    profile: Profile,
    trigger: ProfileTrigger,
    dwell: Duration,
    last_transition: Option<Instant>,
}

impl ProfileSelector {
    pub fn new(initial: Profile, trigger: ProfileTrigger, dwell: Duration) -> Self {
        Self {
            profile: initial,
            trigger,
            dwell,
            last_transition: None,
        }
    }

    /// Current profile (read-only view for the mount registry).
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Feed the ambient loudness judgment. Returns `(from, to)` when a
    /// transition is accepted; ignored entirely under operator triggering.
    pub fn on_ambient(&mut self, ambient: f64, now: Instant) -> Option<(Profile, Profile)> {
        let ProfileTrigger::Automatic {
            night_below,
            day_above,
        } = self.trigger
        else {
            return None;
        };

        let target = if ambient < night_below {
            Profile::Night
        } else if ambient > day_above {
            Profile::Day
        } else {
            // Inside the hysteresis band: hold the current profile.
            return None;
        };

        self.transition_to(target, now)
    }

    /// Explicit operator/schedule command. Honored in both trigger modes.
    pub fn on_operator(&mut self, target: Profile, now: Instant) -> Option<(Profile, Profile)> {
        self.transition_to(target, now)
    }

    fn transition_to(&mut self, target: Profile, now: Instant) -> Option<(Profile, Profile)> {
        if target == self.profile {
            return None;
        }
        if let Some(last) = self.last_transition
            && now.duration_since(last) < self.dwell
        {
            tracing::debug!(
                current = %self.profile,
                target = %target,
                "transition suppressed inside dwell window"
            );
            return None;
        }

        let from = self.profile;
        self.profile = target;
        self.last_transition = Some(now);
        tracing::info!(from = %from, to = %target, "profile transition");
        Some((from, target))
    }
}
