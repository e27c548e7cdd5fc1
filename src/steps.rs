// src/steps.rs

//! The fixed lifecycle pipeline.
//!
//! Every part moves through the same five steps in a total order:
//!
//! ```text
//! PULL -> OVERLAY -> BUILD -> STAGE -> PRIME
//! ```

use strum_macros::{Display, EnumIter, EnumString};

/// A lifecycle step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Step {
    Pull,
    Overlay,
    Build,
    Stage,
    Prime,
}

impl Step {
    /// All steps, in pipeline order.
    pub const ALL: [Step; 5] = [
        Step::Pull,
        Step::Overlay,
        Step::Build,
        Step::Stage,
        Step::Prime,
    ];

    /// The steps that precede this one, in pipeline order.
    pub fn previous_steps(self) -> Vec<Step> {
        Step::ALL.iter().copied().filter(|s| *s < self).collect()
    }

    /// The steps that follow this one, in pipeline order.
    pub fn next_steps(self) -> Vec<Step> {
        Step::ALL.iter().copied().filter(|s| *s > self).collect()
    }

    /// The lowercase step name used for state files and messages.
    pub fn name(self) -> &'static str {
        match self {
            Step::Pull => "pull",
            Step::Overlay => "overlay",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        }
    }

    /// The uppercase step name used in reason messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Step::Pull => "PULL",
            Step::Overlay => "OVERLAY",
            Step::Build => "BUILD",
            Step::Stage => "STAGE",
            Step::Prime => "PRIME",
        }
    }

    /// The step a dependency must reach before this step can run.
    ///
    /// A part ordered `after` another can only build once the dependency
    /// has been staged.
    pub fn dependency_prerequisite(self) -> Option<Step> {
        match self {
            Step::Pull | Step::Overlay => None,
            Step::Build | Step::Stage | Step::Prime => Some(Step::Stage),
        }
    }
}
