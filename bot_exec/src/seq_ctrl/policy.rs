//! Re-plan triggers

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Decides when the waypoint planner is invoked.
pub trait ReplanPolicy: Send {
    /// Return the reason to re-plan this cycle, or `None` to keep the current plan.
    fn should_replan(&mut self, ctx: &ReplanContext) -> Option<ReplanReason>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// What the sequence controller knows about the current plan when deciding to re-plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplanContext {
    /// A feasible plan is held
    pub has_plan: bool,

    /// The last waypoint solve was feasible
    pub last_feasible: bool,

    /// A flagged objective, or the pose of a frame it references, changed since the last solve
    pub flagged_changed: bool,

    /// Control time since the last solve, `None` if there hasn't been one
    pub since_last_solve: Option<f64>,
}

/// Default triggers: no plan, changed flagged objectives, an infeasible previous solve, or more
/// than `replan_cutoff` seconds since the last solve.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    pub replan_cutoff: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplanReason {
    NoPlan,
    ObjectivesChanged,
    Infeasible,
    Cutoff,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl DefaultPolicy {
    pub fn new(replan_cutoff: f64) -> Self {
        Self { replan_cutoff }
    }
}

impl ReplanPolicy for DefaultPolicy {
    fn should_replan(&mut self, ctx: &ReplanContext) -> Option<ReplanReason> {
        let since = match ctx.since_last_solve {
            Some(s) => s,
            None => return Some(ReplanReason::NoPlan),
        };

        if !ctx.last_feasible {
            Some(ReplanReason::Infeasible)
        } else if !ctx.has_plan {
            Some(ReplanReason::NoPlan)
        } else if ctx.flagged_changed {
            Some(ReplanReason::ObjectivesChanged)
        } else if since > self.replan_cutoff {
            Some(ReplanReason::Cutoff)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(since: Option<f64>) -> ReplanContext {
        ReplanContext {
            has_plan: true,
            last_feasible: true,
            flagged_changed: false,
            since_last_solve: since,
        }
    }

    #[test]
    fn test_default_policy() {
        let mut p = DefaultPolicy::new(0.1);

        assert_eq!(p.should_replan(&ctx(None)), Some(ReplanReason::NoPlan));
        assert_eq!(p.should_replan(&ctx(Some(0.05))), None);
        assert_eq!(p.should_replan(&ctx(Some(0.15))), Some(ReplanReason::Cutoff));

        let changed = ReplanContext {
            flagged_changed: true,
            ..ctx(Some(0.0))
        };
        assert_eq!(
            p.should_replan(&changed),
            Some(ReplanReason::ObjectivesChanged)
        );

        let infeasible = ReplanContext {
            has_plan: false,
            last_feasible: false,
            ..ctx(Some(0.0))
        };
        assert_eq!(p.should_replan(&infeasible), Some(ReplanReason::Infeasible));
    }
}
