use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Inactive,
    Active,
    Finalized,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Inactive => "inactive",
            LifecycleState::Active => "active",
            LifecycleState::Finalized => "finalized",
        }
    }

    /// State reached by `transition`, or `None` if it is not allowed from here.
    pub fn target(self, transition: Transition) -> Option<LifecycleState> {
        use LifecycleState::*;
        use Transition::*;

        match (self, transition) {
            (Unconfigured, Configure) => Some(Inactive),
            (Inactive, Activate) => Some(Active),
            (Active, Deactivate) => Some(Inactive),
            (Inactive, Cleanup) => Some(Unconfigured),
            (Unconfigured | Inactive | Active, Shutdown) => Some(Finalized),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Configure,
    Activate,
    Deactivate,
    Cleanup,
    Shutdown,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Configure => "configure",
            Transition::Activate => "activate",
            Transition::Deactivate => "deactivate",
            Transition::Cleanup => "cleanup",
            Transition::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Transition '{transition}' is not valid from state '{from}'")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub transition: Transition,
}

/// Current lifecycle state. The state only moves when a transition's work
/// has succeeded and [`StateMachine::complete`] is called.
pub struct StateMachine {
    current: LifecycleState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: LifecycleState::Unconfigured,
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.current
    }

    pub fn check(&self, transition: Transition) -> Result<LifecycleState, InvalidTransition> {
        self.current.target(transition).ok_or(InvalidTransition {
            from: self.current,
            transition,
        })
    }

    pub fn complete(&mut self, transition: Transition) -> Result<LifecycleState, InvalidTransition> {
        let next = self.check(transition)?;
        tracing::debug!(from = %self.current, to = %next, %transition, "Lifecycle state change");
        self.current = next;
        Ok(next)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(path: &[Transition]) -> StateMachine {
        let mut machine = StateMachine::new();
        for t in path {
            machine.complete(*t).unwrap();
        }
        machine
    }

    // ========== Initial State Tests ==========

    #[test]
    fn new_starts_unconfigured() {
        assert_eq!(StateMachine::new().current(), LifecycleState::Unconfigured);
    }

    // ========== Unconfigured State Transitions ==========

    #[test]
    fn unconfigured_configure_transitions_to_inactive() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.complete(Transition::Configure), Ok(LifecycleState::Inactive));
        assert_eq!(machine.current(), LifecycleState::Inactive);
    }

    #[test]
    fn unconfigured_rejects_activate() {
        let mut machine = StateMachine::new();
        let err = machine.complete(Transition::Activate).unwrap_err();

        assert_eq!(err.from, LifecycleState::Unconfigured);
        assert_eq!(err.transition, Transition::Activate);
        assert_eq!(machine.current(), LifecycleState::Unconfigured, "State must not move");
    }

    #[test]
    fn unconfigured_rejects_cleanup_and_deactivate() {
        let machine = StateMachine::new();
        assert!(machine.check(Transition::Cleanup).is_err());
        assert!(machine.check(Transition::Deactivate).is_err());
    }

    // ========== Inactive State Transitions ==========

    #[test]
    fn inactive_activate_transitions_to_active() {
        let mut machine = machine_in(&[Transition::Configure]);
        assert_eq!(machine.complete(Transition::Activate), Ok(LifecycleState::Active));
    }

    #[test]
    fn inactive_cleanup_returns_to_unconfigured() {
        let mut machine = machine_in(&[Transition::Configure]);
        assert_eq!(machine.complete(Transition::Cleanup), Ok(LifecycleState::Unconfigured));
    }

    #[test]
    fn inactive_rejects_second_configure() {
        let machine = machine_in(&[Transition::Configure]);
        assert!(machine.check(Transition::Configure).is_err());
    }

    // ========== Active State Transitions ==========

    #[test]
    fn active_deactivate_returns_to_inactive() {
        let mut machine = machine_in(&[Transition::Configure, Transition::Activate]);
        assert_eq!(machine.complete(Transition::Deactivate), Ok(LifecycleState::Inactive));
    }

    #[test]
    fn active_rejects_cleanup() {
        let machine = machine_in(&[Transition::Configure, Transition::Activate]);
        assert!(machine.check(Transition::Cleanup).is_err());
    }

    #[test]
    fn deactivate_activate_cycle_is_repeatable() {
        let mut machine = machine_in(&[Transition::Configure]);
        for _ in 0..3 {
            machine.complete(Transition::Activate).unwrap();
            machine.complete(Transition::Deactivate).unwrap();
        }
        assert_eq!(machine.current(), LifecycleState::Inactive);
    }

    // ========== Shutdown Transitions ==========

    #[test]
    fn shutdown_reachable_from_every_non_final_state() {
        let paths: [&[Transition]; 3] = [
            &[],
            &[Transition::Configure],
            &[Transition::Configure, Transition::Activate],
        ];
        for path in paths {
            let mut machine = machine_in(path);
            assert_eq!(machine.complete(Transition::Shutdown), Ok(LifecycleState::Finalized));
        }
    }

    #[test]
    fn finalized_is_terminal() {
        let machine = machine_in(&[Transition::Shutdown]);
        for t in [
            Transition::Configure,
            Transition::Activate,
            Transition::Deactivate,
            Transition::Cleanup,
            Transition::Shutdown,
        ] {
            assert!(machine.check(t).is_err(), "{} must be rejected", t);
        }
    }

    #[test]
    fn invalid_transition_display() {
        let err = InvalidTransition {
            from: LifecycleState::Active,
            transition: Transition::Cleanup,
        };
        assert_eq!(
            err.to_string(),
            "Transition 'cleanup' is not valid from state 'active'"
        );
    }
}
