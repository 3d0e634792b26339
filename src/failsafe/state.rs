use std::fmt;

/// Authentication state of one request. Only `Authenticated` grants access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unknown,
    Validating,
    Authenticated,
    Denied,
    Error,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unknown => "unknown",
            AuthState::Validating => "validating",
            AuthState::Authenticated => "authenticated",
            AuthState::Denied => "denied",
            AuthState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Denied | AuthState::Error)
    }

    pub fn grants_access(&self) -> bool {
        *self == AuthState::Authenticated
    }

    fn can_transition_to(&self, next: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, next),
            (Unknown, Validating)
                | (Unknown, Denied)
                | (Unknown, Error)
                | (Validating, Authenticated)
                | (Validating, Denied)
                | (Validating, Error)
        )
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one request through the states. An illegal transition lands in
/// `Error`, and terminal states never change.
#[derive(Debug)]
pub struct AuthStateMachine {
    state: AuthState,
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStateMachine {
    pub fn new() -> Self {
        Self {
            state: AuthState::Unknown,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn transition(&mut self, next: AuthState) -> AuthState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            tracing::error!(from = %self.state, to = %next, "Illegal authentication state transition");
            self.state = AuthState::Error;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = AuthStateMachine::new();
        assert_eq!(machine.transition(AuthState::Validating), AuthState::Validating);
        assert_eq!(machine.transition(AuthState::Authenticated), AuthState::Authenticated);
        assert!(machine.state().grants_access());
    }

    #[test]
    fn test_skipping_validation_is_an_error() {
        let mut machine = AuthStateMachine::new();
        assert_eq!(machine.transition(AuthState::Authenticated), AuthState::Error);
        assert!(!machine.state().grants_access());
    }

    #[test]
    fn test_terminal_states_stick() {
        let mut machine = AuthStateMachine::new();
        machine.transition(AuthState::Validating);
        machine.transition(AuthState::Denied);
        assert_eq!(machine.transition(AuthState::Authenticated), AuthState::Denied);
    }
}
