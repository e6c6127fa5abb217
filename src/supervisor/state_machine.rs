use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessState, ProcessState),
}

#[derive(Debug)]
pub struct StateMachine {
    state: ProcessState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ProcessState::NotStarted,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn can_transition(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self.state, to),
            (NotStarted, Starting)
                | (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Crashed, Stopped)
        )
    }

    pub fn transition(&mut self, to: ProcessState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Backend state: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
