/// Run state of a debug session.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    /// No process yet.
    Idle,
    /// Process created and suspended, waits for `configurationDone`.
    Launching,
    Attaching,
    Stopped,
    Running,
    /// Process exited, session is read-only.
    Exited,
    Terminated,
}

impl SessionState {
    /// True if a debugee process is under control.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            SessionState::Launching
                | SessionState::Attaching
                | SessionState::Stopped
                | SessionState::Running
        )
    }

    pub fn is_over(self) -> bool {
        matches!(self, SessionState::Exited | SessionState::Terminated)
    }
}
