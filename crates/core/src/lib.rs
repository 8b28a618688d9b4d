pub mod coordinator;
pub mod debounce;
pub mod dispatch;
pub mod embedding;
pub mod identity;
pub mod intent;
pub mod perception;
pub mod session_state;
pub mod speech;

/// Represents commands that the session (`SessionState`) issues to the transport.
///
/// This enum is the only way decisions leave the core: the coordinator never
/// talks to the client device directly, it hands these to whichever runtime
/// owns the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Speak the given text to the visitor.
    SpeakText(String),
    /// Execute one phrase from the command vocabulary on the robot.
    ExecuteCommand(String),
}
