use crate::Command;
use crate::intent::Intent;

/// Phrases the robot can execute. Matching is exact and case-sensitive.
pub const SUPPORTED_COMMANDS: [&str; 11] = [
    "move forward",
    "move backward",
    "turn left",
    "turn right",
    "stop",
    "stop tracking",
    "track my face",
    "center camera",
    "play music",
    "honk",
    "take a picture",
];

pub const UNRECOGNIZED_COMMAND_REPLY: &str = "Unrecognized command";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVocabulary {
    commands: Vec<String>,
}

impl CommandVocabulary {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}

impl Default for CommandVocabulary {
    fn default() -> Self {
        Self::new(SUPPORTED_COMMANDS.iter().map(|c| c.to_string()).collect())
    }
}

/// What one classified utterance turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Outbound event for the client device.
    pub command: Command,
    /// Bot side of the exchange as it is written to the conversation log.
    pub reply: String,
}

/// Turns a classification into an outbound event.
///
/// A command outside the vocabulary is never forwarded to the execution
/// boundary; the visitor hears [`UNRECOGNIZED_COMMAND_REPLY`] instead.
pub fn dispatch(intent: Intent, vocabulary: &CommandVocabulary) -> DispatchOutcome {
    match intent {
        Intent::Command(command) if vocabulary.contains(&command) => DispatchOutcome {
            reply: format!("COMMAND: {command}"),
            command: Command::ExecuteCommand(command),
        },
        Intent::Command(command) => {
            tracing::warn!("Classifier produced unsupported command {:?}", command);
            DispatchOutcome {
                command: Command::SpeakText(UNRECOGNIZED_COMMAND_REPLY.to_string()),
                reply: UNRECOGNIZED_COMMAND_REPLY.to_string(),
            }
        }
        Intent::Conversation(reply) => DispatchOutcome {
            command: Command::SpeakText(reply.clone()),
            reply,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_command_is_executed_verbatim() {
        let outcome = dispatch(
            Intent::Command("move forward".to_string()),
            &CommandVocabulary::default(),
        );
        assert_eq!(
            outcome.command,
            Command::ExecuteCommand("move forward".to_string())
        );
        assert_eq!(outcome.reply, "COMMAND: move forward");
    }

    #[test]
    fn unknown_command_fails_closed() {
        let outcome = dispatch(
            Intent::Command("dance".to_string()),
            &CommandVocabulary::default(),
        );
        assert_eq!(
            outcome.command,
            Command::SpeakText(UNRECOGNIZED_COMMAND_REPLY.to_string())
        );
        assert!(!outcome.reply.contains("dance"));
    }

    #[test]
    fn vocabulary_match_is_case_sensitive() {
        let outcome = dispatch(
            Intent::Command("Move Forward".to_string()),
            &CommandVocabulary::default(),
        );
        assert!(matches!(outcome.command, Command::SpeakText(_)));
    }

    #[test]
    fn conversation_reply_is_spoken_as_is() {
        let outcome = dispatch(
            Intent::Conversation("It's sunny today!".to_string()),
            &CommandVocabulary::default(),
        );
        assert_eq!(
            outcome.command,
            Command::SpeakText("It's sunny today!".to_string())
        );
        assert_eq!(outcome.reply, "It's sunny today!");
    }

    #[test]
    fn default_vocabulary_covers_every_supported_command() {
        let vocabulary = CommandVocabulary::default();
        assert_eq!(vocabulary.iter().count(), SUPPORTED_COMMANDS.len());
        assert!(SUPPORTED_COMMANDS.iter().all(|c| vocabulary.contains(c)));
    }
}
