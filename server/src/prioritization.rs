//! Static command classification.

/// Concurrency class a command is scheduled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Buffer synchronization and keystroke formatting; one in flight.
    Priority,
    /// Interactive feature requests.
    Normal,
    /// Expensive whole-project or background work.
    Deferred,
}

impl QueueClass {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Priority => "Priority",
            Self::Normal => "Normal",
            Self::Deferred => "Deferred",
        }
    }
}

const PRIORITY_COMMANDS: &[&str] = &[
    "/changebuffer",
    "/formatAfterKeystroke",
    "/formatRange",
    "/updatebuffer",
];

const NORMAL_COMMANDS: &[&str] = &[
    "/autocomplete",
    "/completion",
    "/completion/resolve",
    "/filesChanged",
    "/findimplementations",
    "/findsymbols",
    "/findusages",
    "/getcodeactions",
    "/gotoDefinition",
    "/quickinfo",
    "/runcodeaction",
    "/signatureHelp",
    "/typelookup",
    "/v2/getcodeactions",
    "/v2/runcodeaction",
];

/// Map a command name to its queue. Unlisted commands are Deferred.
#[must_use]
pub fn classify(command: &str) -> QueueClass {
    if PRIORITY_COMMANDS.contains(&command) {
        QueueClass::Priority
    } else if NORMAL_COMMANDS.contains(&command) {
        QueueClass::Normal
    } else {
        QueueClass::Deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sync_is_priority() {
        assert_eq!(classify("/updatebuffer"), QueueClass::Priority);
        assert_eq!(classify("/changebuffer"), QueueClass::Priority);
        assert_eq!(classify("/formatAfterKeystroke"), QueueClass::Priority);
    }

    #[test]
    fn test_interactive_features_are_normal() {
        assert_eq!(classify("/gotoDefinition"), QueueClass::Normal);
        assert_eq!(classify("/v2/getcodeactions"), QueueClass::Normal);
        assert_eq!(classify("/signatureHelp"), QueueClass::Normal);
    }

    #[test]
    fn test_unlisted_commands_are_deferred() {
        assert_eq!(classify("/codecheck"), QueueClass::Deferred);
        assert_eq!(classify("/projects"), QueueClass::Deferred);
        assert_eq!(classify(""), QueueClass::Deferred);
    }

    #[test]
    fn test_classification_is_case_sensitive() {
        assert_eq!(classify("/UpdateBuffer"), QueueClass::Deferred);
    }
}
