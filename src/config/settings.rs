//! Registry of recognized description-file settings.

/// Assignment operators a setting may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `setting = value`
    Equals,
    /// `setting: value`
    Colon,
    /// `setting += value`
    PlusEqual,
}

/// Returns the operators valid for a setting, or `None` if unknown.
pub fn allowed_operators(setting: &str) -> Option<&'static [Operator]> {
    use Operator::*;

    const EQ: &[Operator] = &[Equals];
    const COLON: &[Operator] = &[Colon];
    const EQ_APPEND: &[Operator] = &[Equals, PlusEqual];

    Some(match setting {
        // Identity
        "type" | "description" => EQ,

        // Dependencies
        "depends-on" | "depends-ms" | "waits-for" | "before" | "after" | "depends-on.d"
        | "depends-ms.d" | "waits-for.d" | "consumer-of" => COLON,

        // Commands and environment
        "command" | "stop-command" | "working-dir" | "env-file" => EQ,

        // Process management
        "run-as" | "restart" | "smooth-recovery" | "stop-timeout" | "start-timeout"
        | "restart-delay" | "restart-limit-interval" | "restart-limit-count" | "term-signal"
        | "pid-file" | "ready-notification" => EQ,

        // Logging
        "logfile" | "log-type" | "log-buffer-size" => EQ,

        // Socket activation (accepted for compatibility)
        "socket-listen" | "socket-permissions" | "socket-uid" | "socket-gid" => EQ,

        // Chaining
        "chain-to" => EQ,

        // Option flag sets
        "options" | "load-options" => EQ_APPEND,

        // Resource tuning (accepted for compatibility)
        "rlimit-nofile" | "rlimit-core" | "rlimit-data" | "rlimit-as" | "cgroup" | "nice"
        | "ioprio" | "oom-score-adj" => EQ,

        _ => return None,
    })
}

/// True if the setting name is recognized.
pub fn is_known_setting(setting: &str) -> bool {
    allowed_operators(setting).is_some()
}

/// True if `op` is valid for `setting`.
pub fn valid_operator(setting: &str, op: Operator) -> bool {
    allowed_operators(setting)
        .map(|ops| ops.contains(&op))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_settings() {
        assert!(is_known_setting("type"));
        assert!(is_known_setting("depends-on"));
        assert!(is_known_setting("waits-for.d"));
        assert!(!is_known_setting("no-such-setting"));
    }

    #[test]
    fn operator_validity() {
        assert!(valid_operator("type", Operator::Equals));
        assert!(!valid_operator("type", Operator::Colon));
        assert!(valid_operator("depends-on", Operator::Colon));
        assert!(!valid_operator("depends-on", Operator::Equals));
        assert!(valid_operator("options", Operator::Equals));
        assert!(valid_operator("options", Operator::PlusEqual));
    }
}
