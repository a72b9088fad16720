//! Diagnostics: warning categories, `-W` flag handling, and counting.
//!
//! Fatal problems abort a stage immediately through [`Fatal`]; errors and
//! warnings are counted by a [`Reporter`] so one run can surface as many
//! diagnostics as possible, and the final error count decides the exit
//! code.

use core::fmt;

/// A warning category.
///
/// Every category can be silenced, promoted to an error, or left as a
/// warning, individually or uniformly via `-Werror`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// A link-time assertion of WARN severity failed.
    Assert,
    /// Suspicious argument to a built-in function.
    BuiltinArg,
    /// Division overflow (`INT_MIN / -1` and friends).
    Div,
    /// STRRPL with an empty search pattern.
    EmptyStrrpl,
    /// Unusually long string literal.
    LongString,
    /// A multi-character string used as a number.
    NumericString1,
    /// A string longer than four characters used as a number.
    NumericString2,
    /// Deprecated syntax.
    Obsolete,
    /// PURGE of an exported symbol.
    Purge,
    /// Suspicious shift amount.
    ShiftAmount,
    /// A constant does not fit the destination width.
    Truncation1,
    /// A constant is far outside the destination width.
    Truncation2,
    /// WARN directive in user code.
    User,
}

impl Warning {
    /// Every category, for iteration and table sizing.
    pub const ALL: [Warning; 13] = [
        Warning::Assert,
        Warning::BuiltinArg,
        Warning::Div,
        Warning::EmptyStrrpl,
        Warning::LongString,
        Warning::NumericString1,
        Warning::NumericString2,
        Warning::Obsolete,
        Warning::Purge,
        Warning::ShiftAmount,
        Warning::Truncation1,
        Warning::Truncation2,
        Warning::User,
    ];

    /// The name used with `-W`.
    pub fn name(self) -> &'static str {
        match self {
            Warning::Assert => "assert",
            Warning::BuiltinArg => "builtin-arg",
            Warning::Div => "div",
            Warning::EmptyStrrpl => "empty-strrpl",
            Warning::LongString => "long-string",
            Warning::NumericString1 => "numeric-string-1",
            Warning::NumericString2 => "numeric-string-2",
            Warning::Obsolete => "obsolete",
            Warning::Purge => "purge",
            Warning::ShiftAmount => "shift-amount",
            Warning::Truncation1 => "truncation-1",
            Warning::Truncation2 => "truncation-2",
            Warning::User => "user",
        }
    }

    fn from_name(name: &str) -> Option<Warning> {
        // "numeric-string" covers both levels.
        if name == "numeric-string" {
            return Some(Warning::NumericString1);
        }
        if name == "truncation" {
            return Some(Warning::Truncation1);
        }
        Warning::ALL.iter().copied().find(|w| w.name() == name)
    }

    /// The other level of a two-level category, if any.
    fn sibling(self) -> Option<Warning> {
        match self {
            Warning::NumericString1 => Some(Warning::NumericString2),
            Warning::Truncation1 => Some(Warning::Truncation2),
            _ => None,
        }
    }
}

/// What to do when a warning fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Allow,
    Warn,
    Error,
}

/// Per-category warning settings, built from `-W` flags.
#[derive(Debug, Clone)]
pub struct WarningConfig {
    levels: [Level; Warning::ALL.len()],
    /// `-Werror`: promote every enabled warning.
    error_all: bool,
}

impl Default for WarningConfig {
    fn default() -> Self {
        WarningConfig {
            levels: [Level::Warn; Warning::ALL.len()],
            error_all: false,
        }
    }
}

impl WarningConfig {
    /// Apply one `-W` flag value, e.g. `error`, `error=assert`,
    /// `no-obsolete`, or `user`.
    pub fn apply_flag(&mut self, flag: &str) -> Result<(), BadWarningFlag> {
        if flag == "error" {
            self.error_all = true;
            return Ok(());
        }
        if let Some(name) = flag.strip_prefix("error=") {
            return self.set(name, Level::Error);
        }
        if let Some(name) = flag.strip_prefix("no-") {
            return self.set(name, Level::Allow);
        }
        self.set(flag, Level::Warn)
    }

    fn set(&mut self, name: &str, level: Level) -> Result<(), BadWarningFlag> {
        let warning = Warning::from_name(name).ok_or_else(|| BadWarningFlag(name.to_owned()))?;
        self.levels[warning as usize] = level;
        if let Some(sibling) = warning.sibling() {
            self.levels[sibling as usize] = level;
        }
        Ok(())
    }

    fn level(&self, warning: Warning) -> Level {
        match self.levels[warning as usize] {
            Level::Allow => Level::Allow,
            Level::Error => Level::Error,
            Level::Warn if self.error_all => Level::Error,
            Level::Warn => Level::Warn,
        }
    }
}

/// An unknown warning name was passed to `-W`.
#[derive(Debug, Clone)]
pub struct BadWarningFlag(pub String);

impl fmt::Display for BadWarningFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown warning `{}`", self.0)
    }
}

impl std::error::Error for BadWarningFlag {}

/// An unrecoverable condition; the stage stops immediately.
#[derive(Debug, Clone)]
pub struct Fatal(pub String);

impl Fatal {
    pub(crate) fn new(message: impl Into<String>) -> Fatal {
        Fatal(message.into())
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Fatal {}

/// Counts and prints diagnostics for one stage.
#[derive(Debug, Default)]
pub struct Reporter {
    config: WarningConfig,
    errors: usize,
    warnings: usize,
}

impl Reporter {
    /// Create a reporter with the given warning settings.
    pub fn new(config: WarningConfig) -> Reporter {
        Reporter {
            config,
            errors: 0,
            warnings: 0,
        }
    }

    /// Report an error at `loc`. Processing continues where sensible.
    pub fn error(&mut self, loc: impl fmt::Display, message: impl fmt::Display) {
        self.errors += 1;
        eprintln!("error: {}:\n    {}", loc, message);
    }

    /// Report a warning at `loc`, honoring the category's configuration.
    pub fn warning(&mut self, warning: Warning, loc: impl fmt::Display, message: impl fmt::Display) {
        match self.config.level(warning) {
            Level::Allow => {}
            Level::Warn => {
                self.warnings += 1;
                eprintln!("warning: {}: [-W{}]\n    {}", loc, warning.name(), message);
            }
            Level::Error => {
                self.errors += 1;
                eprintln!(
                    "error: {}: [-Werror={}]\n    {}",
                    loc,
                    warning.name(),
                    message
                );
            }
        }
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Number of warnings reported so far.
    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    /// Whether any error was reported.
    pub fn has_errors(&self) -> bool {
        self.errors != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        let mut config = WarningConfig::default();
        config.apply_flag("no-obsolete").unwrap();
        config.apply_flag("error=assert").unwrap();
        assert_eq!(config.level(Warning::Obsolete), Level::Allow);
        assert_eq!(config.level(Warning::Assert), Level::Error);
        assert_eq!(config.level(Warning::User), Level::Warn);
        assert!(config.apply_flag("no-such-warning").is_err());
    }

    #[test]
    fn error_all_respects_allow() {
        let mut config = WarningConfig::default();
        config.apply_flag("no-div").unwrap();
        config.apply_flag("error").unwrap();
        assert_eq!(config.level(Warning::Div), Level::Allow);
        assert_eq!(config.level(Warning::User), Level::Error);
    }

    #[test]
    fn two_level_categories_share_flags() {
        let mut config = WarningConfig::default();
        config.apply_flag("no-numeric-string").unwrap();
        assert_eq!(config.level(Warning::NumericString1), Level::Allow);
        assert_eq!(config.level(Warning::NumericString2), Level::Allow);
    }
}
