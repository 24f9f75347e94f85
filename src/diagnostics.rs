//! Warning sink for compilation diagnostics.
//!
//! Warnings never abort compilation. They are collected on the
//! experiment context so callers can inspect them after the fact, and
//! mirrored to the `tracing` subscriber as they occur. Mild warnings
//! (housekeeping the compiler papers over, like inserting a default
//! value) can be suppressed separately from the rest.

/// How serious a warning is, for suppression purposes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Suppressed by `suppress_mild_warnings` or `suppress_all_warnings`.
    Mild,
    /// Suppressed only by `suppress_all_warnings`.
    Normal,
}

#[derive(Debug, Clone)]
pub struct Warning {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    pub suppress_mild_warnings: bool,
    pub suppress_all_warnings: bool,
    collected: Vec<Warning>,
}

impl Diagnostics {
    pub fn new(suppress_mild_warnings: bool, suppress_all_warnings: bool) -> Self {
        Diagnostics {
            suppress_mild_warnings,
            suppress_all_warnings,
            collected: Vec::new(),
        }
    }

    pub fn warn(&mut self, severity: Severity, message: impl Into<String>) {
        let suppressed = match severity {
            Severity::Mild => self.suppress_mild_warnings || self.suppress_all_warnings,
            Severity::Normal => self.suppress_all_warnings,
        };
        if suppressed {
            return;
        }
        let message = message.into();
        tracing::warn!("{message}");
        self.collected.push(Warning { severity, message });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.collected
    }

    pub fn clear(&mut self) {
        self.collected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_levels() {
        let mut d = Diagnostics::new(true, false);
        d.warn(Severity::Mild, "mild");
        d.warn(Severity::Normal, "normal");
        assert_eq!(d.warnings().len(), 1);
        assert_eq!(d.warnings()[0].message, "normal");

        let mut d = Diagnostics::new(false, true);
        d.warn(Severity::Mild, "mild");
        d.warn(Severity::Normal, "normal");
        assert!(d.warnings().is_empty());
    }
}
