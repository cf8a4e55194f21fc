//! Validation System - Rule/Policy Separation
//!
//! Rules inspect role definitions and produce structured violations.
//! Policy decides whether those violations block the run.

use serde::{Deserialize, Serialize};

use crate::compositor::MAX_REMINDER_LEAVES;
use crate::role::{Role, RoleSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub role: String,
    pub severity: ViolationSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Block,
    Warn,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{} ({}): {}", v.role, v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, role: &Role) -> Vec<ValidationViolation>;
}

fn violation(
    rule: &dyn ValidationRule,
    role: &Role,
    severity: ViolationSeverity,
    message: String,
) -> ValidationViolation {
    ValidationViolation {
        rule: rule.name().to_string(),
        role: role.name.clone(),
        severity,
        message,
    }
}

// --- Concrete Rules ---

pub struct NameRule;

impl ValidationRule for NameRule {
    fn name(&self) -> &'static str { "name" }

    fn validate(&self, role: &Role) -> Vec<ValidationViolation> {
        if role.id().is_empty() {
            vec![violation(
                self,
                role,
                ViolationSeverity::Error,
                format!("name '{}' has no letters or digits", role.name),
            )]
        } else {
            vec![]
        }
    }
}

pub struct ReminderLabelRule;

impl ValidationRule for ReminderLabelRule {
    fn name(&self) -> &'static str { "reminders" }

    fn validate(&self, role: &Role) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        if role.reminders.iter().any(|r| r.trim().is_empty()) {
            violations.push(violation(
                self,
                role,
                ViolationSeverity::Error,
                "blank reminder label".to_string(),
            ));
        }
        if role.reminders.len() > MAX_REMINDER_LEAVES {
            violations.push(violation(
                self,
                role,
                ViolationSeverity::Warning,
                format!(
                    "{} reminders, only {} leaves are drawn",
                    role.reminders.len(),
                    MAX_REMINDER_LEAVES
                ),
            ));
        }
        violations
    }
}

pub struct IconRule;

impl ValidationRule for IconRule {
    fn name(&self) -> &'static str { "icon" }

    fn validate(&self, role: &Role) -> Vec<ValidationViolation> {
        match &role.icon {
            Some(path) if !path.is_file() => vec![violation(
                self,
                role,
                ViolationSeverity::Warning,
                format!("icon {} not found, component fallback will be used", path.display()),
            )],
            _ => vec![],
        }
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
    failure_mode: FailureMode,
}

impl Validator {
    pub fn new(failure_mode: FailureMode) -> Self {
        Self {
            rules: vec![
                Box::new(NameRule),
                Box::new(ReminderLabelRule),
                Box::new(IconRule),
            ],
            failure_mode,
        }
    }

    pub fn validate_role(&self, role: &Role) -> Vec<ValidationViolation> {
        self.rules.iter().flat_map(|rule| rule.validate(role)).collect()
    }

    pub fn validate(&self, roles: &RoleSet) -> ValidationReport {
        self.validate_roles(roles.iter_sorted().into_iter().map(|r| r.as_ref()))
    }

    /// Validate only the given roles, e.g. the ones a script uses.
    pub fn validate_roles<'a, I>(&self, roles: I) -> ValidationReport
    where
        I: IntoIterator<Item = &'a Role>,
    {
        let violations: Vec<_> = roles
            .into_iter()
            .flat_map(|role| self.validate_role(role))
            .collect();

        let has_errors = violations.iter().any(|v| v.severity == ViolationSeverity::Error);
        let valid = match self.failure_mode {
            FailureMode::Block => !has_errors,
            FailureMode::Warn => true,
        };
        ValidationReport { valid, violations }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(FailureMode::Block)
    }
}
