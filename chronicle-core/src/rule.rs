//! Business rules.
//!
//! Every mutator guards its invariants with one [`check_rule`] call per rule.
//! A rule is a short-lived value built for a single check: it answers
//! [`BusinessRule::is_broken`] and, only when broken, fills a diagnostic
//! parameter bag through [`BusinessRule::describe`].
//!
//! ```
//! use chronicle_core::rule::{BusinessRule, Parameters, check_rule};
//!
//! struct TitleNotBlank<'a>(&'a str);
//!
//! impl BusinessRule for TitleNotBlank<'_> {
//!     fn is_broken(&self) -> bool {
//!         self.0.trim().is_empty()
//!     }
//!
//!     fn message(&self) -> String {
//!         "title must not be blank".to_string()
//!     }
//!
//!     fn describe(&self, parameters: &mut Parameters) {
//!         parameters.insert("title".into(), self.0.into());
//!     }
//! }
//!
//! assert!(check_rule(&TitleNotBlank("Hello")).is_ok());
//! let violation = check_rule(&TitleNotBlank("  ")).unwrap_err();
//! assert_eq!(violation.message, "title must not be blank");
//! assert_eq!(violation.parameters["title"], "  ");
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// Diagnostic values attached to a rule violation.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// A single named invariant.
pub trait BusinessRule {
    fn is_broken(&self) -> bool;

    /// Human-readable explanation of the broken invariant.
    fn message(&self) -> String;

    /// Rule name reported with violations. Defaults to the type name without
    /// its module path.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Populate diagnostic parameters. Only called for broken rules.
    fn describe(&self, _parameters: &mut Parameters) {}
}

/// A broken business rule, surfaced to the caller as a recoverable
/// command-level failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("business rule `{rule}` violated: {message}")]
pub struct RuleViolation {
    pub rule: &'static str,
    pub message: String,
    pub parameters: Parameters,
}

/// Check a rule, returning a [`RuleViolation`] if it is broken.
///
/// # Errors
///
/// Returns the violation carrying the rule's message and the parameters it
/// described.
pub fn check_rule<R>(rule: &R) -> Result<(), RuleViolation>
where
    R: BusinessRule + ?Sized,
{
    if !rule.is_broken() {
        return Ok(());
    }

    let mut parameters = Parameters::new();
    rule.describe(&mut parameters);
    let violation = RuleViolation {
        rule: rule.name(),
        message: rule.message(),
        parameters,
    };
    tracing::debug!(
        rule = violation.rule,
        message = %violation.message,
        "business rule violated"
    );
    Err(violation)
}
