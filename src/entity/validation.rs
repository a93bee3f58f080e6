use crate::Result;
use crate::ValidationError;
use crate::Violation;

/// Collects field-level violations and folds them into one error.
#[derive(Debug)]
pub(crate) struct Validator {
    entity: String,
    violations: Vec<Violation>,
}

impl Validator {
    pub(crate) fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            violations: Vec::new(),
        }
    }

    pub(crate) fn check(
        &mut self,
        ok: bool,
        field: &str,
        message: impl Into<String>,
    ) -> &mut Self {
        if !ok {
            self.violations.push(Violation::new(field, message));
        }
        self
    }

    pub(crate) fn non_empty(
        &mut self,
        field: &str,
        value: &str,
    ) -> &mut Self {
        self.check(!value.is_empty(), field, "is required")
    }

    pub(crate) fn one_of(
        &mut self,
        field: &str,
        value: &str,
        allowed: &[&str],
    ) -> &mut Self {
        self.check(
            allowed.contains(&value),
            field,
            format!("{value:?} must be one of {allowed:?}"),
        )
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.violations.is_empty() {
            return Ok(());
        }

        Err(ValidationError {
            entity: self.entity,
            violations: self.violations,
        }
        .into())
    }
}
