//! Validation primitives for deployment plans and inventories.
//!
//! Plan validation collects every violation instead of stopping at the
//! first one, so an operator sees the whole list of problems in a plan
//! file after a single `flotilla validate`.

use std::fmt;

/// What is wrong with a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorKind {
    /// Missing or blank.
    Required,
    /// A list with no entries.
    Empty,
    /// A number outside its allowed interval.
    Range,
    /// The same value appears twice where it must be unique.
    Duplicate,
    /// Fields that are fine alone but not together.
    Constraint,
}

impl ValidationErrorKind {
    /// Short lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Empty => "empty",
            Self::Range => "range",
            Self::Duplicate => "duplicate",
            Self::Constraint => "constraint",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem with one field of a plan.
///
/// `field` uses the plan file's own spelling, with indices for list
/// entries, so the message points straight at the offending line:
///
/// ```
/// use flotilla_core::{ValidationError, ValidationErrorKind};
///
/// let error = ValidationError::duplicate("servers[3].id", "web-1");
/// assert_eq!(error.kind, ValidationErrorKind::Duplicate);
/// assert_eq!(error.to_string(), "servers[3].id: 'web-1' is already used");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path of the field, e.g. `healthCheck.maxAttempts`.
    pub field: String,
    /// What is wrong.
    pub message: String,
    /// Category.
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    /// Creates an error with an explicit kind.
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        kind: ValidationErrorKind,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            kind,
        }
    }

    /// The field is missing or blank.
    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, "is required", ValidationErrorKind::Required)
    }

    /// The list has no entries.
    pub fn empty(field: impl Into<String>) -> Self {
        Self::new(field, "needs at least one entry", ValidationErrorKind::Empty)
    }

    /// The number is out of range; `message` states the allowed range.
    pub fn range(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, ValidationErrorKind::Range)
    }

    /// `value` was already used by an earlier entry.
    pub fn duplicate(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::new(
            field,
            format!("'{value}' is already used"),
            ValidationErrorKind::Duplicate,
        )
    }

    /// A cross-field rule is broken.
    pub fn constraint(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, ValidationErrorKind::Constraint)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Every problem found in one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a problem.
    pub fn add(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    /// True when nothing was recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of problems.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// The recorded problems, in the order they were found.
    pub fn iter(&self) -> std::slice::Iter<'_, ValidationError> {
        self.0.iter()
    }

    /// True if any problem concerns `field`.
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    /// `Ok(())` when nothing was recorded.
    ///
    /// # Errors
    ///
    /// Returns `self` when it holds at least one problem.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<'a> IntoIterator for &'a ValidationErrors {
    type Item = &'a ValidationError;
    type IntoIter = std::slice::Iter<'a, ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<ValidationError> for ValidationErrors {
    fn from_iter<T: IntoIterator<Item = ValidationError>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        write!(f, "{} problems", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Types that check their own invariants.
pub trait Validate {
    /// Returns every violation found.
    ///
    /// # Errors
    ///
    /// Returns the collected problems when there is at least one.
    fn validate(&self) -> Result<(), ValidationErrors>;

    /// Shorthand for `validate().is_ok()`.
    fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_kind() {
        assert_eq!(
            ValidationError::required("environment").kind,
            ValidationErrorKind::Required
        );
        assert_eq!(ValidationError::empty("servers").kind, ValidationErrorKind::Empty);
        assert_eq!(
            ValidationError::duplicate("servers[1].id", "web-1").kind,
            ValidationErrorKind::Duplicate
        );
    }

    #[test]
    fn test_error_display_names_field() {
        assert_eq!(
            ValidationError::required("targetVersion").to_string(),
            "targetVersion: is required"
        );
        assert_eq!(
            ValidationError::empty("servers").to_string(),
            "servers: needs at least one entry"
        );
    }

    #[test]
    fn test_into_result() {
        assert!(ValidationErrors::new().into_result().is_ok());

        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::range("batchSize", "must be at least 1"));
        let err = errors.into_result().unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.has_field("batchSize"));
        assert!(!err.has_field("environment"));
    }

    #[test]
    fn test_display_single_and_many() {
        let single: ValidationErrors =
            std::iter::once(ValidationError::required("environment")).collect();
        assert_eq!(single.to_string(), "environment: is required");

        let many: ValidationErrors = [
            ValidationError::required("environment"),
            ValidationError::range("batchSize", "must be at least 1"),
        ]
        .into_iter()
        .collect();
        let display = many.to_string();
        assert!(display.starts_with("2 problems"));
        assert!(display.contains("\n  - batchSize: must be at least 1"));
        assert_eq!((&many).into_iter().count(), 2);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ValidationErrorKind::Duplicate.to_string(), "duplicate");
        assert_eq!(ValidationErrorKind::Constraint.as_str(), "constraint");
    }
}
