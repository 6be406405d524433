//! JSON Schema validation of request parameters.

use serde_json::Value;
use thiserror::Error;

/// Schema could not be compiled.
#[derive(Debug, Error)]
#[error("invalid schema: {message}")]
pub struct SchemaError {
    pub message: String,
}

/// Parameter schema declared by a handler.
///
/// `ParamSchema::any()` accepts every payload.
pub struct ParamSchema {
    raw: Value,
    validator: Option<jsonschema::Validator>,
}

impl std::fmt::Debug for ParamSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamSchema").field("raw", &self.raw).finish()
    }
}

impl ParamSchema {
    /// Schema that accepts anything.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            raw: Value::Bool(true),
            validator: None,
        }
    }

    /// Compile a JSON Schema document.
    ///
    /// # Errors
    /// Returns `SchemaError` if the document is not a valid schema.
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::options()
            .build(&schema)
            .map_err(|e| SchemaError {
                message: e.to_string(),
            })?;
        Ok(Self {
            raw: schema,
            validator: Some(validator),
        })
    }

    /// The schema document, for capability listings.
    #[must_use]
    pub const fn as_json(&self) -> &Value {
        &self.raw
    }

    /// Validate parameters, collecting every violation.
    ///
    /// # Errors
    /// Returns the list of violation messages if validation fails.
    pub fn validate(&self, params: &Value) -> Result<(), Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(params)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
