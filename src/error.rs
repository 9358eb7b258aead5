use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Item,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::User => write!(f, "user"),
            Entity::Item => write!(f, "item"),
        }
    }
}

/// Failures raised by the model. Every variant aborts only the offending call;
/// parameters and the item index are left as they were before it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("user tower outputs {user} dims but item tower outputs {item}; dot-product scoring needs them equal")]
    TowerDimensionMismatch { user: usize, item: usize },

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("{entity} index {index} out of range for table with {count} rows")]
    IndexOutOfRange {
        entity: Entity,
        index: usize,
        count: usize,
    },

    #[error("item index is stale (built for parameter version {built_for:?}, current version {current}); call build_index() first")]
    StaleIndex {
        built_for: Option<u64>,
        current: u64,
    },

    #[error("training batch is empty")]
    EmptyBatch,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl ModelError {
    pub(crate) fn shape(context: &str, expected: (usize, usize), actual: (usize, usize)) -> Self {
        ModelError::ShapeMismatch(format!(
            "{}: expected [{}, {}], got [{}, {}]",
            context, expected.0, expected.1, actual.0, actual.1
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ModelError::IndexOutOfRange {
            entity: Entity::Item,
            index: 7,
            count: 5,
        };
        assert_eq!(err.to_string(), "item index 7 out of range for table with 5 rows");

        let err = ModelError::shape("item features", (2, 3), (2, 4));
        assert_eq!(
            err.to_string(),
            "shape mismatch: item features: expected [2, 3], got [2, 4]"
        );
    }
}
