use thiserror::Error;

/// Failure taxonomy of the execution core.
///
/// `Read`, `NotFound` and `Creation` faults of the persistence layer propagate
/// to the caller. Invariant violations (`Modification`), connector failures and
/// data-context failures raised while a flow node is being driven are turned
/// into incidents on that node instead; see [`EngineError::raises_incident`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not create {entity}: {message}")]
    Creation {
        entity: &'static str,
        message: String,
    },

    #[error("read failed: {0}")]
    Read(String),

    /// A data expression could not be evaluated against the data context.
    #[error("expression evaluation failed: {0}")]
    Expression(String),

    #[error("modification rejected: {0}")]
    Modification(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("connector '{connector}' failed: {message}")]
    ConnectorExecution { connector: String, message: String },

    #[error("invalid correlation: {0}")]
    Correlation(String),

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn creation(entity: &'static str, message: impl Into<String>) -> Self {
        EngineError::Creation {
            entity,
            message: message.into(),
        }
    }

    pub fn modification(message: impl Into<String>) -> Self {
        EngineError::Modification(message.into())
    }

    /// Whether the error halts the flow node that raised it (incident) rather
    /// than propagating out of the engine call.
    pub fn raises_incident(&self) -> bool {
        matches!(
            self,
            EngineError::Modification(_)
                | EngineError::Expression(_)
                | EngineError::ConnectorExecution { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    /// `NotFound` raised for one kind of entity.
    pub fn is_missing(&self, kind: &str) -> bool {
        matches!(self, EngineError::NotFound { entity, .. } if *entity == kind)
    }
}
