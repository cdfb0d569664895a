//! Error types for the charm's reconciliation cycle

use thiserror::Error;

use crate::kubectl::CommandError;
use crate::status::UnitStatus;

/// Every way a reconciliation step can stop the cycle.
///
/// Each variant maps onto exactly one unit status through [`Error::status`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration the operator has to fix
    #[error("{0}")]
    Config(String),

    /// Environment not converged yet; retried on the next event
    #[error("{0}")]
    NotReady(String),

    /// Cluster command failure outside the step's allow-list
    #[error("{context}: {source}")]
    Command {
        context: String,
        #[source]
        source: CommandError,
    },

    /// Template could not be rendered
    #[error("failed to render {template}: {source}")]
    Render {
        template: String,
        #[source]
        source: tera::Error,
    },

    /// Manifest serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local file system error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn command(context: impl Into<String>, source: CommandError) -> Self {
        Self::Command {
            context: context.into(),
            source,
        }
    }

    /// Unit status that ends a cycle stopped by this error
    pub fn status(&self) -> UnitStatus {
        match self {
            Self::Config(msg) => UnitStatus::blocked(msg.clone()),
            Self::NotReady(msg) => UnitStatus::waiting(msg.clone()),
            Self::Command { context, .. } => UnitStatus::waiting(context.clone()),
            Self::Render { template, .. } => UnitStatus::blocked(format!("Failed to render {}", template)),
            Self::Serialization(msg) => UnitStatus::blocked(format!("Failed to generate manifest: {}", msg)),
            Self::Io(err) => UnitStatus::waiting(format!("Local file error: {}", err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
