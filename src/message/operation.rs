use crate::error::{Result, RpcError};
use crate::message::types::{RpcArgs, RpcType};

/// Queue name of a remote operation: the base alias followed by the
/// parameter type names and the return type name, so overloads with the
/// same alias land on distinct queues.
///
/// Client and server both go through [`OperationName::derive`]; any
/// divergence would route calls to a queue nobody consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationName(String);

impl OperationName {
    pub fn derive(alias: &str, params: &[String], returns: &str) -> Result<Self> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(RpcError::AliasResolution("operation alias must not be empty".to_string()));
        }

        Ok(OperationName(format!("{}_{}_{}", alias, params.join("_"), returns)))
    }

    /// Name for a call with argument tuple `A` returning `R`.
    pub fn of<A: RpcArgs, R: RpcType>(alias: &str) -> Result<Self> {
        Self::derive(alias, &A::type_names(), &R::type_name())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OperationName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
