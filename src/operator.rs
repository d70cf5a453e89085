use std::sync::Arc;

use crate::backend::OperatorCatalog;
use crate::error::{IkatsError, Result};
use crate::model::Operator;

/// Read-only access to the operator catalog.
#[derive(Clone)]
pub struct OperatorManager {
    catalog: Arc<dyn OperatorCatalog>,
}

impl OperatorManager {
    pub fn new(catalog: Arc<dyn OperatorCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn list(&self) -> Result<Vec<Operator>> {
        self.catalog.list().await
    }

    pub async fn get(&self, name: &str) -> Result<Operator> {
        if name.is_empty() {
            return Err(IkatsError::input("operator name shall not be empty"));
        }
        self.catalog.get(name).await
    }
}
