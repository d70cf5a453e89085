use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::backend::TableStore;
use crate::error::{IkatsError, Result};
use crate::model::{check_identifier, Table, TableDesc, TableSummary};

/// Rows keyed by the observation id, then by column name.
pub type Extracted = BTreeMap<String, BTreeMap<String, Value>>;

fn cell_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Table {
    pub fn name(&self) -> Option<&str> {
        self.table_desc.as_ref().map(|d| d.name.as_str())
    }

    /// Indexes the rows by the `obs_id` column and keeps the `items` columns.
    ///
    /// Column names come from the column header. When a row header exists,
    /// its cells (minus the corner one) are the first column of each line.
    pub fn extract(&self, obs_id: &str, items: &[&str]) -> Result<Extracted> {
        let headers = self.headers.as_ref();
        let columns: HashMap<String, usize> = headers
            .and_then(|h| h.col.as_ref())
            .ok_or_else(|| IkatsError::input("Table content shall contain col headers to know the name of columns"))?
            .data
            .iter()
            .enumerate()
            .map(|(i, name)| (cell_key(name), i))
            .collect();
        let column = |name: &str| {
            columns
                .get(name)
                .copied()
                .ok_or_else(|| IkatsError::input(format!("No column named '{}'", name)))
        };

        let key_col = column(obs_id)?;
        let item_cols = items
            .iter()
            .map(|item| Ok((item.to_string(), column(item)?)))
            .collect::<Result<Vec<_>>>()?;
        let row_headers: Vec<&Value> = headers
            .and_then(|h| h.row.as_ref())
            .map(|r| r.data.iter().skip(1).collect())
            .unwrap_or_default();

        let mut out = Extracted::new();
        for (i, cells) in self.content.cells.iter().enumerate() {
            let line: Vec<&Value> = row_headers.get(i).copied().into_iter().chain(cells.iter()).collect();
            let cell = |col: usize| {
                line.get(col)
                    .copied()
                    .ok_or_else(|| IkatsError::input(format!("Line {} has no column {}", i, col)))
            };

            let key = cell_key(cell(key_col)?);
            if out.contains_key(&key) {
                return Err(IkatsError::input(format!("Key {} is not unique ({})", obs_id, key)));
            }
            let mut row = BTreeMap::new();
            for (name, col) in &item_cols {
                row.insert(name.clone(), cell(*col)?.clone());
            }
            out.insert(key, row);
        }
        Ok(out)
    }
}

#[derive(Clone)]
pub struct TableManager {
    store: Arc<dyn TableStore>,
}

impl TableManager {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Stores `table`; `name` and `description` overwrite its descriptor.
    /// Returns the name it was saved under.
    pub async fn create(&self, mut table: Table, name: Option<&str>, description: Option<&str>) -> Result<String> {
        let desc = table.table_desc.get_or_insert_with(TableDesc::default);
        if let Some(name) = name {
            desc.name = name.to_string();
        }
        if let Some(description) = description {
            desc.description = description.to_string();
        }
        let name = desc.name.clone();
        check_identifier("table name", &name)?;

        self.store.create(&table).await?;
        info!("Table {} created ({} lines)", name, table.content.cells.len());
        Ok(name)
    }

    /// With `strict` off, `*` in `name` matches any characters.
    pub async fn list(&self, name: Option<&str>, strict: bool) -> Result<Vec<TableSummary>> {
        self.store.list(name, strict).await
    }

    pub async fn read(&self, name: &str) -> Result<Table> {
        check_identifier("table name", name)?;
        self.store.read(name).await
    }

    pub async fn delete(&self, name: &str, missing_ok: bool) -> Result<bool> {
        check_identifier("table name", name)?;
        match self.store.delete(name).await {
            Ok(()) => {
                info!("Table {} removed", name);
                Ok(true)
            }
            Err(e) if missing_ok && e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
