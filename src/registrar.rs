//! Partition registration with the query catalog.

use std::time::Duration;

use crate::{
    catalog::{wait_for_completion, QueryCatalog, QueryState, Statement},
    config::CatalogArgs,
    error::{Error, Result},
    record::PartitionKey,
};

/// Makes partitions of one table visible to queries.
pub struct PartitionRegistrar<C> {
    catalog: C,
    database: String,
    table: String,
    poll_interval: Duration,
}

impl<C: QueryCatalog> PartitionRegistrar<C> {
    pub fn new(catalog: C, database: &str, table: &str, poll_interval: Duration) -> Self {
        PartitionRegistrar {
            catalog,
            database: database.to_owned(),
            table: table.to_owned(),
            poll_interval,
        }
    }

    pub fn from_args(catalog: C, args: &CatalogArgs) -> Self {
        Self::new(catalog, &args.database, &args.table, args.poll_interval())
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Register `key` at `location`. Registering an existing partition is a no-op.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn register_partition(&self, key: &PartitionKey, location: &str) -> Result<()> {
        let statement = Statement::AddPartition {
            database: self.database.clone(),
            table: self.table.clone(),
            key: key.clone(),
            location: location.to_owned(),
        };
        let id = self
            .catalog
            .submit(&statement)
            .await
            .map_err(|e| Error::registration(key, e))?;
        let state = wait_for_completion(&self.catalog, &id, self.poll_interval)
            .await
            .map_err(|e| Error::registration(key, e))?;
        match state {
            QueryState::Succeeded => {
                tracing::info!("registered partition {key} of {}.{}", self.database, self.table);
                Ok(())
            }
            QueryState::Failed(reason) => Err(Error::registration(key, reason)),
            other => Err(Error::registration(key, format!("query {id} ended {other:?}"))),
        }
    }
}
