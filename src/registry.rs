use crate::connection::config::DatabasesConfig;
use crate::connection::pool::PoolFactory;
use crate::core::{DbError, Result};
use crate::transaction::Database;
use log::{error, info, warn};
use std::collections::BTreeMap;

/// Named logical databases built from a [`DatabasesConfig`].
///
/// Each database gets its own pool and its own scope stack, so units-of-work
/// on different databases nest independently.
#[derive(Debug)]
pub struct DatabaseRegistry {
    default: String,
    databases: BTreeMap<String, Database>,
}

impl DatabaseRegistry {
    pub fn from_config(config: &DatabasesConfig, factory: &dyn PoolFactory) -> Result<Self> {
        config.validate()?;

        if config.databases.is_empty() {
            warn!("No databases configured; registry is empty");
        }

        let mut databases = BTreeMap::new();
        for (name, pool_config) in &config.databases {
            let pool = factory.build(name, pool_config)?;
            info!("Configured database '{}' at {}", name, pool_config.to_url());
            databases.insert(name.clone(), Database::new(name.as_str(), pool));
        }

        Ok(Self {
            default: config.default.clone(),
            databases,
        })
    }

    pub fn database(&self, name: &str) -> Result<&Database> {
        self.databases
            .get(name)
            .ok_or_else(|| DbError::UnknownDatabase(name.to_string()))
    }

    pub fn default_database(&self) -> Result<&Database> {
        self.database(&self.default)
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Shut every pool down, returning the first failure after trying all
    pub async fn shutdown(&self) -> Result<()> {
        let mut first = None;
        for (name, database) in &self.databases {
            if let Err(e) = database.pool().shutdown().await {
                error!("Could not shut down pool for '{}': {}", name, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::PoolConfig;
    use crate::transaction::testing::ScriptedPoolFactory;

    fn two_databases() -> DatabasesConfig {
        DatabasesConfig::single("main", PoolConfig::new("main"))
            .with_database("audit", PoolConfig::new("audit"))
    }

    #[tokio::test]
    async fn test_registry_resolves_names() {
        let registry = DatabaseRegistry::from_config(&two_databases(), &ScriptedPoolFactory).unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["audit", "main"]);
        assert_eq!(registry.default_database().unwrap().name(), "main");
        assert_eq!(registry.database("audit").unwrap().pool().name(), "audit");

        let err = registry.database("missing").unwrap_err();
        assert!(matches!(err, DbError::UnknownDatabase(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_databases_have_independent_scopes() {
        let registry = DatabaseRegistry::from_config(&two_databases(), &ScriptedPoolFactory).unwrap();
        let main = registry.database("main").unwrap();
        let audit = registry.database("audit").unwrap();

        main.transaction(None, |_| async {
            assert_eq!(main.depth(), 1);
            assert_eq!(audit.depth(), 0);
            assert!(audit.resolver().current_connection().is_err());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_empty_config_yields_empty_registry() {
        let registry =
            DatabaseRegistry::from_config(&DatabasesConfig::default(), &ScriptedPoolFactory).unwrap();
        assert!(registry.is_empty());
        assert!(registry.default_database().is_err());
        registry.shutdown().await.unwrap();
    }
}
