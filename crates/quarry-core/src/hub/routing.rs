//! Static routing table: category → next state
//!
//! Declared once and checked at construction, so a category without a
//! successor is a configuration error rather than a runtime surprise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::types::Category;

/// Branch the Hub enters after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    DirectAnswer,
    QueryChain,
    Load,
    Visualize,
    Refuse,
}

pub const DEFAULT_ROUTES: [(Category, Route); 5] = [
    (Category::DirectStat, Route::DirectAnswer),
    (Category::StructuredQuery, Route::QueryChain),
    (Category::Visualization, Route::Visualize),
    (Category::LoadData, Route::Load),
    (Category::Rejected, Route::Refuse),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<Category, Route>,
}

impl RoutingTable {
    /// Build a table; every category must appear exactly once
    pub fn from_entries(entries: &[(Category, Route)]) -> Result<Self, ConfigError> {
        let mut routes = BTreeMap::new();
        for (category, route) in entries {
            if routes.insert(*category, *route).is_some() {
                return Err(ConfigError::DuplicateRoute(category.to_string()));
            }
        }

        if let Some(missing) = Category::ALL.iter().find(|c| !routes.contains_key(c)) {
            return Err(ConfigError::MissingRoute(missing.to_string()));
        }

        Ok(Self { routes })
    }

    pub fn route(&self, category: Category) -> Route {
        // Complete by construction.
        self.routes[&category]
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            routes: DEFAULT_ROUTES.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_complete() {
        let table = RoutingTable::from_entries(&DEFAULT_ROUTES).unwrap();
        assert_eq!(table, RoutingTable::default());
        for category in Category::ALL {
            table.route(category);
        }
        assert_eq!(table.route(Category::DirectStat), Route::DirectAnswer);
    }

    #[test]
    fn test_missing_category_is_rejected() {
        let err = RoutingTable::from_entries(&DEFAULT_ROUTES[..4]).unwrap_err();
        assert_eq!(err, ConfigError::MissingRoute("rejected".into()));
    }

    #[test]
    fn test_duplicate_category_is_rejected() {
        let mut entries = DEFAULT_ROUTES.to_vec();
        entries.push((Category::LoadData, Route::Refuse));
        let err = RoutingTable::from_entries(&entries).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateRoute("load_data".into()));
    }
}
