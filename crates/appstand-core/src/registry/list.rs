//! Paginated application listing.

use serde_json::Value;

use crate::error::RegistryError;
use crate::space::Space;
use crate::store::{Query, SortOrder, StoreError};

use super::{App, Registry};

/// Page size when the client does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Hard cap on the page size.
pub const MAX_PAGE_LIMIT: usize = 200;

/// Fields accepted in `filter[<field>]` query parameters.
const FILTER_FIELDS: [&str; 5] = ["slug", "type", "editor", "category", "tags"];

/// Fields accepted as sort keys. A leading `-` flips the direction.
const SORT_FIELDS: [&str; 5] = ["slug", "type", "editor", "category", "created_at"];

/// Listing options.
#[derive(Debug, Clone, Default)]
pub struct AppsListOptions {
    /// Equality filters on whitelisted fields.
    pub filters: Vec<(String, String)>,
    /// Zero-based row offset.
    pub cursor: i64,
    /// Page size; zero means the default.
    pub limit: usize,
    /// Sort key, optionally prefixed with `-` for descending.
    pub sort: Option<String>,
}

/// One page of applications.
#[derive(Debug)]
pub struct AppsPage {
    /// The page rows.
    pub apps: Vec<App>,
    /// Offset of the next page, or -1 when this is the last one.
    pub next_cursor: i64,
}

impl Registry {
    /// Returns a page of applications. The store is asked for one extra
    /// row beyond the limit; its presence is the next-page signal.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppInvalid`] on non-whitelisted filter or sort
    /// fields.
    pub async fn get_apps_list(
        &self,
        space: &Space,
        opts: &AppsListOptions,
    ) -> Result<AppsPage, RegistryError> {
        let limit = match opts.limit {
            0 => DEFAULT_PAGE_LIMIT,
            n => n.min(MAX_PAGE_LIMIT),
        };
        let cursor = opts.cursor.max(0);

        let mut query = Query::default()
            .with_skip(cursor as usize)
            .with_limit(limit + 1);

        for (field, value) in &opts.filters {
            if !FILTER_FIELDS.contains(&field.as_str()) {
                return Err(RegistryError::AppInvalid(format!(
                    "unknown filter field {field:?}"
                )));
            }
            query = query.and(field, Value::String(value.clone()));
        }

        let (sort_field, order) = match opts.sort.as_deref() {
            None | Some("") => ("slug", SortOrder::Asc),
            Some(key) => {
                let (field, order) = match key.strip_prefix('-') {
                    Some(field) => (field, SortOrder::Desc),
                    None => (key, SortOrder::Asc),
                };
                if !SORT_FIELDS.contains(&field) {
                    return Err(RegistryError::AppInvalid(format!(
                        "unknown sort field {field:?}"
                    )));
                }
                (field, order)
            },
        };
        query = query.sorted_by(sort_field, order);

        let mut rows = self.docs.query(&space.apps_namespace(), &query).await?;
        let next_cursor = if rows.len() > limit {
            rows.truncate(limit);
            cursor + limit as i64
        } else {
            -1
        };

        let mut apps = Vec::with_capacity(rows.len());
        for row in rows {
            let app: App = serde_json::from_value(row.body)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            apps.push(app);
        }

        Ok(AppsPage { apps, next_cursor })
    }
}
