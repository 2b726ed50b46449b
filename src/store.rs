// =============================================================================
// Rule Store — durable document collection of rules, backed by MongoDB
// =============================================================================
//
// Wraps a single `watch_rules` collection. Indexes on `user_id`, `watch_type`,
// `active` are created idempotently on connect — creating an index that
// already exists with the same keys is a no-op in MongoDB, so no special
// "already exists" handling is needed beyond logging the attempt.
// =============================================================================

use anyhow::{Context as _, Result};
use bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, instrument, warn};

use crate::models::{Rule, WatchType};

const COLLECTION: &str = "watch_rules";

#[derive(Clone)]
pub struct RuleStore {
    collection: Collection<Rule>,
}

impl RuleStore {
    #[instrument(skip(mongo_url), name = "store::connect")]
    pub async fn connect(mongo_url: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(mongo_url)
            .await
            .context("failed to build mongodb client")?;

        // Verify connectivity eagerly rather than on first use.
        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .context("mongodb ping failed")?;

        let collection = client.database(db_name).collection::<Rule>(COLLECTION);
        let store = Self { collection };
        store.ensure_indexes().await?;

        debug!(db = db_name, "rule store connected");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let unique = IndexOptions::builder().unique(true).build();
        let models = vec![
            IndexModel::builder()
                .keys(doc! { "rule_id": 1 })
                .options(unique)
                .build(),
            IndexModel::builder().keys(doc! { "user_id": 1 }).build(),
            IndexModel::builder().keys(doc! { "watch_type": 1 }).build(),
            IndexModel::builder().keys(doc! { "active": 1 }).build(),
        ];

        self.collection
            .create_indexes(models)
            .await
            .context("failed to create watch_rules indexes")?;
        Ok(())
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id))]
    pub async fn save(&self, rule: &Rule) -> Result<()> {
        self.collection
            .insert_one(rule)
            .await
            .with_context(|| format!("failed to insert rule {}", rule.rule_id))?;
        Ok(())
    }

    /// Partial `$set` patch on a single document. Returns whether any
    /// document matched `rule_id`.
    #[instrument(skip(self, patch), fields(%rule_id))]
    pub async fn update(&self, rule_id: &str, patch: bson::Document) -> Result<bool> {
        let result = self
            .collection
            .update_one(doc! { "rule_id": rule_id }, doc! { "$set": patch })
            .await
            .with_context(|| format!("failed to update rule {rule_id}"))?;
        Ok(result.matched_count > 0)
    }

    pub async fn deactivate(&self, rule_id: &str) -> Result<bool> {
        self.update(rule_id, doc! { "active": false }).await
    }

    #[instrument(skip(self))]
    pub async fn get_active(&self, watch_type: Option<WatchType>) -> Result<Vec<Rule>> {
        let mut filter = doc! { "active": true };
        if let Some(wt) = watch_type {
            filter.insert("watch_type", wt.as_str());
        }

        let mut cursor = self
            .collection
            .find(filter)
            .await
            .context("failed to query active rules")?;

        let mut rules = Vec::new();
        while cursor.advance().await.context("cursor advance failed")? {
            match cursor.deserialize_current() {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(error = %e, "skipping malformed rule document"),
            }
        }

        debug!(count = rules.len(), "active rules loaded");
        Ok(rules)
    }

    #[instrument(skip(self, error), fields(%rule_id, %status))]
    pub async fn update_status(
        &self,
        rule_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut patch = doc! {
            "status": status,
            "updated_at": bson::DateTime::now(),
        };
        if let Some(err) = error {
            patch.insert("last_error", err);
        }
        self.update(rule_id, patch).await
    }
}
