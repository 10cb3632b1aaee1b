//! Outbox import
//!
//! After a remote actor accepts a follow, its public history is pulled from
//! the first page of its outbox and stored oldest-first.

use std::sync::Arc;

use serde_json::Value;

use super::activity::InboundActivity;
use super::client::FederationClient;
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::POSTS_IMPORTED_TOTAL;

/// Counts from one import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

pub struct PostImporter {
    db: Arc<Database>,
    client: Arc<FederationClient>,
}

impl PostImporter {
    pub fn new(db: Arc<Database>, client: Arc<FederationClient>) -> Self {
        Self { db, client }
    }

    /// Import the first outbox page of a stored remote actor
    ///
    /// # Errors
    /// - `Validation` if the owner is not stored or has no outbox
    /// - `NotFound` / `Transport` if the collection cannot be fetched
    pub async fn import_actor(&self, owner: &Actor) -> Result<ImportReport, AppError> {
        let outbox = owner
            .outbox
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("Actor {} has no outbox", owner.id)))?;

        self.import_outbox(outbox, owner).await
    }

    /// Import the first page of `outbox_url` on behalf of `owner`
    ///
    /// Entries are stored in reverse collection order so the oldest gets the
    /// lowest post id. Entries that are not the owner's Create of an embedded
    /// Article or Note are skipped, as are posts already stored.
    pub async fn import_outbox(
        &self,
        outbox_url: &str,
        owner: &Actor,
    ) -> Result<ImportReport, AppError> {
        let owner_id = owner.row_id.ok_or_else(|| {
            AppError::Validation(format!("Actor {} must be stored before import", owner.id))
        })?;

        let collection = self.client.get_activity_json(outbox_url).await?;
        let Some(page) = self.first_page(&collection).await? else {
            tracing::info!(outbox = %outbox_url, "Outbox has no first page; nothing to import");
            return Ok(ImportReport::default());
        };

        let items = page
            .get("orderedItems")
            .or_else(|| page.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut report = ImportReport::default();
        for item in items.iter().rev() {
            match self.import_item(item, owner, owner_id).await {
                Ok(true) => report.imported += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(outbox = %outbox_url, error = %e, "Skipping outbox entry");
                    report.skipped += 1;
                }
            }
        }

        POSTS_IMPORTED_TOTAL
            .with_label_values(&["outbox"])
            .inc_by(report.imported as u64);
        tracing::info!(
            outbox = %outbox_url,
            imported = report.imported,
            skipped = report.skipped,
            "Outbox import finished"
        );

        Ok(report)
    }

    /// `first` may be a page IRI, an embedded page, or a bare `{id}` reference
    async fn first_page(&self, collection: &Value) -> Result<Option<Value>, AppError> {
        match collection.get("first") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(url)) => self.client.get_activity_json(url).await.map(Some),
            Some(page @ Value::Object(fields)) => {
                if fields.contains_key("orderedItems") || fields.contains_key("items") {
                    return Ok(Some(page.clone()));
                }
                match fields.get("id").and_then(Value::as_str) {
                    Some(url) => self.client.get_activity_json(url).await.map(Some),
                    None => Ok(None),
                }
            }
            Some(other) => Err(AppError::Validation(format!(
                "Unexpected outbox `first` value: {}",
                other
            ))),
        }
    }

    async fn import_item(
        &self,
        item: &Value,
        owner: &Actor,
        owner_id: i64,
    ) -> Result<bool, AppError> {
        if !item.is_object() {
            tracing::debug!(entry = %item, "Outbox entry is a bare reference");
            return Ok(false);
        }
        if item.get("type").and_then(Value::as_str) != Some("Create") {
            return Ok(false);
        }

        let InboundActivity::Create(create) = InboundActivity::decode(item)? else {
            return Ok(false);
        };
        if create.actor.id() != owner.id {
            tracing::debug!(
                entry_actor = %create.actor.id(),
                owner = %owner.id,
                "Outbox entry by another actor"
            );
            return Ok(false);
        }

        let post = create.to_new_post(owner_id)?;
        Ok(self.db.insert_post(&post).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// Serve fixed collections at `/empty` and `/outbox`
    async fn serve(outbox: Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let empty = json!({"type": "OrderedCollection", "totalItems": 0});
        let app = Router::new()
            .route("/empty", get(move || std::future::ready(Json(empty.clone()))))
            .route("/outbox", get(move || std::future::ready(Json(outbox.clone()))));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        base
    }

    fn create(actor: &str, n: usize) -> Value {
        json!({
            "type": "Create",
            "actor": actor,
            "object": {
                "type": "Note",
                "id": format!("{}/statuses/{}", actor, n),
                "published": format!("2026-01-0{}T00:00:00Z", n),
                "content": format!("post{}", n)
            }
        })
    }

    async fn importer() -> (PostImporter, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let client = FederationClient::new("rustread-test", Duration::from_secs(5)).unwrap();
        (PostImporter::new(db.clone(), Arc::new(client)), db, temp_dir)
    }

    async fn stored_owner(db: &Database, id: &str) -> Actor {
        let mut owner = Actor::test_remote(id);
        owner.row_id = Some(db.insert_actor(&owner).await.unwrap());
        owner
    }

    #[tokio::test]
    async fn outbox_without_first_page_imports_nothing() {
        let (importer, db, _dir) = importer().await;
        let base = serve(json!({})).await;
        let owner = stored_owner(&db, &format!("{}/users/bob", base)).await;

        let report = importer
            .import_outbox(&format!("{}/empty", base), &owner)
            .await
            .unwrap();

        assert_eq!(report, ImportReport::default());
        assert!(db.get_posts_by_owner(owner.row_id.unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn imports_oldest_first_and_skips_other_entries() {
        let (importer, db, _dir) = importer().await;
        let bob = "https://remote.example/users/bob".to_string();

        let page = json!({
            "type": "OrderedCollection",
            "first": {
                "type": "OrderedCollectionPage",
                "orderedItems": [
                    create(&bob, 3),
                    {"type": "Announce", "actor": bob, "object": "https://elsewhere.example/notes/9"},
                    create("https://elsewhere.example/users/carol", 4),
                    "https://elsewhere.example/activities/5",
                    create(&bob, 2),
                    create(&bob, 1)
                ]
            }
        });
        let server = serve(page).await;
        let owner = stored_owner(&db, &bob).await;

        let report = importer
            .import_outbox(&format!("{}/outbox", server), &owner)
            .await
            .unwrap();

        assert_eq!(report, ImportReport { imported: 3, skipped: 3 });
        let posts = db.get_posts_by_owner(owner.row_id.unwrap()).await.unwrap();
        let contents: Vec<_> = posts.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["post1", "post2", "post3"]);
        assert!(posts.iter().all(|p| p.actor_id == bob));

        // A second run stores nothing new
        let again = importer
            .import_outbox(&format!("{}/outbox", server), &owner)
            .await
            .unwrap();
        assert_eq!(again.imported, 0);
    }

    #[tokio::test]
    async fn owner_must_be_stored() {
        let (importer, _db, _dir) = importer().await;
        let owner = Actor::test_remote("https://remote.example/users/bob");

        let result = importer
            .import_outbox("https://remote.example/users/bob/outbox", &owner)
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
