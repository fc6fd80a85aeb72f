//! Image repository with version-checked updates

use super::ImageRepository;
use crate::db::Database;
use crate::error::{Result, TiticacaError};
use crate::models::Image;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

const IMAGE_COLUMNS: &str = "id, name, owner, status, size, virtual_size, checksum, disk_format, \
     container_format, locations, extra_properties, importing_stores, failed_stores, \
     completed_stores, version, created_at, updated_at";

/// SQLite-backed image repository
#[derive(Clone, Debug)]
pub struct SqlImageRepository {
    db: Arc<Database>,
}

impl SqlImageRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn from_row(row: &SqliteRow) -> Result<Image> {
        let status: String = row.try_get("status")?;
        let size: Option<i64> = row.try_get("size")?;
        let virtual_size: Option<i64> = row.try_get("virtual_size")?;
        let locations: String = row.try_get("locations")?;
        let extra_properties: String = row.try_get("extra_properties")?;
        let importing: String = row.try_get("importing_stores")?;
        let failed: String = row.try_get("failed_stores")?;
        let completed: String = row.try_get("completed_stores")?;

        Ok(Image {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            status: status.parse()?,
            size: size.map(|s| s as u64),
            virtual_size: virtual_size.map(|s| s as u64),
            checksum: row.try_get("checksum")?,
            disk_format: row.try_get("disk_format")?,
            container_format: row.try_get("container_format")?,
            locations: serde_json::from_str(&locations)?,
            extra_properties: serde_json::from_str(&extra_properties)?,
            importing_stores: serde_json::from_str(&importing)?,
            failed_stores: serde_json::from_str(&failed)?,
            completed_stores: serde_json::from_str(&completed)?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn exists(&self, image_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM images WHERE id = ?")
            .bind(image_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| TiticacaError::Database(format!("Failed to load image: {}", e)))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ImageRepository for SqlImageRepository {
    async fn add(&self, image: &Image) -> Result<Image> {
        sqlx::query(&format!(
            "INSERT INTO images ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            IMAGE_COLUMNS
        ))
        .bind(&image.id)
        .bind(&image.name)
        .bind(&image.owner)
        .bind(image.status.as_str())
        .bind(image.size.map(|s| s as i64))
        .bind(image.virtual_size.map(|s| s as i64))
        .bind(&image.checksum)
        .bind(&image.disk_format)
        .bind(&image.container_format)
        .bind(serde_json::to_string(&image.locations)?)
        .bind(serde_json::to_string(&image.extra_properties)?)
        .bind(serde_json::to_string(&image.importing_stores)?)
        .bind(serde_json::to_string(&image.failed_stores)?)
        .bind(serde_json::to_string(&image.completed_stores)?)
        .bind(image.version)
        .bind(image.created_at)
        .bind(image.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to save image: {}", e)))?;

        Ok(image.clone())
    }

    async fn get(&self, image_id: &str) -> Result<Image> {
        let row = sqlx::query(&format!("SELECT {} FROM images WHERE id = ?", IMAGE_COLUMNS))
            .bind(image_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| TiticacaError::Database(format!("Failed to load image: {}", e)))?
            .ok_or_else(|| TiticacaError::ImageNotFound {
                image_id: image_id.to_string(),
            })?;

        Self::from_row(&row)
    }

    async fn list(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM images ORDER BY created_at ASC",
            IMAGE_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to list images: {}", e)))?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn save(&self, image: &Image) -> Result<Image> {
        let now = Utc::now().timestamp();

        let outcome = sqlx::query(
            "UPDATE images
             SET name = ?, owner = ?, status = ?, size = ?, virtual_size = ?, checksum = ?,
                 disk_format = ?, container_format = ?, locations = ?, extra_properties = ?,
                 importing_stores = ?, failed_stores = ?, completed_stores = ?,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&image.name)
        .bind(&image.owner)
        .bind(image.status.as_str())
        .bind(image.size.map(|s| s as i64))
        .bind(image.virtual_size.map(|s| s as i64))
        .bind(&image.checksum)
        .bind(&image.disk_format)
        .bind(&image.container_format)
        .bind(serde_json::to_string(&image.locations)?)
        .bind(serde_json::to_string(&image.extra_properties)?)
        .bind(serde_json::to_string(&image.importing_stores)?)
        .bind(serde_json::to_string(&image.failed_stores)?)
        .bind(serde_json::to_string(&image.completed_stores)?)
        .bind(now)
        .bind(&image.id)
        .bind(image.version)
        .execute(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to update image: {}", e)))?;

        if outcome.rows_affected() == 0 {
            if self.exists(&image.id).await? {
                return Err(TiticacaError::Conflict(format!(
                    "image {} changed since version {}",
                    image.id, image.version
                )));
            }
            return Err(TiticacaError::ImageNotFound {
                image_id: image.id.clone(),
            });
        }

        let mut saved = image.clone();
        saved.version += 1;
        saved.updated_at = now;
        Ok(saved)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        let outcome = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(image_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| TiticacaError::Database(format!("Failed to delete image: {}", e)))?;

        if outcome.rows_affected() == 0 {
            return Err(TiticacaError::ImageNotFound {
                image_id: image_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageLocation, ImageStatus};

    async fn setup() -> SqlImageRepository {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        SqlImageRepository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_add_and_get_round_trips_sets() {
        let repo = setup().await;
        let mut image = Image::new("owner").with_name("cirros");
        image.importing_stores.insert("fast".into());
        image.locations.push(ImageLocation {
            url: "file:///srv/fast/abc".into(),
            store: "fast".into(),
            metadata: Default::default(),
        });
        image.size = Some(4096);
        repo.add(&image).await.unwrap();

        let loaded = repo.get(&image.id).await.unwrap();
        assert_eq!(loaded, image);
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let repo = setup().await;
        let image = repo.add(&Image::new("owner")).await.unwrap();

        let mut changed = image.clone();
        changed.status = ImageStatus::Importing;
        let saved = repo.save(&changed).await.unwrap();
        assert_eq!(saved.version, image.version + 1);

        let loaded = repo.get(&image.id).await.unwrap();
        assert_eq!(loaded.version, saved.version);
        assert_eq!(loaded.status, ImageStatus::Importing);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repo = setup().await;
        let image = repo.add(&Image::new("owner")).await.unwrap();

        let mut first = image.clone();
        first.completed_stores.insert("a".into());
        repo.save(&first).await.unwrap();

        let mut second = image.clone();
        second.failed_stores.insert("b".into());
        let err = repo.save(&second).await.unwrap_err();
        assert!(err.is_conflict());

        let loaded = repo.get(&image.id).await.unwrap();
        assert!(loaded.completed_stores.contains("a"));
        assert!(loaded.failed_stores.is_empty());
    }

    #[tokio::test]
    async fn test_save_missing_image() {
        let repo = setup().await;
        let err = repo.save(&Image::new("owner")).await.unwrap_err();
        assert!(matches!(err, TiticacaError::ImageNotFound { .. }));
    }
}
