//! SQLite implementation of [`AuthService`].
//!
//! Migrations under `./migrations` are embedded at compile time and run on
//! [`SqliteAuthStore::connect`]. Queries use the runtime-checked
//! `sqlx::query` form so no `DATABASE_URL` is needed to build.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use super::{generate_api_key, AuthError, AuthService, KeySeed, ModelDescriptor};

#[derive(Clone, Debug)]
pub struct SqliteAuthStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct ModelRow {
    id: String,
    created: i64,
    owned_by: String,
    permission: String,
    root: Option<String>,
    parent: Option<String>,
    description: String,
    strengths: String,
    price_prompt: f64,
    price_completion: f64,
    is_public: bool,
}

impl TryFrom<ModelRow> for ModelDescriptor {
    type Error = AuthError;

    fn try_from(row: ModelRow) -> Result<Self, AuthError> {
        let permission = serde_json::from_str(&row.permission)
            .map_err(|e| AuthError::Corrupt(format!("permission of {}: {e}", row.id)))?;
        Ok(ModelDescriptor {
            created: u64::try_from(row.created).unwrap_or(0),
            id: row.id,
            owned_by: row.owned_by,
            permission,
            root: row.root,
            parent: row.parent,
            description: row.description,
            strengths: row.strengths,
            price_prompt: row.price_prompt,
            price_completion: row.price_completion,
            is_public: row.is_public,
        })
    }
}

impl SqliteAuthStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `"sqlite://gateway.db"` or
    /// `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, AuthError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // An in-memory database lives and dies with its single connection.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert_model(&self, model: &ModelDescriptor) -> Result<(), AuthError> {
        let created = i64::try_from(model.created).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO models (id, created, owned_by, permission, root, parent, description, \
             strengths, price_prompt, price_completion, is_public) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET created = excluded.created, owned_by = excluded.owned_by, \
             permission = excluded.permission, root = excluded.root, parent = excluded.parent, \
             description = excluded.description, strengths = excluded.strengths, \
             price_prompt = excluded.price_prompt, price_completion = excluded.price_completion, \
             is_public = excluded.is_public",
        )
        .bind(&model.id)
        .bind(created)
        .bind(&model.owned_by)
        .bind(model.permission.to_string())
        .bind(&model.root)
        .bind(&model.parent)
        .bind(&model.description)
        .bind(&model.strengths)
        .bind(model.price_prompt)
        .bind(model.price_completion)
        .bind(model.is_public)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_key(&self, key: &str, active: bool) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO api_keys (key_value, is_active) VALUES (?1, ?2) \
             ON CONFLICT(key_value) DO UPDATE SET is_active = excluded.is_active",
        )
        .bind(key)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant(&self, key: &str, model_id: &str) -> Result<(), AuthError> {
        let known: Option<String> = sqlx::query_scalar("SELECT id FROM models WHERE id = ?1")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(AuthError::UnknownModel(model_id.to_string()));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO api_key_model_access (api_key_id, model_id) \
             SELECT id, ?2 FROM api_keys WHERE key_value = ?1",
        )
        .bind(key)
        .bind(model_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate(&self, key: &str) -> Result<bool, AuthError> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE key_value = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AuthService for SqliteAuthStore {
    async fn validate(&self, key: &str) -> Result<bool, AuthError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM api_keys WHERE key_value = ?1 AND is_active = 1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn allowed_models(&self, key: Option<&str>) -> Result<Vec<ModelDescriptor>, AuthError> {
        let rows: Vec<ModelRow> = sqlx::query_as(
            "SELECT DISTINCT m.id, m.created, m.owned_by, m.permission, m.root, m.parent, \
             m.description, m.strengths, m.price_prompt, m.price_completion, m.is_public \
             FROM models m \
             LEFT JOIN api_key_model_access akma ON m.id = akma.model_id \
             LEFT JOIN api_keys ak ON akma.api_key_id = ak.id \
             WHERE m.is_public = 1 OR ak.key_value = ?1 \
             ORDER BY m.id",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ModelDescriptor::try_from).collect()
    }

    async fn issue_key(&self) -> Result<String, AuthError> {
        let key = generate_api_key();
        sqlx::query("INSERT INTO api_keys (key_value) VALUES (?1)")
            .bind(&key)
            .execute(&self.pool)
            .await?;
        Ok(key)
    }

    async fn seed(&self, models: &[ModelDescriptor], keys: &[KeySeed]) -> Result<(), AuthError> {
        for model in models {
            self.upsert_model(model).await?;
        }
        for seed in keys {
            self.upsert_key(&seed.key, seed.active).await?;
            for model_id in &seed.models {
                self.grant(&seed.key, model_id).await?;
            }
        }
        info!(models = models.len(), keys = keys.len(), "Seeded SQLite credential store");
        Ok(())
    }
}
