use crate::error::{Result, SandboxError};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};

pub const QUERY_ROWS_MAX: usize = 500;

/// The site database. Only the options table is ever written to, and only
/// through the typed helpers below; free-form queries run on a read-only
/// connection after passing [`ensure_select`].
#[derive(Debug, Clone)]
pub struct SiteDb {
    path: PathBuf,
    table_prefix: String,
}

/// Refuses anything that does not start with `SELECT` once leading
/// whitespace is trimmed, without opening a connection.
pub fn ensure_select(query: &str) -> Result<()> {
    let trimmed = query.trim_start();
    let head: String = trimmed.chars().take(6).collect();
    if !head.eq_ignore_ascii_case("select") {
        return Err(SandboxError::validation(
            "only SELECT statements are allowed".to_string(),
        ));
    }
    Ok(())
}

impl SiteDb {
    pub fn new(path: impl AsRef<Path>, table_prefix: &str) -> Result<Self> {
        if !table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SandboxError::validation(format!(
                "invalid table prefix {table_prefix:?}"
            )));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            table_prefix: table_prefix.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn options_table(&self) -> String {
        format!("{}options", self.table_prefix)
    }

    fn open_read_only(path: &Path) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    fn open_read_write(path: &Path) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    pub async fn option(&self, name: &str) -> Result<Option<String>> {
        let path = self.path.clone();
        let sql = format!(
            "SELECT option_value FROM {} WHERE option_name = ?1",
            self.options_table()
        );
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = Self::open_read_only(&path)?;
            let value = conn
                .query_row(&sql, params![name], |row| row.get::<_, String>(0))
                .optional()?;
            Ok(value)
        })
        .await?
    }

    pub async fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let path = self.path.clone();
        let table = self.options_table();
        let name = name.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_read_write(&path)?;
            let updated = conn.execute(
                &format!("UPDATE {table} SET option_value = ?2 WHERE option_name = ?1"),
                params![name, value],
            )?;
            if updated == 0 {
                conn.execute(
                    &format!("INSERT INTO {table} (option_name, option_value) VALUES (?1, ?2)"),
                    params![name, value],
                )?;
            }
            Ok(())
        })
        .await?
    }

    /// Plugin paths listed in the `active_plugins` option (a JSON array).
    pub async fn active_plugins(&self) -> Result<Vec<String>> {
        let Some(raw) = self.option("active_plugins").await? else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::execution(format!("active_plugins option is not a JSON array: {e}"))
        })
    }

    pub async fn set_active_plugins(&self, plugins: &[String]) -> Result<()> {
        let raw = serde_json::to_string(plugins)
            .map_err(|e| SandboxError::execution(format!("encode active_plugins: {e}")))?;
        self.set_option("active_plugins", &raw).await
    }

    pub async fn active_theme(&self) -> Result<Option<String>> {
        self.option("stylesheet").await
    }

    pub async fn set_active_theme(&self, slug: &str) -> Result<()> {
        self.set_option("stylesheet", slug).await?;
        self.set_option("template", slug).await
    }

    pub async fn tables(&self) -> Result<Vec<String>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = Self::open_read_only(&path)?;
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await?
    }

    /// Runs a SELECT and returns rows as JSON objects keyed by column name.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn select(&self, query: &str) -> Result<Vec<serde_json::Value>> {
        ensure_select(query)?;
        let path = self.path.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<serde_json::Value>> {
            let conn = Self::open_read_only(&path)?;
            let mut stmt = conn
                .prepare(&query)
                .map_err(|e| SandboxError::validation(format!("query rejected: {e}")))?;
            if !stmt.readonly() {
                return Err(SandboxError::validation(
                    "query would modify the database".to_string(),
                ));
            }
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::new();
                for (idx, column) in columns.iter().enumerate() {
                    obj.insert(column.clone(), value_to_json(row.get_ref(idx)?));
                }
                out.push(serde_json::Value::Object(obj));
                if out.len() >= QUERY_ROWS_MAX {
                    tracing::debug!(rows_max = QUERY_ROWS_MAX, "query result truncated");
                    break;
                }
            }
            Ok(out)
        })
        .await?
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn seed_site_db(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE wp_options (
    option_id INTEGER PRIMARY KEY AUTOINCREMENT,
    option_name TEXT NOT NULL UNIQUE,
    option_value TEXT NOT NULL,
    autoload TEXT NOT NULL DEFAULT 'yes'
);
CREATE TABLE wp_users (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    user_login TEXT NOT NULL,
    user_email TEXT NOT NULL
);
INSERT INTO wp_options (option_name, option_value) VALUES ('active_plugins', '[]');
INSERT INTO wp_options (option_name, option_value) VALUES ('stylesheet', 'twentytwentyfour');
INSERT INTO wp_options (option_name, option_value) VALUES ('template', 'twentytwentyfour');
INSERT INTO wp_users (user_login, user_email) VALUES ('admin', 'admin@example.com');
"#,
        )
        .unwrap();
    }

    #[test]
    fn select_gate_is_prefix_based_and_case_insensitive() {
        assert!(ensure_select("  select * from wp_users").is_ok());
        assert!(ensure_select("\n\tSELECT 1").is_ok());
        assert!(ensure_select("DROP TABLE users").is_err());
        assert!(ensure_select("WITH x AS (SELECT 1) SELECT * FROM x").is_err());
        assert!(ensure_select("sel").is_err());
        assert!(ensure_select("").is_err());
    }

    #[tokio::test]
    async fn select_returns_rows_as_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.db");
        seed_site_db(&path);
        let db = SiteDb::new(&path, "wp_").unwrap();

        let rows = db
            .select("  select user_login, ID from wp_users")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_login"], "admin");
        assert_eq!(rows[0]["ID"], 1);
    }

    #[tokio::test]
    async fn drop_is_rejected_before_touching_the_database() {
        let db = SiteDb::new("/nonexistent/site.db", "wp_").unwrap();
        let err = db.select("DROP TABLE wp_users").await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn tables_and_options_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.db");
        seed_site_db(&path);
        let db = SiteDb::new(&path, "wp_").unwrap();

        assert_eq!(db.tables().await.unwrap(), vec!["wp_options", "wp_users"]);
        db.set_active_plugins(&["akismet/akismet.php".to_string()])
            .await
            .unwrap();
        assert_eq!(
            db.active_plugins().await.unwrap(),
            vec!["akismet/akismet.php".to_string()]
        );
        db.set_option("blogname", "Demo").await.unwrap();
        assert_eq!(db.option("blogname").await.unwrap().as_deref(), Some("Demo"));
    }

    #[test]
    fn table_prefix_must_be_identifier_safe() {
        assert!(SiteDb::new("x.db", "wp_; DROP").is_err());
    }
}
