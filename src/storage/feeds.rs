use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, Feed, ParsedArticle};

/// Rows per multi-row INSERT; 5 columns * 50 stays well under SQLite's
/// 999 bound-parameter limit.
const BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Add a feed, or update its title if the URL is already known.
    ///
    /// Returns the feed's id. Without a title the URL is used until a
    /// refresh supplies one.
    pub async fn insert_feed(&self, url: &str, title: Option<&str>) -> Result<i64, DatabaseError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url) VALUES (?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = CASE WHEN ? IS NULL THEN feeds.title ELSE excluded.title END
            RETURNING id
        "#,
        )
        .bind(title.unwrap_or(url))
        .bind(url)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// All feeds ordered by title
    pub async fn get_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<(i64, String, String, Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT id, title, url, last_fetched, error FROM feeds ORDER BY title, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, title, url, last_fetched, error)| Feed {
                id,
                title,
                url,
                last_fetched,
                error,
            })
            .collect())
    }

    /// Set or clear the error status for a feed
    pub async fn set_feed_error(&self, feed_id: i64, error: Option<&str>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Complete a feed refresh atomically: clear error, store new entries,
    /// update the title and timestamp.
    ///
    /// New entries start `pending`. Entries already stored keep their link
    /// and resolution state; only their title and publish date are refreshed.
    ///
    /// # Returns
    ///
    /// The number of newly inserted articles (not updated).
    pub async fn complete_feed_refresh(
        &self,
        feed_id: i64,
        feed_title: Option<&str>,
        articles: &[ParsedArticle],
    ) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE feeds SET error = NULL, last_fetched = ?, title = COALESCE(?, title) WHERE id = ?",
        )
        .bind(now)
        .bind(feed_title)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        let mut total_inserted: usize = 0;

        for chunk in articles.chunks(BATCH_SIZE) {
            // Phase 1: insert new entries only; changes() counts them
            let mut insert_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles (feed_id, guid, title, link, published, fetched_at) ",
            );

            insert_builder.push_values(chunk, |mut b, article| {
                b.push_bind(feed_id)
                    .push_bind(&article.guid)
                    .push_bind(&article.title)
                    .push_bind(&article.link)
                    .push_bind(article.published)
                    .push_bind(now);
            });

            insert_builder.build().execute(&mut *tx).await?;

            let changes: (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            total_inserted += usize::try_from(changes.0).unwrap_or(0);

            // Phase 2: refresh metadata of entries seen before
            let mut update_builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE articles SET title = CASE guid ");
            for article in chunk {
                update_builder.push("WHEN ");
                update_builder.push_bind(&article.guid);
                update_builder.push(" THEN ");
                update_builder.push_bind(&article.title);
                update_builder.push(" ");
            }
            update_builder.push("ELSE title END, published = CASE guid ");
            for article in chunk {
                update_builder.push("WHEN ");
                update_builder.push_bind(&article.guid);
                update_builder.push(" THEN ");
                update_builder.push_bind(article.published);
                update_builder.push(" ");
            }
            update_builder.push("ELSE published END WHERE feed_id = ");
            update_builder.push_bind(feed_id);
            update_builder.push(" AND guid IN (");

            let mut separated = update_builder.separated(", ");
            for article in chunk {
                separated.push_bind(&article.guid);
            }
            separated.push_unseparated(")");

            update_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(total_inserted)
    }
}
