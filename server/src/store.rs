use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::RwLock;
use youplace_shared::{Cell, HexColor, Pixel};

pub const MAX_HISTORY_LIMIT: usize = 50;

/// Durable side of the canvas. Writes arrive in batches from the persister service.
pub trait PixelStore: Send + Sync + 'static {
    /// Upsert the live rows and append every pixel to the history log.
    fn persist<'a>(&'a self, pixels: &'a [Pixel]) -> BoxFuture<'a, Result<u64, String>>;

    fn load_live(&self) -> BoxFuture<'_, Result<Vec<Pixel>, String>>;

    /// Most recent paints of a cell, newest first.
    fn history(&self, cell: Cell, limit: usize) -> BoxFuture<'_, Result<Vec<Pixel>, String>>;

    fn painted_counts(&self) -> BoxFuture<'_, Result<Vec<(String, u64)>, String>>;
}

#[derive(Default)]
struct MemoryTables {
    live: HashMap<Cell, Pixel>,
    history: HashMap<Cell, Vec<Pixel>>,
    counts: HashMap<String, u64>,
}

/// Process-local store used when no `DATABASE_URL` is configured.
#[derive(Default)]
pub struct MemoryPixelStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryPixelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PixelStore for MemoryPixelStore {
    fn persist<'a>(&'a self, pixels: &'a [Pixel]) -> BoxFuture<'a, Result<u64, String>> {
        Box::pin(async move {
            let mut guard = self.tables.write().await;
            let tables = &mut *guard;
            let mut written = 0;
            for pixel in pixels {
                let history = tables.history.entry(pixel.cell).or_default();
                if history.iter().any(|existing| existing.seq == pixel.seq) {
                    continue;
                }
                history.push(pixel.clone());
                *tables.counts.entry(pixel.painted_by.clone()).or_default() += 1;

                let newer = tables
                    .live
                    .get(&pixel.cell)
                    .is_none_or(|current| pixel.supersedes(current));
                if newer {
                    tables.live.insert(pixel.cell, pixel.clone());
                }
                written += 1;
            }
            Ok(written)
        })
    }

    fn load_live(&self) -> BoxFuture<'_, Result<Vec<Pixel>, String>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            let mut pixels: Vec<Pixel> = tables.live.values().cloned().collect();
            pixels.sort_by_key(|pixel| pixel.seq);
            Ok(pixels)
        })
    }

    fn history(&self, cell: Cell, limit: usize) -> BoxFuture<'_, Result<Vec<Pixel>, String>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            let mut history = tables.history.get(&cell).cloned().unwrap_or_default();
            history.sort_by(|a, b| b.seq.cmp(&a.seq));
            history.truncate(limit.min(MAX_HISTORY_LIMIT));
            Ok(history)
        })
    }

    fn painted_counts(&self) -> BoxFuture<'_, Result<Vec<(String, u64)>, String>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            Ok(tables
                .counts
                .iter()
                .map(|(user, count)| (user.clone(), *count))
                .collect())
        })
    }
}

type PixelRow = (i32, i32, String, String, Option<String>, DateTime<Utc>, i64);

fn pixel_from_row(row: PixelRow) -> Result<Pixel, String> {
    let (x, y, color, painted_by, painter_name, painted_at, seq) = row;
    let cell = Cell::new(x, y);
    let color = HexColor::parse(&color).map_err(|e| format!("stored color at {cell}: {e}"))?;
    let seq = u64::try_from(seq).map_err(|_| format!("stored sequence {seq} is negative"))?;
    Ok(Pixel {
        id: cell.id(),
        cell,
        color,
        painted_by,
        painter_name,
        painted_at,
        seq,
    })
}

/// Postgres-backed store over the `pixels` and `pixel_history` tables.
#[derive(Clone)]
pub struct PgPixelStore {
    pool: PgPool,
}

impl PgPixelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PixelStore for PgPixelStore {
    fn persist<'a>(&'a self, pixels: &'a [Pixel]) -> BoxFuture<'a, Result<u64, String>> {
        Box::pin(async move {
            if pixels.is_empty() {
                return Ok(0);
            }

            struct PixelInsertRow<'p> {
                x: i32,
                y: i32,
                color: &'p str,
                painted_by: &'p str,
                painter_name: Option<&'p str>,
                painted_at: DateTime<Utc>,
                seq: i64,
            }

            let mut rows = Vec::with_capacity(pixels.len());
            for pixel in pixels {
                let seq = i64::try_from(pixel.seq)
                    .map_err(|_| format!("sequence {} is out of i64 range", pixel.seq))?;
                rows.push(PixelInsertRow {
                    x: pixel.cell.x,
                    y: pixel.cell.y,
                    color: pixel.color.as_str(),
                    painted_by: &pixel.painted_by,
                    painter_name: pixel.painter_name.as_deref(),
                    painted_at: pixel.painted_at,
                    seq,
                });
            }

            // ON CONFLICT DO UPDATE cannot touch a row twice in one statement.
            let mut newest: HashMap<(i32, i32), usize> = HashMap::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                newest
                    .entry((row.x, row.y))
                    .and_modify(|current| {
                        if rows[*current].seq < row.seq {
                            *current = index;
                        }
                    })
                    .or_insert(index);
            }
            let mut live_indexes: Vec<usize> = newest.into_values().collect();
            live_indexes.sort_unstable();

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| format!("begin transaction: {e}"))?;

            let mut history_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO pixel_history \
                 (seq, x, y, color, painted_by, painter_name, painted_at) ",
            );
            history_builder.push_values(rows.iter(), |mut builder, row| {
                builder
                    .push_bind(row.seq)
                    .push_bind(row.x)
                    .push_bind(row.y)
                    .push_bind(row.color)
                    .push_bind(row.painted_by)
                    .push_bind(row.painter_name)
                    .push_bind(row.painted_at);
            });
            history_builder.push(" ON CONFLICT (seq) DO NOTHING");
            let inserted = history_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| format!("insert pixel history: {e}"))?
                .rows_affected();

            let mut live_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO pixels \
                 (x, y, color, painted_by, painter_name, painted_at, seq) ",
            );
            live_builder.push_values(live_indexes.iter().map(|index| &rows[*index]), |mut builder, row| {
                builder
                    .push_bind(row.x)
                    .push_bind(row.y)
                    .push_bind(row.color)
                    .push_bind(row.painted_by)
                    .push_bind(row.painter_name)
                    .push_bind(row.painted_at)
                    .push_bind(row.seq);
            });
            live_builder.push(
                " ON CONFLICT (x, y) DO UPDATE SET \
                 color = EXCLUDED.color, \
                 painted_by = EXCLUDED.painted_by, \
                 painter_name = EXCLUDED.painter_name, \
                 painted_at = EXCLUDED.painted_at, \
                 seq = EXCLUDED.seq \
                 WHERE pixels.seq < EXCLUDED.seq",
            );
            live_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| format!("upsert live pixels: {e}"))?;

            tx.commit()
                .await
                .map_err(|e| format!("commit transaction: {e}"))?;
            Ok(inserted)
        })
    }

    fn load_live(&self) -> BoxFuture<'_, Result<Vec<Pixel>, String>> {
        Box::pin(async move {
            let rows: Vec<PixelRow> = sqlx::query_as(
                "SELECT x, y, color, painted_by, painter_name, painted_at, seq \
                 FROM pixels ORDER BY seq",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("load live pixels: {e}"))?;
            rows.into_iter().map(pixel_from_row).collect()
        })
    }

    fn history(&self, cell: Cell, limit: usize) -> BoxFuture<'_, Result<Vec<Pixel>, String>> {
        Box::pin(async move {
            let limit = limit.min(MAX_HISTORY_LIMIT) as i64;
            let rows: Vec<PixelRow> = sqlx::query_as(
                "SELECT x, y, color, painted_by, painter_name, painted_at, seq \
                 FROM pixel_history WHERE x = $1 AND y = $2 \
                 ORDER BY seq DESC LIMIT $3",
            )
            .bind(cell.x)
            .bind(cell.y)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("load pixel history: {e}"))?;
            rows.into_iter().map(pixel_from_row).collect()
        })
    }

    fn painted_counts(&self) -> BoxFuture<'_, Result<Vec<(String, u64)>, String>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT painted_by, COUNT(*) FROM pixel_history GROUP BY painted_by",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("load painted counts: {e}"))?;
            Ok(rows
                .into_iter()
                .map(|(user, count)| (user, u64::try_from(count).unwrap_or_default()))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use youplace_shared::{Cell, HexColor, Pixel};

    use super::{MemoryPixelStore, PgPixelStore, PixelStore};
    use crate::postgres::PgPoolOptions;

    fn pixel(x: i32, y: i32, color: &str, user: &str, seq: u64) -> Pixel {
        Pixel {
            id: format!("{x}_{y}"),
            cell: Cell::new(x, y),
            color: HexColor::parse(color).expect("valid color"),
            painted_by: user.to_owned(),
            painter_name: Some(format!("{user}-name")),
            painted_at: Utc
                .timestamp_opt(1_700_000_000 + seq as i64, 0)
                .single()
                .expect("valid timestamp"),
            seq,
        }
    }

    #[tokio::test]
    async fn memory_store_keeps_newest_live_pixel_and_full_history() {
        let store = MemoryPixelStore::new();
        let written = store
            .persist(&[
                pixel(1, 1, "#111111", "alice", 2),
                pixel(1, 1, "#222222", "bob", 1),
                pixel(2, 2, "#333333", "alice", 3),
            ])
            .await
            .expect("persist");
        assert_eq!(written, 3);
        assert_eq!(
            store.persist(&[pixel(2, 2, "#333333", "alice", 3)]).await,
            Ok(0)
        );

        let live = store.load_live().await.expect("load");
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].color.as_str(), "#111111");
        assert_eq!(live[1].seq, 3);

        let history = store.history(Cell::new(1, 1), 5).await.expect("history");
        assert_eq!(
            history.iter().map(|p| p.seq).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(store.history(Cell::new(1, 1), 1).await.expect("history").len(), 1);

        let mut counts = store.painted_counts().await.expect("counts");
        counts.sort();
        assert_eq!(counts, vec![("alice".to_owned(), 2), ("bob".to_owned(), 1)]);
    }

    #[tokio::test]
    async fn pg_store_round_trips_pixels_with_real_postgres() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            eprintln!("Skipping real-Postgres store test: DATABASE_URL is not set");
            return;
        };

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await
            .expect("connect real postgres");
        let mut lock_conn = pool.acquire().await.expect("acquire lock connection");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(51_020_001_i64)
            .execute(&mut *lock_conn)
            .await
            .expect("acquire store test db lock");
        crate::db_migrations::run(&pool)
            .await
            .expect("run migrations");
        sqlx::query("TRUNCATE TABLE pixels, pixel_history")
            .execute(&pool)
            .await
            .expect("truncate pixel tables");

        let store = PgPixelStore::new(pool.clone());
        let written = store
            .persist(&[
                pixel(4, 4, "#AA0000", "alice", 10),
                pixel(4, 4, "#00AA00", "bob", 11),
                pixel(5, 4, "#0000AA", "alice", 12),
            ])
            .await
            .expect("persist");
        assert_eq!(written, 3);
        // An older write arriving late never replaces the live row.
        store
            .persist(&[pixel(4, 4, "#FFFFFF", "carol", 9)])
            .await
            .expect("persist late write");

        let live = store.load_live().await.expect("load live");
        assert_eq!(live.len(), 2);
        let cell = live
            .iter()
            .find(|p| p.cell == Cell::new(4, 4))
            .expect("cell 4,4");
        assert_eq!(cell.color.as_str(), "#00AA00");
        assert_eq!(cell.seq, 11);

        let history = store.history(Cell::new(4, 4), 10).await.expect("history");
        assert_eq!(
            history.iter().map(|p| p.seq).collect::<Vec<_>>(),
            vec![11, 10, 9]
        );

        let mut counts = store.painted_counts().await.expect("counts");
        counts.sort();
        assert_eq!(
            counts,
            vec![
                ("alice".to_owned(), 2),
                ("bob".to_owned(), 1),
                ("carol".to_owned(), 1)
            ]
        );

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(51_020_001_i64)
            .execute(&mut *lock_conn)
            .await
            .expect("release store test db lock");
    }
}
