use std::time::Duration;

use chrono::TimeDelta;
use tracing::warn;
use youplace_shared::grid::DEFAULT_CELL_SIZE_MICRODEG;

use crate::authority::ConflictPolicy;
use crate::ledger::BucketConfig;

pub const SERVER_PORT: u16 = 3000;
pub const SSE_KEEPALIVE_SECS: u64 = 15;
pub const PERSIST_BATCH_SIZE: usize = 512;
pub const PERSIST_QUEUE_CAPACITY: usize = 65_536;
pub const PROGRESSION_QUEUE_CAPACITY: usize = 4_096;
pub const PROGRESSION_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_UPSTREAM_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_ROOM_SIZE_CELLS: i32 = 64;
pub const DEFAULT_MAX_ROOMS_PER_CLIENT: u64 = 256;
pub const DEFAULT_MAX_SNAPSHOT_AREA: u64 = 4_194_304;
pub const DEFAULT_MAX_SNAPSHOT_PIXELS: usize = 50_000;
pub const DEFAULT_BUCKET_CAPACITY: u32 = 10;
pub const DEFAULT_BUCKET_REFILL_AMOUNT: u32 = 1;
pub const DEFAULT_BUCKET_REFILL_INTERVAL_MS: i64 = 30_000;
pub const DEFAULT_INITIAL_CREDITS: u64 = 100;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_RATE_STATUS_INTERVAL_SECS: u64 = 5;

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn server_port() -> u16 {
    env_parsed::<u16>("SERVER_PORT")
        .filter(|value| *value > 0)
        .unwrap_or(SERVER_PORT)
}

pub fn database_url() -> Option<String> {
    env_string("DATABASE_URL")
}

pub fn db_max_connections() -> u32 {
    env_parsed::<u32>("DB_MAX_CONNECTIONS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
}

pub fn upstream_http_timeout() -> Duration {
    env_parsed::<u64>("UPSTREAM_HTTP_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_UPSTREAM_HTTP_TIMEOUT_SECS))
}

pub fn upstream_connect_timeout() -> Duration {
    env_parsed::<u64>("UPSTREAM_CONNECT_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS))
}

/// Must divide the 180° latitude span evenly; anything else falls back to the default.
pub fn cell_size_microdeg() -> i64 {
    env_parsed::<i64>("CELL_SIZE_MICRODEG")
        .filter(|value| *value > 0 && 180_000_000 % *value == 0)
        .unwrap_or(DEFAULT_CELL_SIZE_MICRODEG)
}

pub fn room_size_cells() -> i32 {
    env_parsed::<i32>("ROOM_SIZE_CELLS")
        .filter(|value| *value >= 2)
        .unwrap_or(DEFAULT_ROOM_SIZE_CELLS)
}

pub fn max_rooms_per_client() -> u64 {
    env_parsed::<u64>("MAX_ROOMS_PER_CLIENT")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_ROOMS_PER_CLIENT)
}

pub fn max_snapshot_area() -> u64 {
    env_parsed::<u64>("MAX_SNAPSHOT_AREA")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_SNAPSHOT_AREA)
}

pub fn max_snapshot_pixels() -> usize {
    env_parsed::<usize>("MAX_SNAPSHOT_PIXELS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_SNAPSHOT_PIXELS)
}

pub fn bucket_config() -> BucketConfig {
    let capacity = env_parsed::<u32>("BUCKET_CAPACITY")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BUCKET_CAPACITY);
    let refill_amount = env_parsed::<u32>("BUCKET_REFILL_AMOUNT")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BUCKET_REFILL_AMOUNT);
    let refill_interval_ms = env_parsed::<i64>("BUCKET_REFILL_INTERVAL_MS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BUCKET_REFILL_INTERVAL_MS);
    // Zero is a legitimate grant here: new users must claim credits first.
    let initial_credits =
        env_parsed::<u64>("INITIAL_CREDITS").unwrap_or(DEFAULT_INITIAL_CREDITS);

    BucketConfig {
        capacity,
        refill_amount,
        refill_interval: TimeDelta::milliseconds(refill_interval_ms),
        initial_credits,
    }
}

pub fn conflict_policy() -> ConflictPolicy {
    let Some(raw) = env_string("CONFLICT_POLICY") else {
        return ConflictPolicy::default();
    };
    raw.parse().unwrap_or_else(|e| {
        warn!(error = %e, "invalid CONFLICT_POLICY; using arrival order");
        ConflictPolicy::default()
    })
}

pub fn outbound_queue_capacity() -> usize {
    env_parsed::<usize>("OUTBOUND_QUEUE_CAPACITY")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY)
}

pub fn rate_status_interval() -> Duration {
    env_parsed::<u64>("RATE_STATUS_INTERVAL_SECS")
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_RATE_STATUS_INTERVAL_SECS))
}

pub fn progression_url() -> Option<String> {
    env_string("PROGRESSION_URL")
}

pub fn identity_url() -> Option<String> {
    env_string("IDENTITY_URL")
}

pub fn dev_tokens() -> Option<String> {
    env_string("DEV_TOKENS")
}

/// Engine tuning read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub cell_size_microdeg: i64,
    pub room_size_cells: i32,
    pub max_rooms_per_client: u64,
    pub max_snapshot_area: u64,
    pub max_snapshot_pixels: usize,
    pub bucket: BucketConfig,
    pub conflict_policy: ConflictPolicy,
    pub outbound_queue_capacity: usize,
    pub rate_status_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cell_size_microdeg: DEFAULT_CELL_SIZE_MICRODEG,
            room_size_cells: DEFAULT_ROOM_SIZE_CELLS,
            max_rooms_per_client: DEFAULT_MAX_ROOMS_PER_CLIENT,
            max_snapshot_area: DEFAULT_MAX_SNAPSHOT_AREA,
            max_snapshot_pixels: DEFAULT_MAX_SNAPSHOT_PIXELS,
            bucket: BucketConfig {
                capacity: DEFAULT_BUCKET_CAPACITY,
                refill_amount: DEFAULT_BUCKET_REFILL_AMOUNT,
                refill_interval: TimeDelta::milliseconds(DEFAULT_BUCKET_REFILL_INTERVAL_MS),
                initial_credits: DEFAULT_INITIAL_CREDITS,
            },
            conflict_policy: ConflictPolicy::default(),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            rate_status_interval: Duration::from_secs(DEFAULT_RATE_STATUS_INTERVAL_SECS),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            cell_size_microdeg: cell_size_microdeg(),
            room_size_cells: room_size_cells(),
            max_rooms_per_client: max_rooms_per_client(),
            max_snapshot_area: max_snapshot_area(),
            max_snapshot_pixels: max_snapshot_pixels(),
            bucket: bucket_config(),
            conflict_policy: conflict_policy(),
            outbound_queue_capacity: outbound_queue_capacity(),
            rate_status_interval: rate_status_interval(),
        }
    }
}
