//! The slice of sqlx the pixel store needs, re-exported so `sqlx::` paths
//! resolve without pulling in the macros crate.

pub mod postgres {
    pub use sqlx_postgres::PgPoolOptions;
}

pub use sqlx_core::query::query;
pub use sqlx_core::query_as::query_as;
pub use sqlx_core::query_builder::QueryBuilder;
pub use sqlx_postgres::{PgPool, Postgres};
