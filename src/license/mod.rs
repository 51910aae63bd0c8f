pub mod backfill;
pub mod pool;
