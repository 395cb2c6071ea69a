pub mod assertions;

pub use assertions::{count_kind, created_ids, deleted_ids, init_logging};
pub use harness::{connect, engine, engine_with, sync, Connection};
