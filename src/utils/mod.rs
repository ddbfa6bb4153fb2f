pub mod fs;
pub mod string_ext;

pub use fs::{load_json, load_text, write_json_atomic};
pub use string_ext::{normalize_whitespace, sql_state_hash, truncate_chars};
