pub mod data_dir;
pub mod debug_log;
pub mod env;
pub mod metrics;
pub mod safe_print;
pub mod trace;

pub use trace::Span;
