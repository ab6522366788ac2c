pub mod history;

pub use history::HistoryRecord;
