//! Persistence collaborators: the routine catalog and the run history log.

pub mod catalog;
pub mod history;

pub use catalog::{FileRoutineCatalog, InMemoryRoutineCatalog, RoutineCatalog, RoutineSummary};
pub use history::{
    FileHistoryLog, HistoryLog, HistoryRecord, InMemoryHistoryLog, ReviewRecord, RunRecord,
    StepRecord,
};
