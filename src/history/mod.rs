pub mod report;
pub mod training;
