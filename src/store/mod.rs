pub mod jobs;
pub mod postgres;
pub mod records;
pub mod writer;
