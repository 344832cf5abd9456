pub mod recovery;
pub mod schedule_ticker;
