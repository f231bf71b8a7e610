pub mod backup;
pub mod core;
pub mod exchange;
pub mod grades;
pub mod reports;
pub mod roster;
pub mod scheme;
