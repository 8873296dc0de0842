pub mod agent;
pub mod apps;
pub mod utils;
