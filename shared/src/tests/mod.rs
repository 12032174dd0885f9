//! Test modules for the shared crate

mod cron_tests;
mod utils_tests;
