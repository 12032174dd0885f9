//! Test modules for the dispatcher crate

mod helpers;

mod commands_tests;
mod counter_tests;
mod database_tests;
mod workers_tests;
