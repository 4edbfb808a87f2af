mod cache_tests;
mod common;
mod job_tests;
