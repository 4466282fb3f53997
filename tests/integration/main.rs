//! Integration tests for tick-ingest

mod config_test;
mod pipeline_test;
mod stream_test;
mod support;
