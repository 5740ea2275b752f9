//! Integration tests for Steady-Harvest

mod sync_tests;
