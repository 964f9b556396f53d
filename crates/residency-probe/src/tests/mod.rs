//! Cross-module test suite for the residency probe

mod integration_tests;
