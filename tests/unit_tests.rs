//! Harness for the component tests under `tests/unit`.

mod unit;
