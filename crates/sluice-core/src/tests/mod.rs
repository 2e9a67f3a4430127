//! Scenario tests over the whole pipeline (in-memory ledger and broker).

mod harness;

mod fan_out;
mod shutdown;
