//! Batch backtesting on top of [`TaskManager`](crate::manager::TaskManager).

pub mod runner;

pub use runner::{BacktestFn, BacktestResult, BacktestRunner, BacktestStatus, ResultCallback};
