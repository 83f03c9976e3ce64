#![forbid(unsafe_code)]

mod manager;
mod meter;
mod monitor;

pub use manager::{
    Backpressure, CacheManager, CacheStats, Discarded, EvictionReport, PageOwner,
};
pub use meter::{BudgetMeter, HeapMeter, Pressure, ResidentBytes, Watermarks};
pub use monitor::HeapMonitor;
