pub mod app;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics_consts;
pub mod processor;
pub mod shutdown;
pub mod signals;
pub mod telemetry;

pub use app::App;
pub use consumer::{Consumer, DispatchMode, DispatchOptions};
pub use processor::{InstrumentingProcessor, Processor};
