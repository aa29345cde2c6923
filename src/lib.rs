//! Speed test engine: finds nearby servers, probes their latency, and measures
//! download and upload throughput against the best one.

pub mod app;
pub mod error;
pub mod settings;
pub mod speedtest;

pub use app::{run_speed_test, TestUpdate};
pub use error::SpeedTestError;
pub use settings::Settings;
pub use speedtest::report::SpeedTestData;
pub use speedtest::TestPhase;
