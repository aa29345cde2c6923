pub mod directory;
pub mod distance;
pub mod download;
pub mod ping;
pub mod progress;
pub mod report;
pub mod throughput;
pub mod upload;

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestPhase {
    Ping,
    Download,
    Upload,
    Done,
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestPhase::Ping => "ping",
            TestPhase::Download => "download",
            TestPhase::Upload => "upload",
            TestPhase::Done => "done",
        };
        f.write_str(name)
    }
}
