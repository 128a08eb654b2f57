pub mod fabric;

extern crate captains_log;
extern crate log;
pub use captains_log::logfn;
use captains_log::*;
use rstest::*;
use std::fmt;
use tokio::runtime::Runtime;

pub type Codec = occams_fabric_codec::MsgpCodec;

pub fn new_rt() -> Runtime {
    let workers: usize = std::thread::available_parallelism().map(|n| n.into()).unwrap_or(1);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(2))
        .enable_all()
        .build()
        .expect("runtime")
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

pub struct TestRunner {
    pub rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/fabric_test.log", Level::Trace).test().build().expect("log");
        Self { rt: new_rt() }
    }

    pub fn block_on<F: Future<Output = ()>>(&self, f: F) {
        self.rt.block_on(f);
    }
}
