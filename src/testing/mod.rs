//! Testing utilities: an in-process loopback cluster for driving full
//! replication cycles, plus recording doubles for the external seams.

mod cluster;
mod replication_tests;

pub use cluster::{
    FailureReport, LoopbackTransport, RecordingFailureReporter, ReportBehavior, TestCluster,
    TestNode, TestWriteHandler, TestWriteRequest, TestWriteResponse,
};
