//! Build script generating the Raft peer service stubs.
//!
//! Messages are plain prost structs in `src/proto.rs`, so only the service
//! glue is generated here and no protoc install is needed.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{}", input))
        .output_type(format!("crate::proto::{}", output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("RaftService")
        .package("quorum.raft")
        .method(method(
            "request_vote",
            "RequestVote",
            "RequestVoteRequest",
            "RequestVoteResponse",
        ))
        .method(method(
            "append_entries",
            "AppendEntries",
            "AppendEntriesRequest",
            "AppendEntriesResponse",
        ))
        .method(method(
            "install_snapshot",
            "InstallSnapshot",
            "InstallSnapshotRequest",
            "InstallSnapshotResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
