//! Generated protobuf/gRPC stubs (compiled by `build.rs`).

pub mod lockd {
    pub mod v1 {
        tonic::include_proto!("lockd.v1");
    }
}
