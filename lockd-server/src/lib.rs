pub mod config;
pub mod grpc;
pub mod peer_client;
pub mod proto;
