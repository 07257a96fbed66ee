//! Library half of `echoupstream`: the generated protobuf types and service
//! implementations, reused by `groxy-core`'s integration tests as a real
//! forwarding target (and by `src/main.rs` to run it as a standalone binary).

pub mod service;

pub mod pb {
    tonic::include_proto!("testing");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("testing_descriptor");
}
