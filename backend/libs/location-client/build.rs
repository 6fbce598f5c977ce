#![allow(clippy::panic)]

fn main() {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/location.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("Failed to compile location.proto: {}", e));

    println!("cargo:rerun-if-changed=proto/location.proto");
}
