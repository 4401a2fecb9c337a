//! Build script for the image spec service code generation.
//!
//! Generates Rust client and server code for the `regfacade.v1` package
//! using tonic-build.

fn main() {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }

    let protos = ["proto/specprovider.proto"];

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&protos, &["proto"])
        .expect("Failed to compile protos");

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }
}
