fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=protos");

    // protox resolves the google.protobuf well-known types itself, so no
    // system protoc installation is required.
    let file_descriptors = protox::compile(
        [
            "protos/build/bazel/remote/execution/v2/remote_execution.proto",
            "protos/build/bazel/semver/semver.proto",
            "protos/google/bytestream/bytestream.proto",
            "protos/google/longrunning/operations.proto",
            "protos/google/rpc/status.proto",
        ],
        ["protos"],
    )?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(file_descriptors)?;

    Ok(())
}
