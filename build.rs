fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // used by the sample client and the gateway tests
        .compile_protos(&["proto/codexec.proto"], &["proto/"])?;
    Ok(())
}
