fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/spy/v1/spy.proto"], &["proto"])?;

    Ok(())
}
