use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["src/rpc/wattson_rpc.proto"], &["src"])?;
    Ok(())
}
