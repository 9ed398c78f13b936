fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when the system doesn't provide one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the protocol buffer definitions
    tonic_build::compile_protos("proto/warp.proto")?;

    println!("cargo:rerun-if-changed=proto/warp.proto");

    Ok(())
}
