use std::io::Result;

fn main() -> Result<()> {
    let file_descriptor_set = protox::compile(
        ["proto/license_protocol.proto", "proto/storage.proto"],
        ["proto/"],
    )
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    prost_build::Config::new().compile_fds(file_descriptor_set)?;
    Ok(())
}
