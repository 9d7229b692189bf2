fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/gnmi.proto");
    println!("cargo:rerun-if-changed=proto/gnmi_ext.proto");

    // Client toward targets, server toward downstream consumers
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(
            &["proto/gnmi_ext.proto", "proto/gnmi.proto"],
            &["proto/", "/usr/include"],
        )?;
    Ok(())
}
