use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("failed to find workspace root");
    let proto_dir = workspace_root.join("proto");

    let protos = ["prometheus/types.proto", "prometheus/remote.proto"];

    let proto_paths: Vec<PathBuf> = protos.iter().map(|p| proto_dir.join(p)).collect();

    let fds = protox::compile(proto_paths, [&proto_dir])?;

    prost_build::Config::new().compile_fds(fds)?;

    println!("cargo:rerun-if-changed={}", proto_dir.display());
    Ok(())
}
