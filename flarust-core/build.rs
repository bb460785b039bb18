fn main() {
    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(&["proto/rpc_meta.proto"], &["proto"])
        .expect("failed to compile flarust-core protos");
}
