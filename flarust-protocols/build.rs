fn main() {
    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(
            &[
                "proto/poppy.proto",
                "proto/brpc.proto",
                "proto/trpc.proto",
                "proto/hbase.proto",
            ],
            &["proto"],
        )
        .expect("failed to compile flarust-protocols wire protos");
}
