fn main() {
    // Generate the ONNX protobuf messages from the vendored schema
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["src"])
        .input("src/onnx/protos/onnx.proto")
        .cargo_out_dir("onnx-protos")
        .run_from_script();
}
