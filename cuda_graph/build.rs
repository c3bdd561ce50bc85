use std::{env, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/kernels/graph_updater.cu");

    // The updater kernel is only needed by the real driver.
    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let bindings = bindgen_cuda::Builder::default()
        .kernel_paths(vec!["src/kernels/graph_updater.cu"])
        .build_ptx()
        .expect("failed to compile the graph updater kernel");
    bindings
        .write(out_dir.join("kernels.rs"))
        .expect("failed to write kernel bindings");
}
