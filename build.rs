fn main() {
    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    println!("cargo:rerun-if-changed=src/ffi.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    // A checked-in cbindgen.toml wins; otherwise emit a plain C header.
    let config = cbindgen::Config::from_file(format!("{}/cbindgen.toml", crate_dir))
        .unwrap_or_else(|_| cbindgen::Config {
            language: cbindgen::Language::C,
            include_guard: Some("AREATRACK_H".into()),
            cpp_compat: true,
            ..Default::default()
        });

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(format!("{}/include/areatrack.h", crate_dir));
        }
        Err(e) => println!("cargo:warning=header generation skipped: {}", e),
    }
}
