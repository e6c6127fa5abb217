use std::env;
use std::fs;
use std::path::PathBuf;

/// Collects `beacon-backend-*` artifacts into a generated table so the bridge can
/// ship them inside its own binary (`EmbeddedBundle::builtin()`).
fn main() {
    println!("cargo:rerun-if-env-changed=BEACON_BACKEND_DIR");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let backend_dir = env::var("BEACON_BACKEND_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(&manifest_dir).join("backend"));
    println!("cargo:rerun-if-changed={}", backend_dir.display());

    let mut entries = Vec::new();
    if let Ok(dir) = fs::read_dir(&backend_dir) {
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || !name.starts_with("beacon-backend-") {
                continue;
            }
            entries.push((name.to_string(), path.clone()));
        }
    } else {
        // 번들 디렉터리가 없으면 빈 테이블 생성 (개발 빌드)
        println!(
            "cargo:warning=No backend directory at {}, embedded bundle will be empty",
            backend_dir.display()
        );
    }
    entries.sort();

    let mut out = String::from("pub static BACKENDS: &[(&str, &[u8])] = &[\n");
    for (name, path) in &entries {
        out.push_str(&format!(
            "    ({:?}, include_bytes!({:?})),\n",
            format!("backend/{}", name),
            path.display().to_string()
        ));
    }
    out.push_str("];\n");

    let out_dir = env::var("OUT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    if let Err(e) = fs::write(out_dir.join("embedded_backends.rs"), out) {
        panic!("Failed to write embedded backend table: {}", e);
    }
}
