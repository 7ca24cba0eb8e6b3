//! Build script for the dynffi test fixtures
//!
//! Compiles the C sources under test/native/ into shared libraries with the
//! host C compiler, so tests have real native images to load. A missing or
//! failing compiler is not fatal: tests that need a fixture skip themselves.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const FIXTURES: &[&str] = &["sum", "mul"];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let fixture_dir = out_dir.join("fixtures");
    let target = env::var("TARGET").unwrap_or_default();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=test/native/");
    println!("cargo:rustc-env=DYNFFI_FIXTURE_DIR={}", fixture_dir.display());

    fs::create_dir_all(&fixture_dir).expect("Failed to create fixture directory");

    for name in FIXTURES {
        let source = Path::new("test/native").join(format!("{}.c", name));
        let output = fixture_dir.join(shared_library_name(name, &target));
        if let Err(e) = compile_shared(&source, &output) {
            println!("cargo:warning=Skipping fixture {}: {}", name, e);
        }
    }
}

/// Platform file name for a shared library
fn shared_library_name(name: &str, target: &str) -> String {
    if target.contains("windows") {
        format!("{}.dll", name)
    } else if target.contains("apple") {
        format!("lib{}.dylib", name)
    } else {
        format!("lib{}.so", name)
    }
}

/// Compile one C source into a shared library
fn compile_shared(source: &Path, output: &Path) -> Result<(), String> {
    let tool = cc::Build::new()
        .cargo_metadata(false)
        .try_get_compiler()
        .map_err(|e| e.to_string())?;
    let mut cmd = tool.to_command();

    if tool.is_like_msvc() {
        cmd.arg("/nologo")
            .arg("/LD")
            .arg("/O2")
            .arg(source)
            .arg(format!("/Fe:{}", output.display()))
            .arg(format!("/Fo:{}\\", output.parent().unwrap_or(Path::new(".")).display()));
    } else {
        cmd.args(["-shared", "-fPIC", "-O2", "-o"]).arg(output).arg(source);
    }

    match cmd.status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("compiler exited with {}", status)),
        Err(e) => Err(format!("failed to run compiler: {}", e)),
    }
}
