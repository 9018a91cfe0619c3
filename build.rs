use std::env;

pub fn main() {
    generate_version_info();

    println!("cargo:rerun-if-changed=migrations");

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("musl") {
        #[cfg(not(feature = "bundled-postgres"))]
        println!("cargo:warning=musl target without bundled-postgres, use --features bundled-postgres");
    }
}

/// Emit `VERGEN_GIT_DESCRIBE`, `VERGEN_GIT_SHA`, `VERGEN_BUILD_TIMESTAMP` and
/// `VERGEN_CARGO_TARGET_TRIPLE` for the `status` command and the Sentry release.
/// Outside a git checkout vergen falls back to placeholder values.
fn generate_version_info() {
    use vergen_git2::{BuildBuilder, CargoBuilder, Emitter, Git2Builder};

    let build = BuildBuilder::default()
        .build_timestamp(true)
        .build()
        .expect("Failed to configure build info");

    let cargo = CargoBuilder::default()
        .target_triple(true)
        .build()
        .expect("Failed to configure cargo info");

    let git2 = Git2Builder::default()
        .describe(true, true, None)
        .sha(true)
        .build()
        .expect("Failed to configure git info");

    Emitter::default()
        .add_instructions(&build)
        .expect("Failed to add build instructions")
        .add_instructions(&cargo)
        .expect("Failed to add cargo instructions")
        .add_instructions(&git2)
        .expect("Failed to add git instructions")
        .emit()
        .expect("Failed to emit version info");
}
