//! Stamps the plugin binaries with a release version and the git commit they were built from.

use vergen_git2::Emitter;
use vergen_git2::Git2Builder;

/// Release version, set by the image build.
const RELEASE_VERSION_ENV: &str = "MACVTAP_VERSION";

fn main() {
    // outside a git checkout the version reports an unknown commit
    if let Err(err) = emit_commit() {
        println!("cargo:warning=git metadata unavailable: {err}");
    }

    let release = std::env::var(RELEASE_VERSION_ENV).unwrap_or_else(|_| "latest".to_string());
    println!("cargo:rustc-env=RELEASE_VERSION={release}");
    println!("cargo:rerun-if-env-changed={RELEASE_VERSION_ENV}");
}

/// Emits `VERGEN_GIT_SHA` and `VERGEN_GIT_DIRTY`, the only git facts `build_info` reads.
fn emit_commit() -> anyhow::Result<()> {
    let git = Git2Builder::default().sha(false).dirty(true).build()?;
    Emitter::default()
        .fail_on_error()
        .add_instructions(&git)?
        .emit()
}
