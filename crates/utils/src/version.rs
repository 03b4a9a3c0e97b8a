use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Version string reported by both plugin binaries, e.g. `v0.3.1-1a2b3c4d-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("RELEASE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.git_dirty,
    )
});

fn format_version(release: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha.map(|s| &s[..s.len().min(8)]).unwrap_or("unknown");
    format!(
        "{release}-{sha}{}",
        if dirty { "-dirty" } else { "" }
    )
}
