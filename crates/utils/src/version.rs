//! Version string reported on the command line.

use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// `<image version>-<short sha>[-dirty]`, with `latest` and `unknown` filling
/// in outside release builds.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let dirty = if BUILD_INFO.git_dirty { "-dirty" } else { "" };
    format!(
        "{}-{}{dirty}",
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1.unwrap_or("unknown")
    )
});
