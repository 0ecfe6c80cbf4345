//! Git metadata captured by `build.rs`; absent when built outside a checkout.

use std::sync::LazyLock;

pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) static BUILD_INFO: LazyLock<BuildInfo> = LazyLock::new(|| BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA").map(|sha| sha.get(..7).unwrap_or(sha)),
    git_dirty: option_env!("VERGEN_GIT_DIRTY") == Some("true"),
});
