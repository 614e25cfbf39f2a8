//! Version strings for the tusk binary.
//!
//! Release builds may set `TUSK_GIT_REV` at compile time; the revision is then
//! appended to the version.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("TUSK_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

static SERVER_NAME: LazyLock<String> = LazyLock::new(|| format!("tusk/{}", PKG_VERSION));

/// Version for clap's `version` attribute.
pub fn clap_version() -> &'static str {
    PKG_VERSION
}

/// `"X.Y.Z (rev)"` when a git revision is known, otherwise `"X.Y.Z"`.
///
/// # Examples
///
/// ```
/// use tusk::version::long_version;
///
/// assert!(long_version().starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

/// Value for the `Server` response header, e.g. `tusk/0.1.0`.
pub fn server_name() -> &'static str {
    SERVER_NAME.as_str()
}
