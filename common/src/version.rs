//! Build version information.

/// The git description of the tree this binary was built from.
pub const GIT_VERSION: &str = git_version::git_version!(
    args = ["--always", "--dirty=-modified", "--tags"],
    fallback = "unknown"
);

/// Human readable product version, `<crate version> (<git description>)`.
#[must_use]
pub fn product_version() -> String {
    format!("{} ({GIT_VERSION})", env!("CARGO_PKG_VERSION"))
}
