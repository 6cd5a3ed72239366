//! Elevation check for tun mode, which needs to create a network interface.

/// Whether the process runs with administrative rights. `None` when the
/// platform offers no cheap way to tell.
pub fn is_elevated() -> Option<bool> {
    #[cfg(unix)]
    {
        Some(nix::unistd::Uid::effective().is_root())
    }
    #[cfg(not(unix))]
    {
        None
    }
}
