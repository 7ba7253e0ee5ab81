//! Best-effort process naming, visible in `ps` and `top`.

pub trait ProcessNamer: Send + Sync {
    fn set_name(&self, name: &str);
}

/// Leaves the process name alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNamer;

impl ProcessNamer for NoopNamer {
    fn set_name(&self, _name: &str) {}
}

/// Sets the kernel thread name with `prctl(PR_SET_NAME)`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct PrctlNamer;

#[cfg(target_os = "linux")]
impl ProcessNamer for PrctlNamer {
    fn set_name(&self, name: &str) {
        // the kernel keeps 15 bytes
        let mut end = name.len().min(15);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let Ok(cname) = std::ffi::CString::new(&name[..end]) else {
            return;
        };
        if let Err(e) = nix::sys::prctl::set_name(&cname) {
            tracing::debug!(error = %e, "cannot set process name");
        }
    }
}

/// The best namer available on this platform.
pub fn platform_namer() -> Box<dyn ProcessNamer> {
    #[cfg(target_os = "linux")]
    {
        Box::new(PrctlNamer)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NoopNamer)
    }
}
