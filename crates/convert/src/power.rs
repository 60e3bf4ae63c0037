//! Best-effort sleep inhibition while a conversion runs.
//!
//! Failures are logged and swallowed; a conversion never aborts because the
//! OS refused the request.

/// Two idempotent operations bracketing the span where the machine must
/// stay awake.
pub trait PowerGuard {
    fn inhibit(&mut self);
    fn release(&mut self);
}

/// Explicit no-capability guard, for tests and headless containers.
pub struct NoopPower;

impl PowerGuard for NoopPower {
    fn inhibit(&mut self) {}
    fn release(&mut self) {}
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use tracing::{debug, warn};

        const ES_CONTINUOUS: u32 = 0x8000_0000;
        const ES_SYSTEM_REQUIRED: u32 = 0x0000_0001;

        #[link(name = "kernel32")]
        extern "system" {
            fn SetThreadExecutionState(es_flags: u32) -> u32;
        }

        /// Keeps the machine awake via `SetThreadExecutionState`. The
        /// request is thread-scoped, so both operations must run on the
        /// worker thread.
        pub struct SystemPower {
            inhibited: bool,
        }

        impl SystemPower {
            pub fn new() -> Self {
                Self { inhibited: false }
            }
        }

        impl Default for SystemPower {
            fn default() -> Self {
                Self::new()
            }
        }

        impl PowerGuard for SystemPower {
            fn inhibit(&mut self) {
                if self.inhibited {
                    return;
                }
                let granted =
                    unsafe { SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED) };
                if granted == 0 {
                    warn!("could not prevent system sleep during conversion");
                } else {
                    debug!("system asked not to sleep");
                    self.inhibited = true;
                }
            }

            fn release(&mut self) {
                if !self.inhibited {
                    return;
                }
                let granted = unsafe { SetThreadExecutionState(ES_CONTINUOUS) };
                if granted == 0 {
                    warn!("could not restore system sleep settings");
                } else {
                    debug!("system allowed to sleep again");
                }
                self.inhibited = false;
            }
        }
    } else if #[cfg(target_os = "macos")] {
        use std::process::{Child, Command, Stdio};
        use tracing::{debug, warn};

        /// Holds a `caffeinate -i` child for the span of the inhibition.
        pub struct SystemPower {
            assertion: Option<Child>,
        }

        impl SystemPower {
            pub fn new() -> Self {
                Self { assertion: None }
            }
        }

        impl Default for SystemPower {
            fn default() -> Self {
                Self::new()
            }
        }

        impl PowerGuard for SystemPower {
            fn inhibit(&mut self) {
                if self.assertion.is_some() {
                    return;
                }
                match Command::new("caffeinate")
                    .arg("-i")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    Ok(child) => {
                        debug!(pid = child.id(), "caffeinate started");
                        self.assertion = Some(child);
                    }
                    Err(e) => warn!("could not prevent system sleep during conversion: {e}"),
                }
            }

            fn release(&mut self) {
                if let Some(mut child) = self.assertion.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!("caffeinate stopped");
                }
            }
        }

        impl Drop for SystemPower {
            fn drop(&mut self) {
                self.release();
            }
        }
    } else {
        /// Sleep inhibition is not available on this platform.
        pub struct SystemPower;

        impl SystemPower {
            pub fn new() -> Self {
                Self
            }
        }

        impl Default for SystemPower {
            fn default() -> Self {
                Self::new()
            }
        }

        impl PowerGuard for SystemPower {
            fn inhibit(&mut self) {}
            fn release(&mut self) {}
        }
    }
}
