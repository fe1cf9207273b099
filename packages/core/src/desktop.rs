//! Desktop side effects requested after a successful mount.

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::executor::CommandRunner;

/// Hooks into the desktop environment around the core.
pub trait DesktopHooks: Send + Sync {
    /// Opens `mount_point` in the file browser.
    fn reveal(&self, mount_point: &Path) -> Result<()>;

    /// Brings the application window to the front.
    fn activate(&self) -> Result<()>;
}

/// Headless consumers: every hook is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDesktop;

impl DesktopHooks for NoDesktop {
    fn reveal(&self, mount_point: &Path) -> Result<()> {
        debug!("not revealing {} (headless)", mount_point.display());
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        Ok(())
    }
}

/// Uses `open` (macOS) or `xdg-open` to reveal, and AppleScript to activate
/// the named application.
pub struct SystemDesktop {
    runner: Arc<dyn CommandRunner>,
    app_name: Option<String>,
}

impl SystemDesktop {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            app_name: None,
        }
    }

    /// Sets the application raised by [`DesktopHooks::activate`].
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    fn opener() -> &'static str {
        if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        }
    }
}

impl DesktopHooks for SystemDesktop {
    fn reveal(&self, mount_point: &Path) -> Result<()> {
        let path = mount_point.to_string_lossy();
        self.runner.run(Self::opener(), &[path.as_ref()])?;
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        let Some(app) = &self.app_name else {
            return Ok(());
        };
        let script = format!("tell application \"{}\" to activate", app.replace('"', ""));
        self.runner.run("osascript", &["-e", &script])?;
        Ok(())
    }
}
