pub mod kill;
pub mod media_tool;
pub mod monitor;
pub mod process;
pub mod window;

pub use monitor::MonitorRect;
pub use process::{CommandSpec, DiagnosticLines, NextLine, ProcessHandle, ProcessState};
pub use window::{DesktopWindows, WindowTitleSource};
