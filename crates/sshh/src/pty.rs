//! Pseudo-terminal descriptors and window geometry.

/// Terminal mode opcode, re-exported from the transport. Mode payloads are
/// carried opaquely; the framework never interprets them.
pub use russh::Pty as TerminalMode;

/// Terminal window geometry from a `pty-req` or `window-change` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Width in columns.
    pub cols: u32,
    /// Height in rows.
    pub rows: u32,
    /// Width in pixels, zero if unspecified.
    pub width_px: u32,
    /// Height in pixels, zero if unspecified.
    pub height_px: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// A pseudo-terminal accepted for a session.
///
/// The descriptor is created when a `pty-req` is accepted and its window is
/// kept current as `window-change` requests arrive. Window updates are also
/// streamed through the channel returned by
/// [`Session::window_changes`](crate::Session::window_changes), which always
/// holds at least the initial window.
#[derive(Debug, Clone)]
pub struct Pty {
    /// Terminal type, e.g. `xterm-256color`.
    pub term: String,
    /// Current window geometry.
    pub window: Window,
    /// Encoded terminal modes, opaque to the framework.
    pub modes: Vec<(TerminalMode, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_default() {
        let window = Window::default();
        assert_eq!(window.cols, 80);
        assert_eq!(window.rows, 24);
        assert_eq!(window.width_px, 0);
    }

    #[test]
    fn test_pty_window_update() {
        let mut pty = Pty {
            term: "xterm".to_string(),
            window: Window::default(),
            modes: Vec::new(),
        };
        pty.window = Window {
            cols: 120,
            rows: 40,
            width_px: 0,
            height_px: 0,
        };
        assert_eq!(pty.window.cols, 120);
        assert_eq!(pty.term, "xterm");
    }
}
