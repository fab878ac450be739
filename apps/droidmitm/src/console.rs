use colored::{Color, Colorize};

/// Severity colors for console output. Built once at startup and passed by
/// value; a disabled palette returns text untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    enabled: bool,
}

impl Palette {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    #[cfg(test)]
    pub fn plain() -> Self {
        Self::new(false)
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.enabled {
            text.color(color).to_string()
        } else {
            text.to_string()
        }
    }

    pub fn ok(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Color::Green)
    }

    pub fn warn(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Color::Yellow)
    }

    pub fn error(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Color::Red)
    }

    pub fn info(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Color::Cyan)
    }
}
