//! Color theming for CLI output.
//!
//! Colors are disabled with `--no-color` or `NO_COLOR`; every helper then
//! returns unstyled output.

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable colors for owo_colors text and comfy_table cells.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    /// Monitored operation and task names
    Operation,
    /// Durations, sizes and counts
    Number,
    /// Values that need attention (slow tasks)
    Alert,
}

/// comfy_table color of a category, `None` when colors are off.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::Operation => comfy_table::Color::Cyan,
        Semantic::Number => comfy_table::Color::Green,
        Semantic::Alert => comfy_table::Color::Red,
    })
}

pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

fn paint<T: owo_colors::OwoColorize + std::fmt::Display + ?Sized>(
    value: &T,
    color: owo_colors::AnsiColors,
) -> String {
    if colors_enabled() {
        owo_colors::OwoColorize::color(value, color).to_string()
    } else {
        value.to_string()
    }
}

/// Colors of the worker-control output.
pub trait Themed: owo_colors::OwoColorize + std::fmt::Display {
    fn host(&self) -> String {
        paint(self, owo_colors::AnsiColors::Cyan)
    }

    /// A pool that answers.
    fn success(&self) -> String {
        paint(self, owo_colors::AnsiColors::Green)
    }

    /// A pool that does not.
    fn failure(&self) -> String {
        paint(self, owo_colors::AnsiColors::Red)
    }
}

impl<T: owo_colors::OwoColorize + std::fmt::Display + ?Sized> Themed for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_disabled_colors_are_plain() {
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("node7".host(), "node7");
        assert_eq!("running".success(), "running");
        assert!(table_color(Semantic::Operation).is_none());
    }
}
