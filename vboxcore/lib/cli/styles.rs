use std::{fmt::Write, io::IsTerminal, sync::LazyLock};

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Whether stdout is an interactive terminal that understands ANSI escapes.
static IS_ANSI_TERMINAL: LazyLock<bool> = LazyLock::new(|| {
    std::io::stdout().is_terminal()
        && std::env::var("TERM").map_or(true, |term| term != "dumb")
        && std::env::var_os("NO_COLOR").is_none()
});

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] palette to text printed by the CLI.
pub trait AnsiStyles {
    /// Table headers.
    fn header(&self) -> String;

    /// Names and identifiers.
    fn literal(&self) -> String;

    /// Secondary values.
    fn placeholder(&self) -> String;

    /// Failures.
    fn error(&self) -> String;

    /// Healthy states.
    fn valid(&self) -> String;

    /// Unhealthy states.
    fn invalid(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a `Styles` object with the default styles for the CLI.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}

fn apply_style(text: &str, style: &Style) -> String {
    paint(text, style, *IS_ANSI_TERMINAL)
}

fn paint(text: &str, style: &Style, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }

    let mut styled = String::with_capacity(text.len() + 20);
    let _ = write!(styled, "{style}");
    styled.push_str(text);
    let _ = write!(styled, "{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {
    fn header(&self) -> String {
        apply_style(self.as_ref(), styles().get_header())
    }

    fn literal(&self) -> String {
        apply_style(self.as_ref(), styles().get_literal())
    }

    fn placeholder(&self) -> String {
        apply_style(self.as_ref(), styles().get_placeholder())
    }

    fn error(&self) -> String {
        apply_style(self.as_ref(), styles().get_error())
    }

    fn valid(&self) -> String {
        apply_style(self.as_ref(), styles().get_valid())
    }

    fn invalid(&self) -> String {
        apply_style(self.as_ref(), styles().get_invalid())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_disabled_is_plain() {
        assert_eq!(paint("n1", styles().get_literal(), false), "n1");
        assert_eq!(paint("", styles().get_error(), false), "");
    }

    #[test]
    fn test_paint_enabled_wraps_in_escapes() {
        let header = paint("NAME", styles().get_header(), true);
        assert!(header.contains("\x1b[1m"));
        assert!(header.contains("\x1b[33m"));
        assert!(header.contains("NAME"));
        assert!(header.ends_with("\x1b[0m"));

        let placeholder = paint("10.0.2.15", styles().get_placeholder(), true);
        assert!(placeholder.contains("\x1b[32m"));
        assert!(!placeholder.contains("\x1b[1m"));
    }
}
