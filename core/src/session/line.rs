//! Minimal line assembly over raw terminal keystrokes.
//!
//! This is not a terminal emulator: escape sequences are dropped and tab
//! completion performed by the remote shell is invisible here, so recorded
//! commands are best-effort.

const BACKSPACE: char = '\x7f';
const CTRL_H: char = '\x08';
const CTRL_C: char = '\x03';
const CTRL_U: char = '\x15';
const ESC: char = '\x1b';

/// Result of feeding keystrokes into a line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineEdit {
    /// Bytes to echo back to the viewers.
    pub echo: String,
    /// Lines completed by Enter, in order. Blank lines are skipped.
    pub submitted: Vec<String>,
    pub interrupted: bool,
}

/// Feeds `input` into `line`, returning what to echo and any submitted lines.
pub fn edit_line(line: &mut String, input: &str) -> LineEdit {
    let mut edit = LineEdit::default();
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' | '\n' => {
                // Treat CRLF as a single Enter.
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                edit.echo.push_str("\r\n");
                let submitted = std::mem::take(line);
                let trimmed = submitted.trim();
                if !trimmed.is_empty() {
                    edit.submitted.push(trimmed.to_string());
                }
            }
            BACKSPACE | CTRL_H => {
                if line.pop().is_some() {
                    edit.echo.push_str("\x08 \x08");
                }
            }
            CTRL_C => {
                line.clear();
                edit.interrupted = true;
                edit.echo.push_str("^C\r\n");
            }
            CTRL_U => {
                for _ in 0..line.chars().count() {
                    edit.echo.push_str("\x08 \x08");
                }
                line.clear();
            }
            ESC => {
                skip_escape(&mut chars);
            }
            c if c.is_control() => {}
            c => {
                line.push(c);
                edit.echo.push(c);
            }
        }
    }
    edit
}

/// Skips the remainder of a CSI or SS3 sequence whose ESC was consumed.
fn skip_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    match chars.peek() {
        Some('[') => {
            chars.next();
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
        }
        Some('O') => {
            chars.next();
            chars.next();
        }
        _ => {}
    }
}
