use std::io::{self, Write};

use crate::app::AppUpdate;
use crate::models::{Message, Role};

/// Prints the message log and streamed replies to a terminal.
pub struct ChatView<W: Write> {
    out: W,
    /// A reply is being written on the current line.
    streaming: bool,
    /// Nothing has been written on the current line yet.
    at_line_start: bool,
}

impl<W: Write> ChatView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            streaming: false,
            at_line_start: true,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Redraw a whole conversation, e.g. after loading one.
    pub fn show_history(&mut self, title: Option<&str>, messages: &[Message]) -> io::Result<()> {
        self.end_line()?;
        if let Some(title) = title {
            writeln!(self.out, "== {} ==", title)?;
        }
        for message in messages {
            writeln!(self.out, "{}> {}", label(message.role), message.content)?;
        }
        self.out.flush()
    }

    pub fn begin_reply(&mut self) -> io::Result<()> {
        self.end_line()?;
        write!(self.out, "{}> ", label(Role::Assistant))?;
        self.streaming = true;
        self.at_line_start = false;
        self.out.flush()
    }

    pub fn apply(&mut self, update: &AppUpdate) -> io::Result<()> {
        match update {
            AppUpdate::Ignored => return Ok(()),
            AppUpdate::Delta(text) => {
                if !self.streaming {
                    self.begin_reply()?;
                }
                write!(self.out, "{}", text)?;
                if !text.is_empty() {
                    self.at_line_start = text.ends_with('\n');
                }
            }
            AppUpdate::Completed => {
                self.end_line()?;
                self.streaming = false;
            }
            AppUpdate::Aborted => {
                self.stopped()?;
            }
            AppUpdate::Failed(message) => {
                self.end_line()?;
                self.streaming = false;
                writeln!(self.out, "error: {}", message)?;
            }
        }
        self.out.flush()
    }

    /// The user stopped the reply; whatever arrived stays on screen.
    pub fn stopped(&mut self) -> io::Result<()> {
        if self.streaming {
            if !self.at_line_start {
                write!(self.out, " ")?;
            }
            writeln!(self.out, "[stopped]")?;
            self.streaming = false;
            self.at_line_start = true;
        }
        self.out.flush()
    }

    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        self.end_line()?;
        writeln!(self.out, "{}", text)?;
        self.out.flush()
    }

    pub fn error(&mut self, message: &str) -> io::Result<()> {
        self.notice(&format!("error: {}", message))
    }

    fn end_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            writeln!(self.out)?;
            self.at_line_start = true;
        }
        Ok(())
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        other => other.as_str(),
    }
}
