use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::app::{App, SendOutcome};
use crate::providers::Backend;
use crate::services::SessionEvent;
use crate::ui::chat_view::ChatView;
use crate::ui::sidebar::{Confirm, DeleteOutcome, Sidebar};

const HELP: &str = "\
Commands:
  /stop             Stop the current reply
  /new              Start a new conversation
  /list             Show conversations
  /open <n|id>      Open a conversation
  /delete <n|id>    Delete a conversation
  /models           Show available models
  /help             Show this help
  /quit             Exit
Anything else is sent as a message. Sending while a reply streams stops it.";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Send,
    Stop,
    New,
    List,
    Open(&'a str),
    Delete(&'a str),
    Models,
    Help,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if !line.starts_with('/') {
            return Command::Send;
        }

        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (line, ""),
        };

        match name {
            "/stop" => Command::Stop,
            "/new" => Command::New,
            "/list" | "/ls" => Command::List,
            "/open" => Command::Open(arg),
            "/delete" | "/rm" => Command::Delete(arg),
            "/models" => Command::Models,
            "/help" | "/h" | "/?" => Command::Help,
            "/quit" | "/exit" | "/q" => Command::Quit,
            _ => Command::Unknown(name),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Asks on the chat view and reads the answer from the input lines.
struct LinePrompt<'a, R, W: Write> {
    lines: &'a mut Lines<R>,
    view: &'a mut ChatView<W>,
}

#[async_trait]
impl<'a, R, W> Confirm for LinePrompt<'a, R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    async fn confirm(&mut self, prompt: &str) -> bool {
        if self.view.notice(&format!("{} [y/N]", prompt)).is_err() {
            return false;
        }
        match self.lines.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

/// Terminal front-end: owns the app and drives it from user input and
/// stream events.
pub struct Repl<W: Write> {
    app: App,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    sidebar: Sidebar,
    view: ChatView<W>,
    backend: Option<Arc<Backend>>,
    list_refresh: Option<Duration>,
}

impl<W: Write + Send> Repl<W> {
    pub fn new(app: App, events: mpsc::UnboundedReceiver<SessionEvent>, out: W) -> Self {
        Self {
            app,
            events,
            sidebar: Sidebar::new(),
            view: ChatView::new(out),
            backend: None,
            list_refresh: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_list_refresh(mut self, interval: Option<Duration>) -> Self {
        self.list_refresh = interval;
        self
    }

    /// Run until `/quit` or end of input, then flush pending saves.
    pub async fn run<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut lines = input.lines();
        let mut poll = self.list_refresh.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        self.sidebar.on_refresh_trigger(&self.app).await;

        loop {
            let save_deadline = self.app.next_save_deadline();

            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        break;
                    };
                    if self.handle_line(&line, &mut lines).await? == Flow::Quit {
                        break;
                    }
                }
                Some(event) = self.events.recv() => {
                    let update = self.app.handle_session_event(event).await;
                    self.view.apply(&update)?;
                }
                _ = async {
                    if let Some(deadline) = save_deadline {
                        tokio::time::sleep_until(deadline).await;
                    }
                }, if save_deadline.is_some() => {
                    self.app.flush_due_saves(Instant::now()).await;
                }
                _ = async {
                    match poll.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }, if poll.is_some() => {
                    tracing::debug!("Polling conversation list");
                    let _ = self.sidebar.refresh(&self.app).await;
                }
            }

            self.sidebar.on_refresh_trigger(&self.app).await;
        }

        self.view.stopped()?;
        self.app.shutdown().await;
        Ok(())
    }

    async fn handle_line<R>(&mut self, line: &str, lines: &mut Lines<R>) -> Result<Flow>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }

        match Command::parse(line) {
            Command::Send => match self.app.send_message(line).await {
                SendOutcome::Started => self.view.begin_reply()?,
                SendOutcome::Stopped => self.view.stopped()?,
                SendOutcome::Blocked => {
                    if let Some(error) = &self.app.state().error {
                        self.view.error(error)?;
                    }
                }
                SendOutcome::Ignored => {}
            },
            Command::Stop => {
                let waiting = self.app.state().is_loading();
                if self.app.stop_streaming() {
                    self.view.stopped()?;
                    if waiting {
                        self.view.notice("Stopped before any reply arrived.")?;
                    }
                }
            }
            Command::New => {
                self.app.clear_messages();
                self.view.stopped()?;
                self.view.notice("Started a new conversation.")?;
            }
            Command::List => {
                if self.sidebar.refresh(&self.app).await.is_err() {
                    self.view.error("Failed to list conversations.")?;
                }
                let listing = self.sidebar.render(self.current_id());
                self.view.notice(listing.trim_end())?;
            }
            Command::Open(key) => {
                let Some(id) = self.sidebar.resolve(key, self.current_id()) else {
                    self.view.notice("Usage: /open <number|id> (see /list)")?;
                    return Ok(Flow::Continue);
                };
                self.app.load_conversation(&id).await;
                self.view.stopped()?;
                let state = self.app.state();
                match &state.error {
                    Some(error) => self.view.error(error)?,
                    None => self
                        .view
                        .show_history(state.title.as_deref(), &state.messages)?,
                }
            }
            Command::Delete(key) => {
                let Some(id) = self.sidebar.resolve(key, self.current_id()) else {
                    self.view.notice("Usage: /delete <number|id> (see /list)")?;
                    return Ok(Flow::Continue);
                };
                let mut prompt = LinePrompt {
                    lines,
                    view: &mut self.view,
                };
                let outcome = self.sidebar.delete(&id, &mut self.app, &mut prompt).await;
                match outcome {
                    DeleteOutcome::Cancelled => {}
                    DeleteOutcome::Deleted { was_active } => {
                        if was_active {
                            self.view.stopped()?;
                        }
                        self.view.notice("Conversation deleted.")?;
                    }
                    DeleteOutcome::Failed(message) => self.view.error(&message)?,
                }
            }
            Command::Models => self.show_models().await?,
            Command::Help => self.view.notice(HELP)?,
            Command::Quit => return Ok(Flow::Quit),
            Command::Unknown(name) => {
                self.view
                    .notice(&format!("Unknown command: {} (try /help)", name))?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn show_models(&mut self) -> Result<()> {
        let Some(backend) = &self.backend else {
            self.view.notice("No model catalog available.")?;
            return Ok(());
        };

        match backend.list_models().await {
            Ok(models) if models.is_empty() => self.view.notice("No models available.")?,
            Ok(models) => {
                let listing = models
                    .iter()
                    .map(|m| format!("  {}/{}  {}", m.provider, m.id, m.name))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.view.notice(&listing)?;
            }
            Err(e) => {
                tracing::warn!("Failed to list models: {:#}", e);
                self.view.error("Failed to list models.")?;
            }
        }
        Ok(())
    }

    fn current_id(&self) -> Option<&str> {
        self.app.state().conversation_id.as_deref()
    }
}
