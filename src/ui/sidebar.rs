use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use crate::app::App;
use crate::models::ConversationSummary;
use crate::services::conversation::{dedupe_by_id, sort_for_sidebar};
use crate::services::PersistenceError;

pub const DELETE_FAILED_MESSAGE: &str = "Failed to delete conversation.";

/// Yes/no prompt shown before destructive actions.
#[async_trait]
pub trait Confirm: Send {
    async fn confirm(&mut self, prompt: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SidebarItem {
    Header(&'static str),
    Conversation {
        /// 1-based, as typed after `/open` and `/delete`.
        number: usize,
        summary: ConversationSummary,
        active: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Cancelled,
    Deleted { was_active: bool },
    Failed(String),
}

/// The conversation list, refreshed whenever the app's list revision moves.
#[derive(Debug, Default)]
pub struct Sidebar {
    conversations: Vec<ConversationSummary>,
    seen_revision: Option<u64>,
}

impl Sidebar {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    /// Reload from the store. On failure the previous list stays.
    pub async fn refresh(&mut self, app: &App) -> Result<(), PersistenceError> {
        self.seen_revision = Some(app.list_revision());

        let rows = app.sync().list().await.map_err(|e| {
            tracing::warn!("Failed to list conversations: {}", e);
            e
        })?;

        let (unique, duplicates) = dedupe_by_id(rows);
        if !duplicates.is_empty() {
            tracing::warn!(
                "Conversation list contains duplicate ids: {}",
                duplicates.join(", ")
            );
        }

        tracing::debug!("Conversation list refreshed: {} entries", unique.len());
        self.conversations = unique;
        Ok(())
    }

    /// Refresh only when the trigger changed since the last refresh.
    pub async fn on_refresh_trigger(&mut self, app: &App) -> bool {
        if self.seen_revision == Some(app.list_revision()) {
            return false;
        }
        self.refresh(app).await.is_ok()
    }

    /// Display order: current conversation first, then most recent.
    pub fn ordered(&self, current_id: Option<&str>) -> Vec<ConversationSummary> {
        let mut rows = self.conversations.clone();
        sort_for_sidebar(&mut rows, current_id);
        rows
    }

    /// Accept a list number (as rendered) or a literal conversation id.
    pub fn resolve(&self, key: &str, current_id: Option<&str>) -> Option<String> {
        let key = key.trim();
        if let Ok(number) = key.parse::<usize>() {
            if let Some(row) = number
                .checked_sub(1)
                .and_then(|idx| self.ordered(current_id).into_iter().nth(idx))
            {
                return Some(row.id);
            }
        }
        self.conversations
            .iter()
            .find(|c| c.id == key)
            .map(|c| c.id.clone())
    }

    pub async fn delete(
        &mut self,
        id: &str,
        app: &mut App,
        confirm: &mut dyn Confirm,
    ) -> DeleteOutcome {
        let title = self
            .conversations
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.title.as_str())
            .unwrap_or(id);
        let prompt = format!("Delete conversation \"{}\"?", title);
        if !confirm.confirm(&prompt).await {
            return DeleteOutcome::Cancelled;
        }

        if let Err(e) = app.sync_mut().remove(id).await {
            tracing::error!("Failed to delete conversation {}: {}", id, e);
            return DeleteOutcome::Failed(DELETE_FAILED_MESSAGE.to_string());
        }

        self.conversations.retain(|c| c.id != id);

        let was_active = app.state().conversation_id.as_deref() == Some(id);
        if was_active {
            app.clear_messages();
        }
        DeleteOutcome::Deleted { was_active }
    }

    pub fn items(&self, current_id: Option<&str>, now: DateTime<Utc>) -> Vec<SidebarItem> {
        let mut items = Vec::new();
        let mut last_header = None;

        for (idx, summary) in self.ordered(current_id).into_iter().enumerate() {
            let active = current_id == Some(summary.id.as_str());
            let header = if active {
                "Current"
            } else {
                summary
                    .updated_at
                    .map(|ts| date_group(&ts, &now))
                    .unwrap_or("Older")
            };
            if last_header != Some(header) {
                items.push(SidebarItem::Header(header));
                last_header = Some(header);
            }
            items.push(SidebarItem::Conversation {
                number: idx + 1,
                summary,
                active,
            });
        }

        items
    }

    pub fn render(&self, current_id: Option<&str>) -> String {
        let items = self.items(current_id, Utc::now());
        if items.is_empty() {
            return "No conversations yet.\n".to_string();
        }

        let mut out = String::new();
        for item in items {
            match item {
                SidebarItem::Header(label) => {
                    let _ = writeln!(out, "{}", label);
                }
                SidebarItem::Conversation {
                    number,
                    summary,
                    active,
                } => {
                    let marker = if active { '*' } else { ' ' };
                    let _ = writeln!(out, " {} {:>2}. {}", marker, number, summary.title);
                }
            }
        }
        out
    }
}

fn date_group(dt: &DateTime<Utc>, now: &DateTime<Utc>) -> &'static str {
    let today = now.date_naive();
    let date = dt.date_naive();

    if date == today {
        "Today"
    } else if Some(date) == today.pred_opt() {
        "Yesterday"
    } else if date.iso_week() == today.iso_week() {
        "This Week"
    } else {
        "Older"
    }
}
