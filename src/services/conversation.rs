use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::ConversationSummary;

const TITLE_MAX_CHARS: usize = 30;

/// Derive a conversation title from the first message: the first 30 characters
/// followed by an ellipsis when the text is longer, otherwise the text as-is.
pub fn truncate_title(text: &str) -> String {
    match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((boundary, _)) => format!("{}...", &text[..boundary]),
        None => text.to_string(),
    }
}

/// Collapse rows sharing an id. The last occurrence's data wins and sits where
/// the id first appeared. Returns the ids that were duplicated.
pub fn dedupe_by_id(rows: Vec<ConversationSummary>) -> (Vec<ConversationSummary>, Vec<String>) {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ConversationSummary> = Vec::with_capacity(rows.len());
    let mut duplicates: Vec<String> = Vec::new();

    for row in rows {
        match positions.get(&row.id) {
            Some(&idx) => {
                if !duplicates.contains(&row.id) {
                    duplicates.push(row.id.clone());
                }
                unique[idx] = row;
            }
            None => {
                positions.insert(row.id.clone(), unique.len());
                unique.push(row);
            }
        }
    }

    (unique, duplicates)
}

/// Current conversation first, then most recently updated. Rows without a
/// timestamp go last; ties keep their incoming order.
pub fn sort_for_sidebar(rows: &mut [ConversationSummary], current_id: Option<&str>) {
    rows.sort_by(|a, b| {
        let a_current = current_id == Some(a.id.as_str());
        let b_current = current_id == Some(b.id.as_str());
        match (a_current, b_current) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match (a.updated_at, b.updated_at) {
            (Some(a_ts), Some(b_ts)) => b_ts.cmp(&a_ts),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
}
