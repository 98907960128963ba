pub mod chat_view;
pub mod repl;
pub mod sidebar;
